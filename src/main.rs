mod config;
mod database;
mod error;
mod flash;
mod handlers;
mod model;
mod omdb;

use actix_web::{middleware::Logger, web, App, HttpServer};
use config::Config;
use omdb::{MetadataProvider, OmdbClient};
use std::sync::Arc;

#[actix_rt::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("moviweb=debug,actix_web=info"),
    )
    .init();

    let config = Config::from_env().map_err(|err| {
        log::error!("Invalid configuration: {}", err);
        err
    })?;

    let tera = web::Data::new(handlers::load_templates()?);
    let db = web::Data::new(sled::open(&config.database_path)?);
    let provider: Arc<dyn MetadataProvider> = Arc::new(OmdbClient::new(
        &config.omdb_url,
        &config.omdb_api_key,
        config.omdb_timeout,
    )?);
    let provider = web::Data::from(provider);

    log::info!(
        "Serving on http://{} with database {}",
        config.bind_address,
        config.database_path.display()
    );

    HttpServer::new(move || {
        App::new()
            .wrap(handlers::error_pages())
            .wrap(Logger::default())
            .app_data(tera.clone())
            .app_data(db.clone())
            .app_data(provider.clone())
            .configure(handlers::configure)
    })
    .bind(&config.bind_address)?
    .run()
    .await?;

    Ok(())
}
