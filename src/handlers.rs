use crate::database::{MovieDb, UserDb};
use crate::error::{Error, Result};
use crate::flash::{self, Flash};
use crate::model::*;
use crate::omdb::MetadataProvider;
use actix_web::dev::ServiceResponse;
use actix_web::http::StatusCode;
use actix_web::middleware::{ErrorHandlerResponse, ErrorHandlers};
use actix_web::{error, web, HttpRequest, HttpResponse};
use log::{error, info, warn};
use serde::Deserialize;

type Tera = web::Data<tera::Tera>;
type Db = web::Data<sled::Db>;
type Provider = web::Data<dyn MetadataProvider>;

const UNAUTHORIZED_MESSAGE: &str = "Unauthorized: movie does not belong to this user";

pub fn load_templates() -> std::result::Result<tera::Tera, tera::Error> {
    tera::Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*"))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/users", web::post().to(add_user))
        .service(
            web::resource("/users/{user_id}/movies")
                .route(web::get().to(show_movies))
                .route(web::post().to(add_movie)),
        )
        .route(
            "/users/{user_id}/movies/{movie_id}/update",
            web::post().to(update_movie),
        )
        .route(
            "/users/{user_id}/movies/{movie_id}/delete",
            web::post().to(delete_movie),
        )
        .default_service(web::to(not_found));
}

/// Replaces the bodies of 404 and 500 responses with the generic pages.
pub fn error_pages<B: 'static>() -> ErrorHandlers<B> {
    ErrorHandlers::new()
        .handler(StatusCode::NOT_FOUND, render_error_page)
        .handler(StatusCode::INTERNAL_SERVER_ERROR, render_error_page)
}

fn render_error_page<B>(res: ServiceResponse<B>) -> actix_web::Result<ErrorHandlerResponse<B>> {
    let status = res.status();
    let template = if status == StatusCode::NOT_FOUND {
        "404.html"
    } else {
        "500.html"
    };
    let mut ctx = tera::Context::new();
    ctx.insert("flash", &Option::<Flash>::None);
    let rendered = match res.request().app_data::<Tera>() {
        Some(tera) => tera
            .render(template, &ctx)
            .map_err(|err| error!("Could not render {}: {:?}", template, err))
            .ok(),
        None => None,
    };
    let body = rendered
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Error").to_owned());
    let (req, _) = res.into_parts();
    let response = HttpResponse::build(status)
        .content_type("text/html; charset=utf-8")
        .body(body);
    Ok(ErrorHandlerResponse::Response(
        ServiceResponse::new(req, response).map_into_right_body(),
    ))
}

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> error::Error {
    error!("{}: {:?}", message, err);
    error::ErrorInternalServerError(message)
}

fn render(
    req: &HttpRequest,
    tera: &tera::Tera,
    template: &str,
    mut ctx: tera::Context,
) -> actix_web::Result<HttpResponse> {
    let flash = flash::take(req);
    ctx.insert("flash", &flash);
    let body = tera
        .render(template, &ctx)
        .map_err(|err| log_error(err, "Template error"))?;
    let mut response = HttpResponse::Ok();
    response.content_type("text/html; charset=utf-8");
    if flash.is_some() {
        response.cookie(flash::removal());
    }
    Ok(response.body(body))
}

fn movies_location(user_id: u64) -> String {
    format!("/users/{}/movies", user_id)
}

/// Turns a failed operation into the message shown to the user.
fn failure(err: Error, storage_message: &'static str) -> Flash {
    match err {
        Error::Validation(message) => {
            warn!("Rejected input: {}", message);
            Flash::error(message)
        }
        Error::NotFound(_) => {
            warn!("{}", err);
            Flash::error(err.to_string())
        }
        Error::Unauthorized { .. } => {
            warn!("{}", err);
            Flash::error(UNAUTHORIZED_MESSAGE)
        }
        Error::Provider(_) => {
            error!("{}", err);
            Flash::error("Error fetching movie data.")
        }
        Error::Storage(_) => {
            error!("{}: {}", storage_message, err);
            Flash::error(storage_message)
        }
    }
}

#[derive(Deserialize)]
struct UserForm {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct TitleForm {
    #[serde(default)]
    title: String,
}

async fn index(req: HttpRequest, tera: Tera, db: Db) -> actix_web::Result<HttpResponse> {
    let users = db
        .get_users()
        .map_err(|err| log_error(err, "Database error"))?;
    let mut ctx = tera::Context::new();
    ctx.insert("users", &users);
    render(&req, &tera, "index.html", ctx)
}

async fn add_user(form: web::Form<UserForm>, db: Db) -> HttpResponse {
    let flash = match db.create_user(&form.name) {
        Ok(user) => {
            info!("Added user {} ({})", user.name, user.id);
            Flash::success(format!("User '{}' added successfully", user.name))
        }
        Err(err) => failure(err, "Error while adding user"),
    };
    flash::redirect("/", flash)
}

async fn show_movies(
    req: HttpRequest,
    path: web::Path<u64>,
    tera: Tera,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user_id = path.into_inner();
    let user = match db
        .get_user(user_id)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(user) => user,
        None => return Ok(flash::redirect("/", Flash::error("User not found"))),
    };
    let movies = db
        .get_movies(user_id)
        .map_err(|err| log_error(err, "Database error"))?;
    let mut ctx = tera::Context::new();
    ctx.insert("user", &user);
    ctx.insert("movies", &movies);
    render(&req, &tera, "movies.html", ctx)
}

/// Looks the title up and stores the match for the user.
///
/// The lookup finishes before the database transaction starts, so a failed
/// or timed out request never leaves a partial record behind.
async fn fetch_movie(
    db: &sled::Db,
    provider: &dyn MetadataProvider,
    user_id: u64,
    title: &str,
) -> Result<Option<Movie>> {
    let metadata = match provider.lookup(title).await? {
        Some(metadata) => metadata,
        None => return Ok(None),
    };
    let movie = db.add_movie(NewMovie {
        name: metadata.title,
        director: metadata.director,
        year: metadata.year,
        poster_url: metadata.poster_url,
        user_id,
    })?;
    Ok(Some(movie))
}

async fn add_movie(
    path: web::Path<u64>,
    form: web::Form<TitleForm>,
    db: Db,
    provider: Provider,
) -> HttpResponse {
    let user_id = path.into_inner();
    let location = movies_location(user_id);
    match db.get_user(user_id) {
        Ok(Some(_)) => {}
        Ok(None) => return flash::redirect("/", Flash::error("User not found")),
        Err(err) => {
            return flash::redirect(&location, failure(err, "Error while saving movie"));
        }
    }
    let title = form.title.trim();
    if title.is_empty() {
        return flash::redirect(&location, Flash::error("No title provided"));
    }
    let flash = match fetch_movie(&db, provider.get_ref(), user_id, title).await {
        Ok(Some(movie)) => {
            info!("Added movie {} ({}) for user {}", movie.name, movie.id, user_id);
            Flash::success(format!("Film '{}' added successfully.", movie.name))
        }
        Ok(None) => {
            warn!("No match for title {:?}", title);
            Flash::error(format!("Movie not found: {}", title))
        }
        Err(err) => failure(err, "Error while saving movie"),
    };
    flash::redirect(&location, flash)
}

/// Resolves a movie and checks that it belongs to `user_id`.
fn owned_movie(db: &sled::Db, user_id: u64, movie_id: u64) -> Result<Movie> {
    let movie = db
        .get_movie(movie_id)?
        .ok_or_else(|| Error::NotFound("Movie".to_owned()))?;
    if movie.user_id != user_id {
        return Err(Error::Unauthorized { movie_id, user_id });
    }
    Ok(movie)
}

fn rename_movie(db: &sled::Db, user_id: u64, movie_id: u64, title: &str) -> Result<Movie> {
    owned_movie(db, user_id, movie_id)?;
    db.update_movie(movie_id, title)?
        .ok_or_else(|| Error::NotFound("Movie".to_owned()))
}

fn remove_movie(db: &sled::Db, user_id: u64, movie_id: u64) -> Result<Movie> {
    owned_movie(db, user_id, movie_id)?;
    db.delete_movie(movie_id)?
        .ok_or_else(|| Error::NotFound("Movie".to_owned()))
}

async fn update_movie(
    path: web::Path<(u64, u64)>,
    form: web::Form<TitleForm>,
    db: Db,
) -> HttpResponse {
    let (user_id, movie_id) = path.into_inner();
    let flash = match rename_movie(&db, user_id, movie_id, &form.title) {
        Ok(movie) => {
            info!("Renamed movie {} to {}", movie.id, movie.name);
            Flash::success(format!("Movie renamed to '{}'", movie.name))
        }
        Err(err) => failure(err, "Error while updating movie"),
    };
    flash::redirect(&movies_location(user_id), flash)
}

async fn delete_movie(path: web::Path<(u64, u64)>, db: Db) -> HttpResponse {
    let (user_id, movie_id) = path.into_inner();
    let flash = match remove_movie(&db, user_id, movie_id) {
        Ok(movie) => {
            info!("Deleted movie {} ({})", movie.name, movie.id);
            Flash::success(format!("Movie '{}' deleted", movie.name))
        }
        Err(err) => failure(err, "Error while deleting movie"),
    };
    flash::redirect(&movies_location(user_id), flash)
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FLASH_COOKIE;
    use crate::omdb::{MovieMetadata, ProviderError};
    use actix_web::cookie::Cookie;
    use actix_web::http::header;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FakeProvider;

    #[async_trait]
    impl MetadataProvider for FakeProvider {
        async fn lookup(
            &self,
            title: &str,
        ) -> std::result::Result<Option<MovieMetadata>, ProviderError> {
            match title {
                "Inception" => Ok(Some(MovieMetadata {
                    title: "Inception".to_owned(),
                    year: Some(2010),
                    director: Some("Christopher Nolan".to_owned()),
                    poster_url: Some("http://example.com/inception.jpg".to_owned()),
                })),
                "Broken" => Err(ProviderError::Api("Request limit reached!".to_owned())),
                _ => Ok(None),
            }
        }
    }

    macro_rules! test_app {
        ($db:expr) => {
            test::init_service(
                App::new()
                    .wrap(error_pages())
                    .app_data(web::Data::new(load_templates().unwrap()))
                    .app_data(web::Data::new($db.clone()))
                    .app_data(web::Data::from(
                        Arc::new(FakeProvider) as Arc<dyn MetadataProvider>
                    ))
                    .configure(configure),
            )
            .await
        };
    }

    fn temporary_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn flash_of<B>(resp: &ServiceResponse<B>) -> Option<Flash> {
        resp.response()
            .cookies()
            .find(|cookie| cookie.name() == FLASH_COOKIE)
            .and_then(|cookie| Flash::decode(cookie.value()))
    }

    fn location_of<B>(resp: &ServiceResponse<B>) -> String {
        resp.headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned()
    }

    fn post(uri: &str, form: &[(&str, &str)]) -> test::TestRequest {
        test::TestRequest::post().uri(uri).set_form(form)
    }

    fn inception(user_id: u64) -> NewMovie {
        NewMovie {
            name: "Inception".to_owned(),
            director: Some("Christopher Nolan".to_owned()),
            year: Some(2010),
            poster_url: None,
            user_id,
        }
    }

    #[actix_rt::test]
    async fn create_user_and_list() {
        let db = temporary_db();
        let app = test_app!(db);

        let req = post("/users", &[("name", "Ada")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(location_of(&resp), "/");
        assert_eq!(
            flash_of(&resp),
            Some(Flash::success("User 'Ada' added successfully"))
        );

        let users = db.get_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Ada");

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert!(std::str::from_utf8(&body).unwrap().contains("Ada"));
    }

    #[actix_rt::test]
    async fn create_user_requires_name() {
        let db = temporary_db();
        let app = test_app!(db);

        for form in &[&[("name", "   ")][..], &[][..]] {
            let req = post("/users", form).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FOUND);
            assert_eq!(flash_of(&resp), Some(Flash::error("Please enter a name")));
        }
        assert!(db.get_users().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn unknown_user_redirects_home() {
        let db = temporary_db();
        let app = test_app!(db);

        let req = test::TestRequest::get().uri("/users/99/movies").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(location_of(&resp), "/");
        assert_eq!(flash_of(&resp), Some(Flash::error("User not found")));

        let req = post("/users/99/movies", &[("title", "Inception")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(location_of(&resp), "/");
        assert_eq!(flash_of(&resp), Some(Flash::error("User not found")));
        assert!(db.get_movies(99).unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn add_movie_stores_provider_fields() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies", ada.id);
        let req = post(&uri, &[("title", "Inception")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(location_of(&resp), uri);
        assert_eq!(
            flash_of(&resp),
            Some(Flash::success("Film 'Inception' added successfully."))
        );

        let movies = db.get_movies(ada.id).unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].name, "Inception");
        assert_eq!(movies[0].year, Some(2010));
        assert_eq!(movies[0].director.as_deref(), Some("Christopher Nolan"));
        assert_eq!(
            movies[0].poster_url.as_deref(),
            Some("http://example.com/inception.jpg")
        );
        assert_eq!(movies[0].user_id, ada.id);

        let req = test::TestRequest::get().uri(&uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert!(std::str::from_utf8(&body).unwrap().contains("Christopher Nolan"));
    }

    #[actix_rt::test]
    async fn add_movie_not_found_leaves_list_unchanged() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let existing = db.add_movie(inception(ada.id)).unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies", ada.id);
        let req = post(&uri, &[("title", "Zzzxxxnotreal")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(
            flash_of(&resp),
            Some(Flash::error("Movie not found: Zzzxxxnotreal"))
        );
        assert_eq!(db.get_movies(ada.id).unwrap(), vec![existing]);
    }

    #[actix_rt::test]
    async fn add_movie_provider_failure() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies", ada.id);
        let req = post(&uri, &[("title", "Broken")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error("Error fetching movie data.")));

        let req = post(&uri, &[("title", " ")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error("No title provided")));
        assert!(db.get_movies(ada.id).unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn update_movie_by_owner() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let movie = db.add_movie(inception(ada.id)).unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies/{}/update", ada.id, movie.id);
        let req = post(&uri, &[("title", "Origin")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(location_of(&resp), format!("/users/{}/movies", ada.id));
        assert_eq!(
            flash_of(&resp),
            Some(Flash::success("Movie renamed to 'Origin'"))
        );
        assert_eq!(db.get_movie(movie.id).unwrap().unwrap().name, "Origin");

        let req = post(&uri, &[("title", "")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error("No title provided")));
        assert_eq!(db.get_movie(movie.id).unwrap().unwrap().name, "Origin");
    }

    #[actix_rt::test]
    async fn update_movie_of_other_user_is_rejected() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let grace = db.create_user("Grace").unwrap();
        let movie = db.add_movie(inception(ada.id)).unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies/{}/update", grace.id, movie.id);
        let req = post(&uri, &[("title", "Hijacked")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(flash_of(&resp), Some(Flash::error(UNAUTHORIZED_MESSAGE)));
        assert_eq!(db.get_movie(movie.id).unwrap(), Some(movie));
    }

    #[actix_rt::test]
    async fn delete_movie_checks_owner() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let grace = db.create_user("Grace").unwrap();
        let movie = db.add_movie(inception(ada.id)).unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies/{}/delete", grace.id, movie.id);
        let req = post(&uri, &[]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error(UNAUTHORIZED_MESSAGE)));
        assert_eq!(db.get_movie(movie.id).unwrap(), Some(movie.clone()));

        let uri = format!("/users/{}/movies/{}/delete", ada.id, movie.id);
        let req = post(&uri, &[]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(
            flash_of(&resp),
            Some(Flash::success("Movie 'Inception' deleted"))
        );
        assert!(db.get_movies(ada.id).unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn missing_movie_is_reported() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let app = test_app!(db);

        let uri = format!("/users/{}/movies/12345/update", ada.id);
        let req = post(&uri, &[("title", "Other")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error("Movie not found")));

        let uri = format!("/users/{}/movies/12345/delete", ada.id);
        let req = post(&uri, &[]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(flash_of(&resp), Some(Flash::error("Movie not found")));
    }

    #[actix_rt::test]
    async fn flash_is_shown_once() {
        let db = temporary_db();
        let app = test_app!(db);

        let value = {
            let resp = flash::redirect("/", Flash::success("Hello there"));
            let cookie = resp
                .cookies()
                .find(|cookie| cookie.name() == FLASH_COOKIE)
                .unwrap();
            cookie.value().to_owned()
        };
        let req = test::TestRequest::get()
            .uri("/")
            .cookie(Cookie::new(FLASH_COOKIE, value))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let removal = resp
            .response()
            .cookies()
            .find(|cookie| cookie.name() == FLASH_COOKIE)
            .unwrap();
        assert_eq!(removal.value(), "");
        let body = test::read_body(resp).await;
        assert!(std::str::from_utf8(&body).unwrap().contains("Hello there"));
    }

    #[actix_rt::test]
    async fn unknown_route_renders_not_found_page() {
        let db = temporary_db();
        let app = test_app!(db);

        for uri in &["/nowhere", "/users/abc/movies"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            let body = test::read_body(resp).await;
            assert!(std::str::from_utf8(&body).unwrap().contains("Page not found"));
        }
    }

    #[actix_rt::test]
    async fn storage_failure_renders_generic_error_page() {
        let db = temporary_db();
        let id = 0u64.to_be_bytes();
        db.open_tree(b"users_name").unwrap().insert("Ada", &id[..]).unwrap();
        db.open_tree(b"users").unwrap().insert(&id[..], &[0xffu8][..]).unwrap();
        let app = test_app!(db);

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = test::read_body(resp).await;
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains("Something went wrong"));
        assert!(!body.contains("Database error"));
        assert!(!body.contains("Eof"));
    }

    #[::core::prelude::v1::test]
    fn storage_failure_flash_hides_details() {
        let err = bincode::deserialize::<User>(&[0xff]).unwrap_err();
        assert_eq!(
            failure(Error::from(err), "Error while adding user"),
            Flash::error("Error while adding user")
        );
    }

    #[actix_rt::test]
    async fn long_unknown_title_keeps_flash_small() {
        let db = temporary_db();
        let ada = db.create_user("Ada").unwrap();
        let app = test_app!(db);

        let title = "z".repeat(8_000);
        let uri = format!("/users/{}/movies", ada.id);
        let req = post(&uri, &[("title", title.as_str())]).to_request();
        let resp = test::call_service(&app, req).await;
        let cookie = resp
            .response()
            .cookies()
            .find(|cookie| cookie.name() == FLASH_COOKIE)
            .unwrap();
        assert!(cookie.value().len() < 4096);
        let flash = Flash::decode(cookie.value()).unwrap();
        assert!(flash.message.starts_with("Movie not found: zzz"));
        assert!(db.get_movies(ada.id).unwrap().is_empty());
    }
}
