use crate::omdb;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_path: PathBuf,
    pub omdb_url: String,
    pub omdb_api_key: String,
    pub omdb_timeout: Duration,
}

impl Config {
    /// Reads the configuration from the environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let omdb_api_key = lookup("OMDB_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("OMDB_API_KEY"))?;
        let omdb_timeout = match lookup("OMDB_TIMEOUT_SECS") {
            Some(value) => value
                .trim()
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid {
                    name: "OMDB_TIMEOUT_SECS",
                    value,
                })?,
            None => Duration::from_secs(5),
        };
        Ok(Config {
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "127.0.0.1:5002".to_owned()),
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/moviweb.sled")),
            omdb_url: lookup("OMDB_URL").unwrap_or_else(|| omdb::DEFAULT_URL.to_owned()),
            omdb_api_key,
            omdb_timeout,
        })
    }
}
