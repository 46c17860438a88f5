//! Movie metadata lookup against the OMDb API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://www.omdbapi.com/";

const NOT_FOUND_MESSAGE: &str = "Movie not found!";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Normalized metadata for a single movie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieMetadata {
    pub title: String,
    pub year: Option<i32>,
    pub director: Option<String>,
    pub poster_url: Option<String>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Looks up a movie by its title.
    ///
    /// Returns `Ok(None)` when the provider has no match for the title.
    async fn lookup(&self, title: &str) -> Result<Option<MovieMetadata>, ProviderError>;
}

pub struct OmdbClient {
    client: Client,
    url: String,
    api_key: String,
}

impl OmdbClient {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
            api_key: api_key.to_owned(),
        })
    }
}

#[async_trait]
impl MetadataProvider for OmdbClient {
    async fn lookup(&self, title: &str) -> Result<Option<MovieMetadata>, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("t", title), ("apikey", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let body: OmdbResponse = response.json().await?;
        body.into_metadata()
    }
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum YearField {
    Number(i32),
    Text(String),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct OmdbResponse {
    response: String,
    title: Option<String>,
    year: Option<YearField>,
    director: Option<String>,
    poster: Option<String>,
    error: Option<String>,
}

/// OMDb marks missing values with "N/A".
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty() && value != "N/A")
}

/// Takes the first year of values like "2010" or "2008–2013".
fn parse_year(year: YearField) -> Option<i32> {
    match year {
        YearField::Number(year) => Some(year),
        YearField::Text(text) => {
            let digits: String = text
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
    }
}

impl OmdbResponse {
    fn into_metadata(self) -> Result<Option<MovieMetadata>, ProviderError> {
        if !self.response.eq_ignore_ascii_case("true") {
            return match self.error {
                Some(ref error) if error == NOT_FOUND_MESSAGE => Ok(None),
                Some(error) => Err(ProviderError::Api(error)),
                None => Ok(None),
            };
        }
        let title = present(self.title)
            .ok_or_else(|| ProviderError::Malformed("missing Title".to_owned()))?;
        Ok(Some(MovieMetadata {
            title,
            year: self.year.and_then(parse_year),
            director: present(self.director),
            poster_url: present(self.poster),
        }))
    }
}
