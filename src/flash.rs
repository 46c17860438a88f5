//! One-shot messages that survive a single redirect.

use actix_web::cookie::Cookie;
use actix_web::{http::header, HttpRequest, HttpResponse};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const FLASH_COOKIE: &str = "_flash";

// Keeps the encoded cookie well below the 4 KB browsers accept.
const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Flash {
    pub level: Level,
    pub message: String,
}

fn truncate(message: String) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((end, _)) => format!("{}...", &message[..end]),
        None => message,
    }
}

impl Flash {
    pub fn success<S: Into<String>>(message: S) -> Self {
        Flash {
            level: Level::Success,
            message: truncate(message.into()),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Flash {
            level: Level::Error,
            message: truncate(message.into()),
        }
    }

    fn encode(&self) -> Option<String> {
        match serde_json::to_vec(self) {
            Ok(json) => Some(URL_SAFE_NO_PAD.encode(json)),
            Err(err) => {
                log::error!("Could not encode flash message: {}", err);
                None
            }
        }
    }

    pub fn decode(value: &str) -> Option<Flash> {
        let json = URL_SAFE_NO_PAD.decode(value).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// Redirects to `location`, carrying `flash` to the next page.
pub fn redirect(location: &str, flash: Flash) -> HttpResponse {
    let mut response = HttpResponse::Found();
    response.insert_header((header::LOCATION, location));
    if let Some(value) = flash.encode() {
        response.cookie(
            Cookie::build(FLASH_COOKIE, value)
                .path("/")
                .http_only(true)
                .finish(),
        );
    }
    response.finish()
}

/// Reads the pending message, if any. Malformed cookies are ignored.
pub fn take(req: &HttpRequest) -> Option<Flash> {
    let cookie = req.cookie(FLASH_COOKIE)?;
    let flash = Flash::decode(cookie.value());
    if flash.is_none() {
        log::debug!("Ignoring malformed flash cookie");
    }
    flash
}

/// Cookie that removes a consumed message from the browser.
pub fn removal() -> Cookie<'static> {
    let mut cookie = Cookie::build(FLASH_COOKIE, "").path("/").finish();
    cookie.make_removal();
    cookie
}
