//!
//! src/errors.rs  Andrew Belles  Sept 14th, 2025
//!
//! Defines enums and methods of error conversion
//! for errors the saver uses
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaverError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("token expired at {0}")]
    TokenExpired(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl From<reqwest::Error> for SaverError {
    fn from(e: reqwest::Error) -> Self { SaverError::Http(e.to_string()) }
}

impl From<serde_json::Error> for SaverError {
    fn from(e: serde_json::Error) -> Self { SaverError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for SaverError {
    fn from(e: sqlx::Error) -> Self { SaverError::Db(e.to_string()) }
}
