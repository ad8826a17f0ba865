//! Error types for the profile service.

use std::io;

use crate::profile::ProfileError;

/// Errors that can occur while ingesting or serving profiles.
#[derive(Debug, thiserror::Error)]
pub enum ProfiledError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request body was well-formed JSON but not a valid log request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or mismatched API key.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// The accumulator rejected an observation.
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),

    /// HTTP client error.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding error.
    #[error("JSON decode error: {source}")]
    JsonDecode { source: serde_json::Error },
}

impl From<figment::Error> for ProfiledError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
