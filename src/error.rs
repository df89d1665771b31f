use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),
    #[error("api_key is required to talk to the backend")]
    MissingCredentials,
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,
    #[error("backend responded with status {0}")]
    Http(u16),
    #[error("request timed out")]
    Timeout,
    #[error("backend returned an empty result")]
    EmptyResponse,
    #[error("compiled-in defaults are missing or malformed")]
    MissingDefaults(#[source] Arc<serde_json::Error>),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("sync thread panicked")]
    SyncThreadPanicked,
    /// The fetch or refresh worker went away before producing a result.
    #[error("refresh aborted before completion")]
    RefreshAborted,
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Error::Timeout;
        }
        Error::Network(Arc::new(value.without_url()))
    }
}
