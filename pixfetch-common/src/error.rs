use std::sync::Arc;

use thiserror::Error;

/// Boxed transport failure shared between clones of the error.
pub type TransportCause = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Unsupported URL scheme '{scheme}' for {url}")]
    UnsupportedScheme { scheme: String, url: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport Error: {0}")]
    Transport(#[source] TransportCause),

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Session adapter is no longer available")]
    SessionUnavailable,

    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl FetchError {
    /// Wraps any transport-native error.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FetchError::Transport(Arc::new(err))
    }

    /// Transport failure described only by a message.
    pub fn transport_msg(msg: impl Into<String>) -> Self {
        FetchError::Transport(Arc::new(TransportMessage(msg.into())))
    }

    /// Cancellation is a terminal state, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
struct TransportMessage(String);

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::transport(err)
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
