use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The server has already been started.
    #[error("the server has already been started")]
    AlreadyStarted,

    /// Failed to bind to address.
    #[error("failed to bind to address: {0}")]
    Bind(#[source] std::io::Error),

    /// A settings value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The settings file is not valid YAML or has unknown keys.
    #[error("failed to parse settings file: {0}")]
    ParseConfig(#[source] serde_yaml::Error),

    /// The settings file could not be read.
    #[error("failed to read settings file: {0}")]
    ReadConfig(#[source] std::io::Error),

    /// Error from the underlying bus.
    #[error(transparent)]
    Bus(#[from] subpub::Error),

    /// Failed to install a signal handler.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Bus(subpub::Error::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
