use thiserror::Error;

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidArgument,
    InvalidState,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Unavailable(_)
            | Error::Mqtt(_)
            | Error::Database(_)
            | Error::Migration(_)
            | Error::Json(_) => ErrorKind::Unavailable,
        }
    }

    /// Only infrastructure failures may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_) | Error::Database(_) | Error::Mqtt(_) => true,

            Error::NotFound(_)
            | Error::Forbidden(_)
            | Error::InvalidArgument(_)
            | Error::InvalidState(_) => false,
            Error::Migration(_) => false,
            Error::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
