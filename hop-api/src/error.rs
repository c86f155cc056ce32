//! Error types for the control API

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for control API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can be returned to a caller of the control API
#[derive(Debug, Error)]
pub enum Error {
    /// Caller identity is not on the allow-list
    #[error("unauthorized API caller")]
    Unauthorized,

    /// Configuration text could not be parsed into a profile
    #[error("could not import profile: {0}")]
    Import(String),

    /// A well-formed profile failed its semantic checks
    #[error("profile is not valid: {0}")]
    Validation(String),

    /// The tunnel engine is not bound
    #[error("VPN engine is not available")]
    EngineUnavailable,

    /// The service has been shut down
    #[error("API service is shut down")]
    ShutDown,

    /// Profile or allow-list store failure
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error on the control socket
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unexpected message on the control socket
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Stable category of this error, as reported on the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Import(_) => ErrorKind::Import,
            Error::Validation(_) => ErrorKind::Validation,
            Error::EngineUnavailable => ErrorKind::EngineUnavailable,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::ShutDown
            | Error::Store(_)
            | Error::Config(_)
            | Error::ConfigParse(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if the caller has to change its input before retrying
    pub fn is_input_error(&self) -> bool {
        matches!(self, Error::Import(_) | Error::Validation(_))
    }

    /// Message without the category prefix, as sent on the wire
    pub fn detail(&self) -> String {
        match self {
            Error::Import(msg)
            | Error::Validation(msg)
            | Error::Store(msg)
            | Error::Config(msg)
            | Error::Protocol(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from the control socket
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Unauthorized => Error::Unauthorized,
            ErrorKind::Import => Error::Import(message),
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::EngineUnavailable => Error::EngineUnavailable,
            ErrorKind::Protocol => Error::Protocol(message),
            ErrorKind::Internal => Error::Store(message),
        }
    }
}

/// Error categories carried in `error` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Import,
    Validation,
    EngineUnavailable,
    Protocol,
    Internal,
}

/// Failure to push a status update to one observer
///
/// Never surfaced to API callers; the hub prunes the observer instead.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The remote end is gone
    #[error("observer is unreachable")]
    Unreachable,

    /// The observer did not accept the update in time
    #[error("observer timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_round_trip_keeps_kind() {
        let err = Error::Validation("server is required".into());
        let remote = Error::from_remote(err.kind(), err.detail());
        assert_eq!(remote.kind(), ErrorKind::Validation);
        assert!(remote.is_input_error());
        assert_eq!(remote.to_string(), err.to_string());

        let denied = Error::from_remote(ErrorKind::Unauthorized, String::new());
        assert!(matches!(denied, Error::Unauthorized));
    }

    #[test]
    fn test_io_errors_are_internal() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_input_error());
    }
}
