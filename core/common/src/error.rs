//! Common error types for ClientSync.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for ClientSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure (DNS, connect, timeout, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service rejected our credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The remote service answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// The remote payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Writing a snapshot to disk failed.
    #[error("Disk error at {}: {source}", path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A worker crashed or never reported a result.
    #[error("Worker error: {0}")]
    Process(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Build a [`Error::Disk`] for the given path.
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    /// Coarse category of this error, used to tag fetch failures.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,
            Error::Network(_) => ErrorCategory::Network,
            Error::Auth(_) => ErrorCategory::Auth,
            Error::HttpStatus { .. } => ErrorCategory::HttpStatus,
            Error::Decode(_) | Error::Serialization(_) => ErrorCategory::Decode,
            Error::Disk { .. } | Error::Io(_) => ErrorCategory::Disk,
            Error::Process(_) => ErrorCategory::Process,
            Error::InvalidInput(_) | Error::NotFound(_) | Error::AlreadyExists(_) => {
                ErrorCategory::Other
            }
        }
    }
}

/// Tag attached to a failure that crossed a worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Network,
    Auth,
    HttpStatus,
    Decode,
    Disk,
    Process,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::HttpStatus => "http_status",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Disk => "disk",
            ErrorCategory::Process => "process",
            ErrorCategory::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::Auth("401".into()).category(), ErrorCategory::Auth);
        assert_eq!(
            Error::HttpStatus {
                status: 503,
                message: "unavailable".into()
            }
            .category(),
            ErrorCategory::HttpStatus
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Error::disk("/tmp/x.json", io).category(), ErrorCategory::Disk);
    }

    #[test]
    fn test_http_status_display() {
        let err = Error::HttpStatus {
            status: 401,
            message: "Unauthorized".into(),
        };
        assert_eq!(err.to_string(), "HTTP 401: Unauthorized");
        assert_eq!(ErrorCategory::HttpStatus.to_string(), "http_status");
    }
}
