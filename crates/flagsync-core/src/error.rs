// ── Data-source error types ──
//
// What the optional error handler receives. Transport-level details are
// folded into an `ErrorKind` plus an optional HTTP status; consumers never
// see reqwest or JSON parser errors directly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

/// Setup errors from the core crate (never produced by the event loop).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid service endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error(transparent)]
    Transport(#[from] flagsync_api::Error),
}

/// Failure taxonomy. Drives retry eligibility and what observers are told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport-level failure before any HTTP response.
    NetworkError,
    /// HTTP response with a non-success status.
    ErrorResponse,
    /// Payload present but not parseable or not the expected shape.
    InvalidData,
    Unknown,
}

/// Which transport strategy produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorOrigin {
    #[strum(serialize = "streaming")]
    Streaming,
    #[strum(serialize = "polling")]
    Polling,
}

/// A data-source failure, as delivered to an [`ErrorHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    /// `false` means the source has given up: no further attempts follow.
    pub recoverable: bool,
    pub origin: ErrorOrigin,
}

impl DataSourceError {
    pub fn streaming(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Streaming, kind, message)
    }

    pub fn polling(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Polling, kind, message)
    }

    fn new(origin: ErrorOrigin, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            recoverable: true,
            origin,
        }
    }

    pub fn with_status(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error ({}", self.origin, self.kind)?;
        if let Some(status) = self.status_code {
            write!(f, ", status {status}")?;
        }
        write!(f, "): {}", self.message)
    }
}

impl std::error::Error for DataSourceError {}

/// Callback receiving every reported data-source error.
pub type ErrorHandler = Arc<dyn Fn(DataSourceError) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_origin_kind_and_status() {
        let err = DataSourceError::streaming(ErrorKind::ErrorResponse, "forbidden")
            .with_status(Some(403))
            .unrecoverable();
        assert_eq!(
            err.to_string(),
            "streaming error (ERROR_RESPONSE, status 403): forbidden"
        );
        assert!(!err.recoverable);
    }

    #[test]
    fn polling_errors_default_to_recoverable() {
        let err = DataSourceError::polling(ErrorKind::InvalidData, "bad json");
        assert!(err.recoverable);
        assert_eq!(err.status_code, None);
        assert_eq!(err.to_string(), "polling error (INVALID_DATA): bad json");
    }
}
