//! Unified error handling for the tracker.
//!
//! All fallible operations across the cluster state store, selection
//! engine, protocol dispatcher, and persistence layer return
//! [`TrackerError`] so that a handler can map a single error value onto
//! both a log line and the wire protocol's 1-byte status code.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for all tracker operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("already: {0}")]
    Already(String),

    #[error("no space available: {0}")]
    NoSpace(String),

    #[error("operation not supported: {0}")]
    OpNotSupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("I/O error: {source} (path: {path:?})")]
    Io {
        source: io::Error,
        path: Option<PathBuf>,
    },

    #[error("malformed config: {field} - {message}")]
    Configuration { field: String, message: String },

    #[error("protocol framing error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Error context trait, mirroring `anyhow::Context` for our own error type.
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> TrackerResult<T>
    where
        F: FnOnce() -> String;

    fn context(self, msg: &str) -> TrackerResult<T>;
}

impl<T> ErrorContext<T> for TrackerResult<T> {
    fn with_context<F>(self, f: F) -> TrackerResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TrackerError::Internal(format!("{}: {}", f(), e)))
    }

    fn context(self, msg: &str) -> TrackerResult<T> {
        self.map_err(|e| TrackerError::Internal(format!("{}: {}", msg, e)))
    }
}

impl<T> ErrorContext<T> for Result<T, io::Error> {
    fn with_context<F>(self, f: F) -> TrackerResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TrackerError::Io {
            source: e,
            path: None,
        })
        .with_context(f)
    }

    fn context(self, msg: &str) -> TrackerResult<T> {
        self.map_err(|e| TrackerError::Io {
            source: e,
            path: None,
        })
        .context(msg)
    }
}

/// Groups related error kinds, for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    State,
    Resource,
    Security,
    Network,
    Configuration,
    Protocol,
    Internal,
}

impl TrackerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TrackerError::InvalidArgument(_) => ErrorCategory::Validation,
            TrackerError::NotFound(_) | TrackerError::Exists(_) | TrackerError::Already(_) => {
                ErrorCategory::State
            }
            TrackerError::Busy(_) | TrackerError::NoSpace(_) => ErrorCategory::Resource,
            TrackerError::OpNotSupported(_) => ErrorCategory::State,
            TrackerError::PermissionDenied(_) => ErrorCategory::Security,
            TrackerError::NetworkTimeout(_) | TrackerError::Io { .. } => ErrorCategory::Network,
            TrackerError::Configuration { .. } => ErrorCategory::Configuration,
            TrackerError::Protocol(_) => ErrorCategory::Protocol,
            TrackerError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a client or peer should retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::NetworkTimeout(_)
                | TrackerError::Busy(_)
                | TrackerError::Io { .. }
        )
    }

    /// Status byte written into the wire response header (spec §6/§7).
    ///
    /// Mirrors POSIX errno values, the convention the wire protocol's
    /// status byte follows.
    pub fn response_code(&self) -> u8 {
        match self {
            TrackerError::InvalidArgument(_) | TrackerError::Configuration { .. } => 22, // EINVAL
            TrackerError::NotFound(_) => 2,                                             // ENOENT
            TrackerError::Exists(_) => 17,                                              // EEXIST
            TrackerError::Busy(_) => 16,                                                // EBUSY
            TrackerError::Already(_) => 0,
            TrackerError::NoSpace(_) => 28,      // ENOSPC
            TrackerError::OpNotSupported(_) => 95, // EOPNOTSUPP
            TrackerError::PermissionDenied(_) => 13, // EACCES
            TrackerError::NetworkTimeout(_) => 110, // ETIMEDOUT
            TrackerError::Io { .. } => 5,         // EIO
            TrackerError::Protocol(_) => 22,
            TrackerError::Internal(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_groups_match_spec() {
        assert_eq!(
            TrackerError::Busy("x".into()).category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            TrackerError::NotFound("x".into()).category(),
            ErrorCategory::State
        );
    }

    #[test]
    fn response_codes_are_stable() {
        assert_eq!(TrackerError::NotFound("g".into()).response_code(), 2);
        assert_eq!(TrackerError::Exists("g".into()).response_code(), 17);
        assert_eq!(TrackerError::Busy("g".into()).response_code(), 16);
        assert_eq!(TrackerError::Already("g".into()).response_code(), 0);
    }

    #[test]
    fn retryable_errors() {
        assert!(TrackerError::NetworkTimeout("peer".into()).is_retryable());
        assert!(!TrackerError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn context_wraps_io_errors() {
        let result: Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"));
        let wrapped = result.context("loading groups snapshot");
        assert!(wrapped.is_err());
        assert!(wrapped
            .unwrap_err()
            .to_string()
            .contains("loading groups snapshot"));
    }
}
