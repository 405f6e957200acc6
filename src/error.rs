//! Storage error types

use std::fmt;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Classification of a [`StorageError`], used by callers that only care
/// about which class of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    NotExist,
    Io,
    Unsupported,
    Transient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Invalid => "invalid operation",
            ErrorKind::NotExist => "item does not exist",
            ErrorKind::Io => "I/O error",
            ErrorKind::Unsupported => "not supported",
            ErrorKind::Transient => "transient error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Bad or missing arguments. No network activity was attempted.
    #[error("{op}: invalid operation: {message}")]
    Invalid { op: &'static str, message: String },

    /// Missing object, or an unknown or already consumed listing token.
    #[error("{op}: item does not exist: {message}")]
    NotExist { op: &'static str, message: String },

    #[error("{op}: I/O error: {message}")]
    Io { op: &'static str, message: String },

    /// A well-defined negative answer rather than a fault.
    #[error("{op}: not supported")]
    Unsupported { op: &'static str },

    /// The backend is closed or was never initialized.
    #[error("{op}: transient error: {message}")]
    Transient { op: &'static str, message: String },
}

impl StorageError {
    pub fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            op,
            message: message.into(),
        }
    }

    pub fn not_exist(op: &'static str, message: impl Into<String>) -> Self {
        Self::NotExist {
            op,
            message: message.into(),
        }
    }

    pub fn io(op: &'static str, message: impl Into<String>) -> Self {
        Self::Io {
            op,
            message: message.into(),
        }
    }

    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            op,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::NotExist { .. } => ErrorKind::NotExist,
            Self::Io { .. } => ErrorKind::Io,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Transient { .. } => ErrorKind::Transient,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Invalid { op, .. }
            | Self::NotExist { op, .. }
            | Self::Io { op, .. }
            | Self::Unsupported { op }
            | Self::Transient { op, .. } => op,
        }
    }
}
