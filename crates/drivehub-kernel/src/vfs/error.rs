//! Drive error taxonomy.
//!
//! Errors are kinds, not strings: callers discriminate with `matches!` or the
//! `is_*` helpers and never by message text.

use std::io;

use serde_json::{Map, Value};
use thiserror::Error;

/// Drive error type.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Path does not exist, or the caller may not know that it exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not allowed in the current state of the target.
    #[error("not allowed: {message}")]
    NotAllowed {
        message: String,
        data: Option<Box<Map<String, Value>>>,
    },

    /// Caller is not authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but lacks the permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend does not implement the operation.
    #[error("unsupported operation")]
    Unsupported,

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Remote service returned an error.
    #[error("remote api error ({code}): {message}")]
    RemoteApi { code: u16, message: String },

    /// The task context was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// I/O error that does not map onto another kind.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Broken invariant inside the kernel.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriveError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotAllowed error without structured data.
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::NotAllowed {
            message: message.into(),
            data: None,
        }
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a BadRequest error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Create a RemoteApi error.
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Self::RemoteApi {
            code,
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Attach a structured data field. Only `NotAllowed` carries data; other
    /// kinds are returned unchanged.
    pub fn with_data(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        match self {
            Self::NotAllowed { message, data } => {
                let mut data = data.unwrap_or_default();
                data.insert(key.into(), value.into());
                Self::NotAllowed {
                    message,
                    data: Some(data),
                }
            }
            other => other,
        }
    }

    /// Structured data attached to the error, if any.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::NotAllowed { data, .. } => data.as_deref(),
            _ => None,
        }
    }

    /// HTTP-style status code surfaced to callers.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::PermissionDenied(_) | Self::NotAllowed { .. } => 403,
            Self::NotFound(_) => 404,
            Self::Unsupported => 405,
            Self::RemoteApi { code, .. } => *code,
            Self::Cancelled => 499,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for DriveError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => Self::not_allowed(e.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory => {
                Self::not_allowed(e.to_string())
            }
            _ => Self::Io(e),
        }
    }
}

impl From<rusqlite::Error> for DriveError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("database: {e}"))
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("json: {e}"))
    }
}

/// Drive result type.
pub type DriveResult<T> = Result<T, DriveError>;
