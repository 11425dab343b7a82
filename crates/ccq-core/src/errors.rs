use std::{path::PathBuf, time::Duration};

use crate::protocol::{ErrorCode, WireError};

/// Core error type for ccq.
///
/// Adapter crates map their specific errors into this type so the client can
/// decide consistently between surfacing a failure and retrying it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("permission denied for {tool}: {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("timed out after {0:?} without a terminal response")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Failures the retry coordinator is allowed to re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueryFailed(_) | Error::Timeout(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::TransportUnavailable(_) => ErrorCode::TransportUnavailable,
            Error::QueryFailed(_) => ErrorCode::QueryFailed,
            Error::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Error::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Config(_)
            | Error::Protocol(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::InvalidPath { .. }
            | Error::External(_) => ErrorCode::Internal,
        }
    }

    /// Render for the process boundary.
    pub fn to_wire(&self) -> WireError {
        let (message, tool) = match self {
            Error::TransportUnavailable(m)
            | Error::QueryFailed(m)
            | Error::SessionNotFound(m) => (m.clone(), None),
            Error::PermissionDenied { tool, reason } => (reason.clone(), Some(tool.clone())),
            other => (other.to_string(), None),
        };
        WireError {
            code: self.code(),
            message,
            tool,
        }
    }

    /// Restore an error received from the peer, keeping its kind.
    pub fn from_wire(err: WireError) -> Self {
        match err.code {
            ErrorCode::TransportUnavailable => Error::TransportUnavailable(err.message),
            ErrorCode::QueryFailed => Error::QueryFailed(err.message),
            ErrorCode::SessionNotFound => Error::SessionNotFound(err.message),
            ErrorCode::PermissionDenied => Error::PermissionDenied {
                tool: err.tool.unwrap_or_else(|| "unknown".to_string()),
                reason: err.message,
            },
            // The peer's deadline is not known here; keep the kind, drop the duration.
            ErrorCode::Timeout => Error::Timeout(Duration::ZERO),
            ErrorCode::Internal => Error::External(err.message),
        }
    }
}
