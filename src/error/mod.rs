//! Error types for registry and download operations

use std::fmt;

pub type Result<T> = std::result::Result<T, FetcherError>;

#[derive(Debug, Clone)]
pub enum FetcherError {
    /// Malformed coordinate, unknown source, bad platform
    InvalidArgument(String),
    /// 401/403 or token endpoint failure after refresh
    Auth(String),
    /// 404 on manifest or blob
    NotFound(String),
    /// Connection error, 5xx, truncated read, inactivity timeout
    Transport(String),
    /// Unexpected content-type, digest mismatch, unparsable manifest
    Protocol(String),
    /// Local disk failure
    Io(String),
    /// Verb rejected in the current task state
    InvalidState(String),
    /// The task was paused or cancelled while an operation was in flight
    Cancelled,
}

impl FetcherError {
    /// Stable kind string, used for `last_error.kind` and API status mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            FetcherError::InvalidArgument(_) => "InvalidArgument",
            FetcherError::Auth(_) => "Auth",
            FetcherError::NotFound(_) => "NotFound",
            FetcherError::Transport(_) => "Transport",
            FetcherError::Protocol(_) => "ProtocolViolation",
            FetcherError::Io(_) => "IO",
            FetcherError::InvalidState(_) => "InvalidState",
            FetcherError::Cancelled => "Cancelled",
        }
    }

    /// Only transport-class failures are worth another attempt; auth gets a
    /// single token refresh inside the registry client before it surfaces here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetcherError::Transport(_))
    }
}

impl fmt::Display for FetcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetcherError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            FetcherError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            FetcherError::NotFound(msg) => write!(f, "Not found: {}", msg),
            FetcherError::Transport(msg) => write!(f, "Transport error: {}", msg),
            FetcherError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            FetcherError::Io(msg) => write!(f, "IO error: {}", msg),
            FetcherError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            FetcherError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for FetcherError {}

impl From<std::io::Error> for FetcherError {
    fn from(err: std::io::Error) -> Self {
        FetcherError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FetcherError {
    fn from(err: serde_json::Error) -> Self {
        FetcherError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for FetcherError {
    fn from(err: reqwest::Error) -> Self {
        FetcherError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for FetcherError {
    fn from(err: url::ParseError) -> Self {
        FetcherError::InvalidArgument(err.to_string())
    }
}

/// Map an HTTP status from a registry response into an error class.
///
/// 401 is reported as `Auth` only after the caller has already tried one
/// token refresh; the registry client owns that dance.
pub fn classify_status(status: u16, context: &str) -> FetcherError {
    match status {
        401 | 403 => FetcherError::Auth(format!("{} rejected with status {}", context, status)),
        404 => FetcherError::NotFound(context.to_string()),
        429 | 500..=599 => {
            FetcherError::Transport(format!("{} failed with status {}", context, status))
        }
        _ => FetcherError::Protocol(format!("{} returned unexpected status {}", context, status)),
    }
}
