use serde::Serialize;

/// Shared error type used across all Courier crates.
///
/// Variants map onto the gateway's error taxonomy: user-visible conditions
/// (`Timeout`, `Canceled`, `Busy`, `NotFound`, ...), upstream failures that
/// the outbox retries, and permanent failures surfaced immediately.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("queue overflow")]
    Overflow,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("config: {0}")]
    Config(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured error codes exposed on the control-plane surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidParams,
    Conflict,
    RateLimited,
    Timeout,
    InternalError,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl Error {
    /// Map the error onto its control-plane code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidParams(_) | Error::UnsupportedKind(_) => ErrorCode::InvalidParams,
            Error::Busy(_) | Error::Conflict(_) => ErrorCode::Conflict,
            Error::RateLimited(_) | Error::Overflow => ErrorCode::RateLimited,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::UnknownChannel(_) | Error::Unavailable(_) => ErrorCode::Unavailable,
            _ => ErrorCode::InternalError,
        }
    }
}
