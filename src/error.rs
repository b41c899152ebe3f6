//! Error types for the relay leaf client
//!
//! Besides the usual error enum, this module carries the numeric error
//! code contract exposed to foreign callers (OK=0 .. Internal=99) and
//! the `error_message` lookup for turning a code back into text.

use thiserror::Error;

/// Numeric error codes of the public contract.
pub mod code {
    pub const OK: i32 = 0;
    pub const NULL_PARAM: i32 = 1;
    pub const INVALID_HANDLE: i32 = 2;
    pub const CREATE_FAILED: i32 = 3;
    pub const START_FAILED: i32 = 4;
    pub const ALREADY_STARTED: i32 = 5;
    pub const NOT_STARTED: i32 = 6;
    pub const INVALID_PROXY: i32 = 7;
    pub const INTERNAL: i32 = 99;
}

/// Main error type for the relay leaf client
#[derive(Error, Debug)]
pub enum Error {
    #[error("null or empty parameter")]
    NullParam,

    #[error("invalid or destroyed session handle")]
    InvalidHandle,

    #[error("failed to create session: {0}")]
    CreateFailed(String),

    #[error("failed to start session: {0}")]
    StartFailed(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("session not started")]
    NotStarted,

    #[error("invalid proxy URL: {0}")]
    InvalidProxy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timeout")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error onto the numeric contract.
    ///
    /// Plumbing failures (IO, HTTP, protocol, timeout) have no dedicated
    /// code and collapse into `INTERNAL`.
    pub fn code(&self) -> i32 {
        match self {
            Error::NullParam => code::NULL_PARAM,
            Error::InvalidHandle => code::INVALID_HANDLE,
            Error::CreateFailed(_) => code::CREATE_FAILED,
            Error::StartFailed(_) => code::START_FAILED,
            Error::AlreadyStarted => code::ALREADY_STARTED,
            Error::NotStarted => code::NOT_STARTED,
            Error::InvalidProxy(_) => code::INVALID_PROXY,
            _ => code::INTERNAL,
        }
    }
}

/// Human-readable message for a numeric error code.
///
/// Unknown codes map to a generic message rather than panicking, since
/// callers may hand us codes recorded from another peer.
pub fn error_message(code: i32) -> &'static str {
    match code {
        code::OK => "ok",
        code::NULL_PARAM => "null or empty parameter",
        code::INVALID_HANDLE => "invalid or destroyed session handle",
        code::CREATE_FAILED => "failed to create session",
        code::START_FAILED => "failed to start session",
        code::ALREADY_STARTED => "session already started",
        code::NOT_STARTED => "session not started",
        code::INVALID_PROXY => "invalid proxy URL",
        code::INTERNAL => "internal error",
        _ => "unknown error code",
    }
}

/// Result type alias for the relay leaf client
pub type Result<T> = std::result::Result<T, Error>;
