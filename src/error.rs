use crate::wire::codec::CodecError;
use crate::wire::compression::CompressionError;
use thiserror::Error;

/// Errors surfaced by a connection, consumer, or producer.
///
/// Mirrors the split between a low-level wire error (`CodecError`) and a
/// higher-level client error used throughout the rest of the crate.
#[derive(Debug, Error)]
pub enum NsqError {
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error(transparent)]
    Connection(#[from] std::io::Error),

    #[error("command timed out")]
    Timeout,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected frame, expected a response")]
    UnexpectedFrame,

    #[error("lookupd discovery failed: {0}")]
    Discovery(String),

    #[error("invalid topic or channel name: {0}")]
    InvalidName(String),

    #[error("request failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type NsqResult<T> = std::result::Result<T, NsqError>;

/// Server error codes which must terminate the connection outright, as
/// opposed to merely failing the pending command.
pub const FATAL_ERROR_CODES: &[&str] = &[
    "E_INVALID",
    "E_BAD_BODY",
    "E_BAD_TOPIC",
    "E_BAD_CHANNEL",
    "E_BAD_MESSAGE",
    "E_AUTH_FAILED",
    "E_UNAUTHORIZED",
];

pub fn is_fatal_error_code(code: &str) -> bool {
    FATAL_ERROR_CODES.contains(&code)
}
