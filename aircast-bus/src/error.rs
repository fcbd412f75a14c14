//! Error types for the stream bus

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream ID {candidate} is not greater than last ID {last}")]
    IdNotIncreasing { candidate: String, last: String },

    #[error("Unknown consumer group: {0}")]
    UnknownGroup(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Call timed out: {0}")]
    CallTimeout(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
