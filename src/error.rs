//! Error types for ackqueue operations.
//!
//! Defines the error types shared by the store backends, the acknowledged
//! queue and the delayed task engine:
//! - Store connection and command failures
//! - Payload encoding and decoding
//! - Queue argument validation
//! - Task scheduling validation

use thiserror::Error;

/// Error type returned by user supplied message and task handlers.
pub type HandlerError = anyhow::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store replied with something the script contract does not allow.
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Errors that can occur during acknowledged queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors that can occur during delayed task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid schedule timestamp {0}: must not be negative")]
    InvalidSchedule(i64),
}
