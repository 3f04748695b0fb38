// Error handling framework

use thiserror::Error;

/// Shared key/TTL store errors
///
/// A store failure is deliberately distinct from "lock not acquired": the
/// coordination layer must never mistake an unreachable store for a held lock.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("filesystem error: {0}")]
    FileSystem(String),

    #[error("invalid store entry: {0}")]
    InvalidEntry(String),
}

/// Recurrence-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Task body errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("command '{command}' exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidEntry(err.to_string())
    }
}
