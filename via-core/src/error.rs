//! Error types for via-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes surfaced on the wire in a `code` field.
///
/// The set is part of the public contract: clients dispatch on these strings,
/// so variants are never renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadEvent,
    BadRequest,
    Overloaded,
    EmbedderBusy,
    BackendUnavailable,
    PartitionTimeout,
    PromotionDegraded,
    InvariantViolation,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadEvent => "BAD_EVENT",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Overloaded => "OVERLOADED",
            ErrorCode::EmbedderBusy => "EMBEDDER_BUSY",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::PartitionTimeout => "PARTITION_TIMEOUT",
            ErrorCode::PromotionDegraded => "PROMOTION_DEGRADED",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for via-core
#[derive(Debug, Error)]
pub enum ViaError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("vector backend error: {0}")]
    Vector(#[from] VectorError),

    #[error("control registry error: {0}")]
    Control(#[from] ControlError),
}

impl ViaError {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ViaError::Config(_) => ErrorCode::Internal,
            ViaError::Encode(_) => ErrorCode::BadEvent,
            ViaError::Embedder(e) => e.code(),
            ViaError::Vector(e) => e.code(),
            ViaError::Control(_) => ErrorCode::Internal,
        }
    }
}

/// Errors raised while loading configuration from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing required key {0}")]
    Missing(&'static str),
}

/// Errors from the rhythm encoder. Malformed input, never a panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("empty message")]
    EmptyMessage,

    #[error("timestamp must be a positive epoch second, got {0}")]
    BadTimestamp(i64),

    #[error("too many attributes: {0} (max 32)")]
    TooManyAttributes(usize),
}

/// Errors from the embedding layer
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// The bounded request queue is full; transient.
    #[error("embedder queue full")]
    Busy,

    #[error("embedding failed: {0}")]
    Failed(String),
}

impl EmbedderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EmbedderError::Busy => ErrorCode::EmbedderBusy,
            EmbedderError::Failed(_) => ErrorCode::Internal,
        }
    }
}

/// Errors from the vector backend seam
#[derive(Debug, Error)]
pub enum VectorError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed point: {0}")]
    MalformedPoint(String),
}

impl VectorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VectorError::CollectionNotFound(_) => ErrorCode::NotFound,
            VectorError::Unavailable(_) => ErrorCode::BackendUnavailable,
            VectorError::MalformedPoint(_) => ErrorCode::BadRequest,
        }
    }
}

/// Errors from the control registry and its SQLite store
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("regression log I/O error: {0}")]
    RegressionLog(#[from] std::io::Error),

    #[error("unknown control kind: {0}")]
    UnknownKind(String),
}
