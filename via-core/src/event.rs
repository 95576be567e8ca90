//! Log event wire types and validation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EncodeError;

/// Maximum number of attribute entries accepted per event.
pub const MAX_ATTRIBUTES: usize = 32;

/// Log severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }

    /// Parse a level name, case-insensitively. Unknown names map to None.
    pub fn parse(s: &str) -> Option<Level> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Some(Level::Trace),
            "DEBUG" => Some(Level::Debug),
            "INFO" => Some(Level::Info),
            "WARN" | "WARNING" => Some(Level::Warn),
            "ERROR" => Some(Level::Error),
            "FATAL" => Some(Level::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log event as received on the ingest path.
///
/// `ts` is a second-resolution epoch integer; `attributes` is bounded to
/// [`MAX_ATTRIBUTES`] entries. A `BTreeMap` keeps attribute order stable for
/// hashing and serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: i64,
    pub service: String,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl LogEvent {
    pub fn new(ts: i64, service: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            ts,
            service: service.into(),
            level,
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Validate the event per the ingest contract.
    ///
    /// Rejections surface as `BAD_EVENT`: empty message, non-positive
    /// timestamp, or an oversized attribute map.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.message.trim().is_empty() {
            return Err(EncodeError::EmptyMessage);
        }
        if self.ts <= 0 {
            return Err(EncodeError::BadTimestamp(self.ts));
        }
        if self.attributes.len() > MAX_ATTRIBUTES {
            return Err(EncodeError::TooManyAttributes(self.attributes.len()));
        }
        Ok(())
    }
}
