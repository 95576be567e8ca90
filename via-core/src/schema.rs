//! Source schema registry
//!
//! Maps a log source to the parsing hints the ingestor applies before events
//! reach the encoder: field delimiters, field order, and the timestamp
//! format. Peripheral to the detection loop, persisted next to the control
//! tables.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Parsing hints for one log source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub source_name: String,
    pub delimiters: Vec<String>,
    pub field_order: Vec<String>,
    pub timestamp_format: Option<String>,
}

/// SQLite-backed schema registry.
pub struct SchemaRegistry {
    conn: Mutex<Connection>,
}

impl SchemaRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ControlError> {
        let conn = Connection::open(path)?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init()?;
        Ok(registry)
    }

    pub fn open_in_memory() -> Result<Self, ControlError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init()?;
        Ok(registry)
    }

    fn init(&self) -> Result<(), ControlError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schemas (
                source_name TEXT PRIMARY KEY,
                schema_json TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn save(&self, record: &SchemaRecord) -> Result<(), ControlError> {
        let json = serde_json::to_string(record)
            .map_err(|e| ControlError::RegressionLog(std::io::Error::other(e)))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schemas (source_name, schema_json) VALUES (?1, ?2)
             ON CONFLICT(source_name) DO UPDATE SET schema_json = ?2",
            params![record.source_name, json],
        )?;
        Ok(())
    }

    pub fn get(&self, source_name: &str) -> Result<Option<SchemaRecord>, ControlError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM schemas WHERE source_name = ?1",
                [source_name],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .map_err(|e| ControlError::RegressionLog(std::io::Error::other(e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

/// Suggest a schema from sample lines.
///
/// Picks the delimiter that splits samples into the most consistent field
/// count, then probes the leading field for a timestamp shape. Returns None
/// when samples disagree too much to suggest anything.
pub fn detect_schema(source_name: &str, samples: &[String]) -> Option<SchemaRecord> {
    let samples: Vec<&str> = samples
        .iter()
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
        .collect();
    if samples.is_empty() {
        return None;
    }

    const CANDIDATES: [&str; 4] = ["\t", "|", ",", " "];
    let mut best: Option<(&str, usize)> = None;
    for delim in CANDIDATES {
        let counts: Vec<usize> = samples.iter().map(|s| s.split(delim).count()).collect();
        let first = counts[0];
        if first < 2 || counts.iter().any(|&c| c != first) {
            continue;
        }
        if best.map_or(true, |(_, n)| first > n) {
            best = Some((delim, first));
        }
    }
    let (delimiter, fields) = best?;

    let leading = samples[0].split(delimiter).next().unwrap_or_default();
    let timestamp_format = if leading.len() >= 10
        && leading.chars().take(4).all(|c| c.is_ascii_digit())
        && leading.as_bytes().get(4) == Some(&b'-')
    {
        Some("%Y-%m-%dT%H:%M:%S".to_string())
    } else if leading.chars().all(|c| c.is_ascii_digit()) && leading.len() >= 9 {
        Some("epoch".to_string())
    } else {
        None
    };

    let mut field_order: Vec<String> = Vec::with_capacity(fields);
    if timestamp_format.is_some() {
        field_order.push("ts".to_string());
    }
    field_order.push("service".to_string());
    field_order.push("level".to_string());
    while field_order.len() < fields {
        field_order.push("message".to_string());
    }
    field_order.truncate(fields);

    Some(SchemaRecord {
        source_name: source_name.to_string(),
        delimiters: vec![delimiter.to_string()],
        field_order,
        timestamp_format,
    })
}
