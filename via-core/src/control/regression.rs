//! Append-only regression log
//!
//! Every first patch of a rhythm class snapshots up to five of its current
//! Tier-1 events into a durable, line-delimited JSON log. Each record is a
//! self-contained test input: replaying the events into a fresh instance
//! with the patch applied must yield no anomaly for that hash.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::event::LogEvent;
use crate::rhythm::RhythmHash;

/// Maximum snapshot events per regression record.
pub const MAX_SNAPSHOT_EVENTS: usize = 5;

/// One regression case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionRecord {
    pub rhythm_hash: RhythmHash,
    pub events: Vec<LogEvent>,
    pub patched_at: i64,
    pub operator_id: Option<String>,
}

/// Durable append-only recorder at `REGRESSION_LOG_PATH`.
pub struct RegressionRecorder {
    path: PathBuf,
    // Serializes appends so interleaved records never corrupt a line.
    write_lock: Mutex<()>,
}

impl RegressionRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, truncating its event snapshot to
    /// [`MAX_SNAPSHOT_EVENTS`].
    pub fn append(&self, mut record: RegressionRecord) -> Result<(), ControlError> {
        record.events.truncate(MAX_SNAPSHOT_EVENTS);
        let line = serde_json::to_string(&record)
            .map_err(|e| ControlError::RegressionLog(std::io::Error::other(e)))?;

        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read every record back. Used by tests and the replay tooling.
    pub fn read_all(&self) -> Result<Vec<RegressionRecord>, ControlError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RegressionRecord = serde_json::from_str(&line)
                .map_err(|e| ControlError::RegressionLog(std::io::Error::other(e)))?;
            out.push(record);
        }
        Ok(out)
    }
}
