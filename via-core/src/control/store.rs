//! SQLite persistence for control records and historical prevalence

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{ControlKind, ControlRecord};
use crate::error::ControlError;
use crate::rhythm::RhythmHash;

/// Decay half-life for the historical prevalence counter: seven days.
pub const PREVALENCE_HALF_LIFE_SECS: f64 = 7.0 * 86_400.0;

/// Store for the `control` and `prevalence` tables.
///
/// One row per hash in `control`; the primary key makes suppress/patch
/// idempotent by construction.
pub struct SqliteControlStore {
    conn: Mutex<Connection>,
}

impl SqliteControlStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ControlError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ControlError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), ControlError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS control (
                hash        TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER,
                reason      TEXT,
                operator_id TEXT
            );
            CREATE TABLE IF NOT EXISTS prevalence (
                hash       TEXT PRIMARY KEY,
                count      REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<ControlRecord, rusqlite::Error> {
        let hash_str: String = row.get(0)?;
        let kind_str: String = row.get(1)?;
        Ok(ControlRecord {
            hash: hash_str.parse().unwrap_or(RhythmHash(0)),
            kind: ControlKind::parse(&kind_str).unwrap_or(ControlKind::Suppress),
            created_at: row.get(2)?,
            expires_at: row.get(3)?,
            reason: row.get(4)?,
            operator_id: row.get(5)?,
        })
    }

    pub fn get(&self, hash: RhythmHash) -> Result<Option<ControlRecord>, ControlError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT hash, kind, created_at, expires_at, reason, operator_id
                 FROM control WHERE hash = ?1",
                [hash.to_string()],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or extend a suppression. Re-suppression extends the TTL to the
    /// max of old and new expiry. A patched hash stays patched: the existing
    /// patch record is returned unchanged.
    pub fn upsert_suppress(
        &self,
        hash: RhythmHash,
        now: i64,
        ttl_sec: i64,
        reason: Option<&str>,
        operator_id: Option<&str>,
    ) -> Result<ControlRecord, ControlError> {
        if let Some(existing) = self.get(hash)? {
            match existing.kind {
                ControlKind::Patch => return Ok(existing),
                ControlKind::Suppress => {
                    let expires = existing.expires_at.unwrap_or(0).max(now + ttl_sec);
                    let conn = self.conn.lock().unwrap();
                    conn.execute(
                        "UPDATE control SET expires_at = ?2, reason = COALESCE(?3, reason)
                         WHERE hash = ?1",
                        params![hash.to_string(), expires, reason],
                    )?;
                    return Ok(ControlRecord {
                        expires_at: Some(expires),
                        ..existing
                    });
                }
            }
        }

        let record = ControlRecord {
            hash,
            kind: ControlKind::Suppress,
            created_at: now,
            expires_at: Some(now + ttl_sec),
            reason: reason.map(str::to_string),
            operator_id: operator_id.map(str::to_string),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO control (hash, kind, created_at, expires_at, reason, operator_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.hash.to_string(),
                record.kind.as_str(),
                record.created_at,
                record.expires_at,
                record.reason,
                record.operator_id,
            ],
        )?;
        Ok(record)
    }

    /// Insert a permanent patch. Returns `(record, newly_created)`; a repeat
    /// patch of the same hash reports `false` so callers emit exactly one
    /// regression record per hash.
    pub fn upsert_patch(
        &self,
        hash: RhythmHash,
        now: i64,
        reason: Option<&str>,
        operator_id: Option<&str>,
    ) -> Result<(ControlRecord, bool), ControlError> {
        if let Some(existing) = self.get(hash)? {
            if existing.kind == ControlKind::Patch {
                return Ok((existing, false));
            }
            // A suppression upgrades in place.
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE control SET kind = 'patch', expires_at = NULL,
                        reason = COALESCE(?2, reason), created_at = ?3
                 WHERE hash = ?1",
                params![hash.to_string(), reason, now],
            )?;
            drop(conn);
            let record = self.get(hash)?.expect("row just updated");
            return Ok((record, true));
        }

        let record = ControlRecord {
            hash,
            kind: ControlKind::Patch,
            created_at: now,
            expires_at: None,
            reason: reason.map(str::to_string),
            operator_id: operator_id.map(str::to_string),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO control (hash, kind, created_at, expires_at, reason, operator_id)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                record.hash.to_string(),
                record.kind.as_str(),
                record.created_at,
                record.reason,
                record.operator_id,
            ],
        )?;
        Ok((record, true))
    }

    /// Delete a control row of either kind. Returns whether one existed.
    pub fn lift(&self, hash: RhythmHash) -> Result<bool, ControlError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM control WHERE hash = ?1", [hash.to_string()])?;
        Ok(n > 0)
    }

    /// All records that are active at `now`: every patch, plus suppressions
    /// whose expiry is in the future.
    pub fn active(&self, now: i64) -> Result<Vec<ControlRecord>, ControlError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT hash, kind, created_at, expires_at, reason, operator_id
             FROM control
             WHERE kind = 'patch' OR expires_at > ?1",
        )?;
        let rows = stmt.query_map([now], Self::row_to_record)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Remove expired suppressions. Returns how many were purged.
    pub fn purge_expired(&self, now: i64) -> Result<usize, ControlError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM control WHERE kind = 'suppress' AND expires_at <= ?1",
            [now],
        )?;
        Ok(n)
    }

    /// Decay-then-bump the prevalence counter for a hash.
    pub fn bump_prevalence(&self, hash: RhythmHash, now: i64) -> Result<(), ControlError> {
        let current = self.prevalence(hash, now)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prevalence (hash, count, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(hash) DO UPDATE SET count = ?2, updated_at = ?3",
            params![hash.to_string(), current + 1.0, now],
        )?;
        Ok(())
    }

    /// The decayed prevalence counter for a hash at `now`.
    ///
    /// Exponential decay with a seven-day half-life; a hash never promoted
    /// reads as 0.
    pub fn prevalence(&self, hash: RhythmHash, now: i64) -> Result<f64, ControlError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(f64, i64)> = conn
            .query_row(
                "SELECT count, updated_at FROM prevalence WHERE hash = ?1",
                [hash.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((count, updated_at)) => {
                let age = (now - updated_at).max(0) as f64;
                count * 0.5f64.powf(age / PREVALENCE_HALF_LIFE_SECS)
            }
            None => 0.0,
        })
    }
}
