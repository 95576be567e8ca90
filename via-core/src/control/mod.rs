//! Adaptive control loop: suppress/patch records and the active set
//!
//! Operator verdicts land here. Suppressions hide a rhythm class for a TTL;
//! patches mark it permanently normal. The Tier-1 monitor and the federated
//! query layer consult the in-memory active set, which is refreshed
//! copy-on-write on every change and by a timer, so the read path never
//! touches SQLite.

pub mod regression;
mod store;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use store::{SqliteControlStore, PREVALENCE_HALF_LIFE_SECS};

use crate::error::ControlError;
use crate::rhythm::RhythmHash;

/// Prevalence value at which a rhythm class counts as fully known.
pub const PREVALENCE_SATURATION: f64 = 5.0;

/// Kind of control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// TTL-bounded: hides the class from anomaly output until expiry.
    Suppress,
    /// Permanent: the class is normal; it never promotes again.
    Patch,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Suppress => "suppress",
            ControlKind::Patch => "patch",
        }
    }

    pub fn parse(s: &str) -> Option<ControlKind> {
        match s {
            "suppress" => Some(ControlKind::Suppress),
            "patch" => Some(ControlKind::Patch),
            _ => None,
        }
    }
}

/// One persisted control row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub hash: RhythmHash,
    pub kind: ControlKind,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub reason: Option<String>,
    pub operator_id: Option<String>,
}

/// Immutable snapshot of the hashes currently under control.
#[derive(Debug, Default, Clone)]
pub struct ActiveSet {
    pub suppressed: HashSet<RhythmHash>,
    pub patched: HashSet<RhythmHash>,
}

impl ActiveSet {
    /// Hidden from anomaly output: suppressed or patched.
    pub fn is_hidden(&self, hash: RhythmHash) -> bool {
        self.suppressed.contains(&hash) || self.patched.contains(&hash)
    }

    /// Barred from promotion: patched only. A suppressed class may still
    /// promote once its suppression lapses.
    pub fn is_patched(&self, hash: RhythmHash) -> bool {
        self.patched.contains(&hash)
    }
}

/// The control registry: persisted records plus the shared active set.
pub struct ControlRegistry {
    store: Arc<SqliteControlStore>,
    active: RwLock<Arc<ActiveSet>>,
}

impl ControlRegistry {
    pub fn new(store: Arc<SqliteControlStore>) -> Result<Self, ControlError> {
        let registry = Self {
            store,
            active: RwLock::new(Arc::new(ActiveSet::default())),
        };
        registry.refresh(chrono::Utc::now().timestamp())?;
        Ok(registry)
    }

    /// The current active set. Cheap: clones an `Arc` under a read lock.
    pub fn active_set(&self) -> Arc<ActiveSet> {
        self.active.read().clone()
    }

    /// Rebuild the active set from the store and swap it in.
    pub fn refresh(&self, now: i64) -> Result<(), ControlError> {
        let mut next = ActiveSet::default();
        for record in self.store.active(now)? {
            match record.kind {
                ControlKind::Suppress => next.suppressed.insert(record.hash),
                ControlKind::Patch => next.patched.insert(record.hash),
            };
        }
        *self.active.write() = Arc::new(next);
        Ok(())
    }

    /// Suppress a rhythm class for `ttl_sec`. Idempotent; re-suppression
    /// extends the TTL to the max.
    pub fn suppress(
        &self,
        hash: RhythmHash,
        now: i64,
        ttl_sec: i64,
        reason: Option<&str>,
        operator_id: Option<&str>,
    ) -> Result<ControlRecord, ControlError> {
        let record = self
            .store
            .upsert_suppress(hash, now, ttl_sec, reason, operator_id)?;
        self.refresh(now)?;
        Ok(record)
    }

    /// Permanently patch a rhythm class. Returns whether the patch is new;
    /// the caller records a regression case exactly when it is.
    pub fn patch(
        &self,
        hash: RhythmHash,
        now: i64,
        reason: Option<&str>,
        operator_id: Option<&str>,
    ) -> Result<(ControlRecord, bool), ControlError> {
        let (record, newly) = self.store.upsert_patch(hash, now, reason, operator_id)?;
        self.refresh(now)?;
        Ok((record, newly))
    }

    /// Remove a control record of either kind.
    pub fn lift(&self, hash: RhythmHash, now: i64) -> Result<bool, ControlError> {
        let existed = self.store.lift(hash)?;
        self.refresh(now)?;
        Ok(existed)
    }

    /// All records active at `now`, for the rules listing.
    pub fn rules(&self, now: i64) -> Result<Vec<ControlRecord>, ControlError> {
        self.store.active(now)
    }

    /// Drop expired suppressions and refresh the set. Called by the sweeper.
    pub fn sweep(&self, now: i64) -> Result<usize, ControlError> {
        let purged = self.store.purge_expired(now)?;
        if purged > 0 {
            self.refresh(now)?;
        }
        Ok(purged)
    }

    /// Record a promotion for novelty bookkeeping.
    pub fn record_promotion(&self, hash: RhythmHash, now: i64) -> Result<(), ControlError> {
        self.store.bump_prevalence(hash, now)
    }

    /// Novelty of a rhythm class in [0, 1]: 1 for never-promoted, falling
    /// toward 0 as the decayed promotion count approaches saturation.
    pub fn novelty(&self, hash: RhythmHash, now: i64) -> Result<f64, ControlError> {
        let prevalence = self.store.prevalence(hash, now)?;
        Ok(1.0 - (prevalence / PREVALENCE_SATURATION).clamp(0.0, 1.0))
    }
}
