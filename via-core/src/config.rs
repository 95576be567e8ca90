//! Environment-driven configuration
//!
//! All knobs are plain environment variables with defaults; a malformed
//! value is a hard configuration error (daemon exit code 1), never a silent
//! fallback.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::ConfigError;

/// Resolved runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ViaConfig {
    /// Tier-1 sliding window in seconds.
    pub t1_window_sec: i64,
    /// Hard cap on live Tier-1 points; oldest are dropped past it.
    pub t1_max_points: usize,
    /// Tier-2 daily partitions older than this are dropped.
    pub t2_retention_days: i64,
    /// Minimum anomaly score to report.
    pub anomaly_threshold: f64,
    /// Novelty weight in the anomaly score; 1-alpha weighs frequency.
    pub anomaly_alpha: f64,
    /// Deadline for federated queries, per partition.
    pub query_timeout_ms: u64,
    /// Embedding provider selector; empty means the built-in one.
    pub embedder_backend: Option<String>,
    /// Vector engine selector; `memory:` (or unset) is the in-process engine.
    pub vector_backend_url: String,
    /// SQLite file holding control and prevalence tables.
    pub control_store_path: PathBuf,
    /// Append-only regression log.
    pub regression_log_path: PathBuf,
    /// Ingest dedup cache capacity (point ids).
    pub dedup_capacity: usize,
    /// HTTP bind address.
    pub bind_addr: String,
    /// Periodic anomaly analysis interval; 0 disables the worker.
    pub analysis_interval_sec: u64,
    /// Background sweep interval (eviction, retention, IDF refresh).
    pub sweep_interval_sec: u64,
}

impl Default for ViaConfig {
    fn default() -> Self {
        Self {
            t1_window_sec: 1800,
            t1_max_points: 200_000,
            t2_retention_days: 30,
            anomaly_threshold: 0.5,
            anomaly_alpha: 0.6,
            query_timeout_ms: 3000,
            embedder_backend: None,
            vector_backend_url: "memory:".to_string(),
            control_store_path: PathBuf::from("via_control.db"),
            regression_log_path: PathBuf::from("via_regressions.jsonl"),
            dedup_capacity: 100_000,
            bind_addr: "0.0.0.0:7600".to_string(),
            analysis_interval_sec: 60,
            sweep_interval_sec: 30,
        }
    }
}

impl ViaConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value lookup (tests inject maps here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            t1_window_sec: parse(&lookup, "T1_WINDOW_SEC", defaults.t1_window_sec)?,
            t1_max_points: parse(&lookup, "T1_MAX_POINTS", defaults.t1_max_points)?,
            t2_retention_days: parse(&lookup, "T2_RETENTION_DAYS", defaults.t2_retention_days)?,
            anomaly_threshold: parse(&lookup, "ANOMALY_THRESHOLD", defaults.anomaly_threshold)?,
            anomaly_alpha: parse(&lookup, "ANOMALY_ALPHA", defaults.anomaly_alpha)?,
            query_timeout_ms: parse(&lookup, "QUERY_TIMEOUT_MS", defaults.query_timeout_ms)?,
            embedder_backend: lookup("EMBEDDER_BACKEND").filter(|s| !s.is_empty()),
            vector_backend_url: lookup("VECTOR_BACKEND_URL")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.vector_backend_url),
            control_store_path: lookup("CONTROL_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.control_store_path),
            regression_log_path: lookup("REGRESSION_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.regression_log_path),
            dedup_capacity: parse(&lookup, "DEDUP_CAPACITY", defaults.dedup_capacity)?,
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            analysis_interval_sec: parse(
                &lookup,
                "ANALYSIS_INTERVAL_SEC",
                defaults.analysis_interval_sec,
            )?,
            sweep_interval_sec: parse(&lookup, "SWEEP_INTERVAL_SEC", defaults.sweep_interval_sec)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.t1_window_sec <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "T1_WINDOW_SEC",
                value: self.t1_window_sec.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.anomaly_alpha) {
            return Err(ConfigError::InvalidValue {
                key: "ANOMALY_ALPHA",
                value: self.anomaly_alpha.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.t2_retention_days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "T2_RETENTION_DAYS",
                value: self.t2_retention_days.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether the in-process vector engine is selected.
    pub fn uses_memory_backend(&self) -> bool {
        self.vector_backend_url == "memory:"
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.is_empty() => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(entries: &[(&str, &str)]) -> Result<ViaConfig, ConfigError> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ViaConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_contract() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.t1_window_sec, 1800);
        assert_eq!(config.t1_max_points, 200_000);
        assert_eq!(config.t2_retention_days, 30);
        assert!((config.anomaly_threshold - 0.5).abs() < f64::EPSILON);
        assert!((config.anomaly_alpha - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.query_timeout_ms, 3000);
        assert!(config.uses_memory_backend());
        assert_eq!(config.dedup_capacity, 100_000);
    }

    #[test]
    fn values_override_defaults() {
        let config = from_map(&[
            ("T1_WINDOW_SEC", "600"),
            ("ANOMALY_THRESHOLD", "0.75"),
            ("VECTOR_BACKEND_URL", "http://qdrant:6333"),
        ])
        .unwrap();
        assert_eq!(config.t1_window_sec, 600);
        assert!((config.anomaly_threshold - 0.75).abs() < f64::EPSILON);
        assert!(!config.uses_memory_backend());
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = from_map(&[("T1_MAX_POINTS", "a lot")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "T1_MAX_POINTS",
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_alpha_is_rejected() {
        let err = from_map(&[("ANOMALY_ALPHA", "1.5")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ANOMALY_ALPHA",
                ..
            }
        ));
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = from_map(&[("T1_WINDOW_SEC", ""), ("EMBEDDER_BACKEND", "")]).unwrap();
        assert_eq!(config.t1_window_sec, 1800);
        assert!(config.embedder_backend.is_none());
    }
}
