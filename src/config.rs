use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::MAX_PUSH_BATCH;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Sync tunables. Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coalescing window between the first local mutation and the sync cycle.
    pub debounce_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Operations per push request, clamped to the remote batch cap.
    pub push_batch_size: usize,
    /// How long a flush may run after the app is backgrounded.
    pub background_grace_ms: u64,
    /// Re-pull/re-merge attempts after the remote rejects a push.
    pub max_rejected_retries: u32,
    /// Pause before pushing again after a quota or size error.
    pub capacity_retry_ms: u64,
    /// Pull pages fetched per aggregate in one cycle.
    pub pull_page_limit: u32,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            push_batch_size: MAX_PUSH_BATCH,
            background_grace_ms: 5_000,
            max_rejected_retries: 3,
            capacity_retry_ms: 15 * 60 * 1_000,
            pull_page_limit: 16,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid("backoff_base_ms must be positive"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid("backoff_max_ms below backoff_base_ms"));
        }
        if self.pull_page_limit == 0 {
            return Err(ConfigError::Invalid("pull_page_limit must be positive"));
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }

    pub fn capacity_retry(&self) -> Duration {
        Duration::from_millis(self.capacity_retry_ms)
    }

    pub fn push_batch_size(&self) -> usize {
        self.push_batch_size.clamp(1, MAX_PUSH_BATCH)
    }

    /// Exponential backoff for the given failed attempt (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = SyncConfig::from_json_str(r#"{"debounce_ms": 500}"#).unwrap();
        assert_eq!(cfg.debounce(), Duration::from_millis(500));
        assert_eq!(cfg.push_batch_size(), MAX_PUSH_BATCH);
        assert_eq!(cfg.max_rejected_retries, 3);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_secs(1));
        assert_eq!(cfg.backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff(3), Duration::from_secs(4));
        assert_eq!(cfg.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn batch_size_is_clamped_to_remote_cap() {
        let cfg = SyncConfig {
            push_batch_size: 10_000,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.push_batch_size(), MAX_PUSH_BATCH);
        let cfg = SyncConfig {
            push_batch_size: 0,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.push_batch_size(), 1);
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = SyncConfig::from_json_str(r#"{"backoff_base_ms": 10, "backoff_max_ms": 5}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"pull_page_limit": 2}"#).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().pull_page_limit, 2);
    }
}
