use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, PersistResult};

/// Timing and retry policy of a [`Database`](crate::Database).
///
/// ```toml
/// commit_timeout_ms = 5000
/// batch_retry_interval_ms = 250
/// reference_retry_interval_ms = 1000
/// max_batch_passes = 32
/// schema_version = 1
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Per-entity write timeout. A batch pass is abandoned after twice this.
    pub commit_timeout_ms: u64,
    /// Delay between batch passes while entities are still pending.
    pub batch_retry_interval_ms: u64,
    /// How long a failed reference retrieval is served from the error cache.
    pub reference_retry_interval_ms: u64,
    /// Passes after which still-pending entities are dropped. `None` retries forever.
    pub max_batch_passes: Option<u32>,
    /// Stamped into every stored record.
    pub schema_version: u32,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 5_000,
            batch_retry_interval_ms: 250,
            reference_retry_interval_ms: 1_000,
            max_batch_passes: Some(32),
            schema_version: 1,
        }
    }
}

impl PersistConfig {
    /// Parse from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> PersistResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| PersistError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.commit_timeout_ms == 0 {
            return Err(PersistError::Config("commit_timeout_ms must be > 0".into()));
        }
        if self.max_batch_passes == Some(0) {
            return Err(PersistError::Config("max_batch_passes must be > 0".into()));
        }
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Watchdog for one full batch pass.
    pub fn pass_timeout(&self) -> Duration {
        self.commit_timeout() * 2
    }

    pub fn batch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.batch_retry_interval_ms)
    }

    pub fn reference_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reference_retry_interval_ms)
    }
}
