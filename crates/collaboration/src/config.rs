/// Runtime configuration shared by the collaboration services
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result, RetryPolicy, VotingPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a lock stays live without renewal.
    pub lease_secs: u64,
}

impl LockConfig {
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// No activity for this long marks a user idle
    pub idle_after_secs: u64,
    /// No activity for this long drops the user from the roster
    pub evict_after_secs: u64,
}

impl PresenceConfig {
    pub fn idle_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_after_secs.min(i64::MAX as u64) as i64)
    }

    pub fn evict_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.evict_after_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_after_secs: 60,
            evict_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub locks: LockConfig,
    pub voting: VotingPolicy,
    pub presence: PresenceConfig,
    pub retry: RetryPolicy,
}

impl CollabConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CollaborationError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.locks.lease_secs == 0 {
            return Err(CollaborationError::Config(
                "locks.lease_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}
