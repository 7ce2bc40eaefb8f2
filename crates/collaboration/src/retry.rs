/// Bounded exponential backoff for reads that must observe a recent write
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CollaborationError, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Calls `probe` until it yields a value, sleeping with backoff in between.
///
/// Transient failures are retried like an empty result; any other error ends
/// the poll. Gives up with [`CollaborationError::Timeout`] after
/// `max_attempts` probes.
pub async fn poll_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.kind() == ErrorKind::TransientFailure => {
                debug!("Transient failure polling {}: {}", what, e);
            }
            Err(e) => return Err(e),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }
    Err(CollaborationError::Timeout(what.to_string()))
}
