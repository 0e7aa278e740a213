use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the conflict resolver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Collection rounds allowed after aborts changed a classification.
    pub max_resolution_rounds: usize,
    /// Abort requests per conflicting transaction before giving up.
    pub max_abort_attempts: usize,
    /// Retries of a transient status oracle failure.
    pub max_status_retries: usize,
    /// Pause between status oracle retries.
    pub status_retry_backoff: Duration,
    /// Extra time granted to reacquire locks after a wait expired.
    pub lock_reacquire_grace: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_resolution_rounds: 10,
            max_abort_attempts: 3,
            max_status_retries: 3,
            status_retry_backoff: Duration::from_millis(5),
            lock_reacquire_grace: Duration::from_millis(20),
        }
    }
}
