//! Runtime knobs, read from `FLEET_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Period of the per-cluster rediscovery loop.
    pub refresh_interval: Duration,
    /// Deadline applied to every discovery, listing and watch-open call.
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Upper bound for a single cache task to exit after cancellation.
    pub teardown_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            refresh_interval: env_u64("FLEET_REFRESH_SECS").map(Duration::from_secs).unwrap_or(d.refresh_interval),
            request_timeout: env_u64("FLEET_REQUEST_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.request_timeout),
            backoff_base: env_u64("FLEET_WATCH_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_u64("FLEET_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            teardown_timeout: env_u64("FLEET_TEARDOWN_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.teardown_timeout),
        }
    }

    /// Delay before the `attempt`-th reseed: `base * 2^attempt`, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring non-numeric setting");
            None
        }
    }
}
