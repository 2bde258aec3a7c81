// workhive: pool and per-task option structs.
//
// Section-struct convention grounded on the teacher's `SidecarConfig`
// (`serde`-derived structs with a hand-written `Default`), scaled down to
// the handful of scalars this crate actually has knobs for.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Pool-wide tuning, supplied once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum concurrent workers. Clamped to `[1, default_worker_limit()]`
    /// on construction; see [`PoolOptions::normalized_limit`].
    pub limit: Option<usize>,
    /// Idle eviction timeout in milliseconds. `0` disables eviction and
    /// enables pre-warming to `limit` at construction.
    pub idle_timeout_ms: u64,
    /// Capacity of the overflow FIFO queue. Admission past this capacity
    /// fails fast with [`crate::error::PoolError::QueueFull`].
    pub queue_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            limit: None,
            idle_timeout_ms: 0,
            queue_capacity: 64,
        }
    }
}

impl PoolOptions {
    /// `limit`, or `max(1, hardware_concurrency - 1)` if unset, clamped to
    /// be at least 1.
    pub fn normalized_limit(&self) -> usize {
        let default_max = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        self.limit.unwrap_or(default_max).clamp(1, default_max)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Pre-warming to `limit` is only done when idle eviction is disabled
    /// (otherwise a freshly pre-warmed fleet would start evicting itself
    /// immediately).
    pub fn should_prewarm(&self) -> bool {
        self.idle_timeout_ms == 0
    }

    /// Reads `POOL_LIMIT` / `POOL_IDLE_TIMEOUT_MS` / `POOL_QUEUE_CAPACITY`
    /// from the environment, falling back to defaults for any unset or
    /// unparsable variable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            limit: std::env::var("POOL_LIMIT").ok().and_then(|v| v.parse().ok()),
            idle_timeout_ms: std::env::var("POOL_IDLE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.idle_timeout_ms),
            queue_capacity: std::env::var("POOL_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_capacity),
        }
    }
}

/// Per-task options accepted by a schedule call.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}
