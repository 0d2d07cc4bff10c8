//! Per-server failure accounting with exponential backoff.
//!
//! The tracker knows nothing about transports. The registry records every
//! connection attempt here and consults [`RetryTracker::can_retry`] before
//! building a new client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use mcpgate_core::config::RetryConfig;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Consecutive failures after which the server should be disabled.
    pub give_up_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            give_up_after: 5,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            give_up_after: config.give_up_after,
        }
    }
}

impl RetryPolicy {
    /// Wait imposed after `failures` consecutive failures:
    /// `min(max, base * 2^(failures-1))`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Failure bookkeeping for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureInfo {
    pub failure_count: u32,
    pub last_failure: Instant,
    pub next_retry: Instant,
    pub gave_up: bool,
}

/// Thread-safe failure tracker keyed by server id.
#[derive(Debug, Default)]
pub struct RetryTracker {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, FailureInfo>>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record a failed attempt and return the updated entry.
    pub fn record_failure(&self, server_id: &str) -> FailureInfo {
        self.record_failure_at(server_id, Instant::now())
    }

    pub fn record_failure_at(&self, server_id: &str, now: Instant) -> FailureInfo {
        let mut entries = self.entries.lock();
        let count = entries
            .get(server_id)
            .map_or(0, |info| info.failure_count)
            .saturating_add(1);

        let info = FailureInfo {
            failure_count: count,
            last_failure: now,
            next_retry: now + self.policy.backoff(count),
            gave_up: count >= self.policy.give_up_after,
        };
        entries.insert(server_id.to_string(), info);

        debug!(
            server = %server_id,
            failures = count,
            backoff_ms = self.policy.backoff(count).as_millis() as u64,
            "Recorded connection failure"
        );
        info
    }

    /// Forget all failures for a server.
    pub fn record_success(&self, server_id: &str) {
        if self.entries.lock().remove(server_id).is_some() {
            debug!(server = %server_id, "Cleared failure record after success");
        }
    }

    /// Drop the entry without implying success (unregister, auto-disable).
    pub fn clear(&self, server_id: &str) {
        self.entries.lock().remove(server_id);
    }

    /// True when no failure is on record or the backoff has elapsed.
    pub fn can_retry(&self, server_id: &str) -> bool {
        self.can_retry_at(server_id, Instant::now())
    }

    pub fn can_retry_at(&self, server_id: &str, now: Instant) -> bool {
        self.entries
            .lock()
            .get(server_id)
            .map_or(true, |info| now > info.next_retry)
    }

    /// True once the failure count reaches the give-up threshold.
    pub fn should_give_up(&self, server_id: &str) -> bool {
        self.entries
            .lock()
            .get(server_id)
            .map_or(false, |info| info.gave_up)
    }

    /// Time left before the next attempt is allowed.
    pub fn retry_in(&self, server_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(server_id)
            .map(|info| info.next_retry.saturating_duration_since(now))
    }

    pub fn failure_info(&self, server_id: &str) -> Option<FailureInfo> {
        self.entries.lock().get(server_id).copied()
    }

    pub fn failure_count(&self, server_id: &str) -> u32 {
        self.failure_info(server_id).map_or(0, |info| info.failure_count)
    }
}
