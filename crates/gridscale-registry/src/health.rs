//! Per-pool health state: phase, backoff, registration tracking.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use gridscale_model::NodeId;

/// Where a pool sits in its lifecycle this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Stable,
    /// A scale-up was issued; ready count has not yet caught up.
    ScalingUp,
    /// Cooling off after provider failures or registration timeouts.
    /// Excluded from both scale-up and scale-down until the timer expires.
    Backoff,
    /// Ready count below target past the registration grace period.
    Unhealthy,
}

/// Backoff growth parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff duration in seconds.
    pub base_secs: u64,
    /// Cap on the doubled duration.
    pub max_secs: u64,
    /// A failure-free interval this long resets the duration to base.
    pub reset_after_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            max_secs: 1800,
            reset_after_secs: 180,
        }
    }
}

/// Health record for one pool. Owned by the registry; read-only elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub pool_id: String,
    pub phase: PoolPhase,
    /// Ready nodes observed this tick.
    pub ready: u32,
    /// All nodes observed for this pool this tick (ready or not).
    pub observed: u32,
    /// Effective target size, raised optimistically on scale-up attempts.
    pub target: u32,
    /// Observed nodes that never became Ready within the grace period.
    pub unregistered: Vec<NodeId>,
    /// Instant the current backoff expires (epoch seconds).
    pub backoff_until: u64,
    /// Next backoff duration to apply (doubles per consecutive failure).
    pub(crate) next_backoff_secs: u64,
    pub consecutive_failures: u32,
    pub(crate) last_failure_at: u64,
    pub last_scale_up_at: u64,
    pub last_scale_down_at: u64,
    /// Deadline by which nodes from the latest scale-up must register.
    pub(crate) registration_deadline: Option<u64>,
    /// Optimistic target increase not yet acknowledged by the provider.
    pub(crate) pending_delta: u32,
    /// Idempotency keys applied this tick; cleared at tick start.
    #[serde(skip)]
    pub(crate) applied_this_tick: HashSet<String>,
}

impl PoolHealth {
    pub(crate) fn new(pool_id: &str, target: u32, backoff: &BackoffConfig) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            phase: PoolPhase::Stable,
            ready: 0,
            observed: 0,
            target,
            unregistered: Vec::new(),
            backoff_until: 0,
            next_backoff_secs: backoff.base_secs,
            consecutive_failures: 0,
            last_failure_at: 0,
            last_scale_up_at: 0,
            last_scale_down_at: 0,
            registration_deadline: None,
            pending_delta: 0,
            applied_this_tick: HashSet::new(),
        }
    }

    pub fn in_backoff(&self, now: u64) -> bool {
        self.phase == PoolPhase::Backoff && now < self.backoff_until
    }

    /// Record a failure and enter backoff with exponential growth.
    /// Returns the new expiry.
    pub(crate) fn enter_backoff(&mut self, now: u64, backoff: &BackoffConfig) -> u64 {
        let duration = self.next_backoff_secs;
        self.backoff_until = now + duration;
        self.next_backoff_secs = (self.next_backoff_secs * 2).min(backoff.max_secs);
        self.consecutive_failures += 1;
        self.last_failure_at = now;
        self.phase = PoolPhase::Backoff;
        info!(
            pool = %self.pool_id,
            duration_secs = duration,
            failures = self.consecutive_failures,
            "pool entered backoff"
        );
        self.backoff_until
    }

    /// Tick-boundary reconciliation: expire backoff, reset doubling after a
    /// failure-free interval, settle ScalingUp/Unhealthy against observed
    /// ready count.
    pub(crate) fn reconcile(&mut self, now: u64, backoff: &BackoffConfig) {
        if self.phase == PoolPhase::Backoff && now >= self.backoff_until {
            debug!(pool = %self.pool_id, "backoff expired");
            self.phase = PoolPhase::Stable;
        }
        if self.consecutive_failures > 0
            && now.saturating_sub(self.last_failure_at) >= backoff.reset_after_secs
        {
            self.next_backoff_secs = backoff.base_secs;
            self.consecutive_failures = 0;
        }
        if self.phase == PoolPhase::Backoff {
            return;
        }

        if self.ready >= self.target {
            if self.phase != PoolPhase::Stable {
                info!(pool = %self.pool_id, "pool recovered");
            }
            self.phase = PoolPhase::Stable;
            self.registration_deadline = None;
        } else if let Some(deadline) = self.registration_deadline {
            // Shortfall within the grace window is still just ScalingUp.
            self.phase = if now < deadline {
                PoolPhase::ScalingUp
            } else {
                PoolPhase::Unhealthy
            };
        } else {
            self.phase = PoolPhase::Unhealthy;
        }
    }
}
