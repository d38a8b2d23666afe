//! The scaling registry: single source of truth for pool health, backoff,
//! and in-flight work.
//!
//! Owned by the control loop's single thread; the orchestrator and planner
//! get `&` for queries and report outcomes through `&mut` — they run
//! sequenced within one tick, never concurrently.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gridscale_model::{NodeId, PoolId};

use crate::error::{RegistryError, RegistryResult};
use crate::health::{BackoffConfig, PoolHealth, PoolPhase};

/// Registry tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backoff: BackoffConfig,
    /// Seconds a new node gets to register (become Ready) after a
    /// scale-up before it is classified unregistered.
    pub registration_grace_secs: u64,
    /// Unregistered count above which the pool enters backoff.
    pub max_unregistered: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            registration_grace_secs: 900,
            max_unregistered: 0,
        }
    }
}

/// A node as observed in this tick's snapshot, reduced to what the
/// registry tracks.
#[derive(Debug, Clone)]
pub struct ObservedNode {
    pub id: NodeId,
    pub ready: bool,
    pub created_at: u64,
}

/// In-flight drain record for a node awaiting provider confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRecord {
    pub pool_id: PoolId,
    pub since: u64,
}

/// Success/failure of a provider call, reported back by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Long-lived mutable state for the whole engine. Everything else is
/// rebuilt from the snapshot each tick.
#[derive(Debug, Default)]
pub struct ScalingRegistry {
    config: RegistryConfig,
    pools: HashMap<PoolId, PoolHealth>,
    draining: HashMap<NodeId, DrainRecord>,
    /// Node id → instant its utilization first dropped below threshold.
    unneeded_since: HashMap<NodeId, u64>,
    tick: u64,
}

impl ScalingRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            pools: HashMap::new(),
            draining: HashMap::new(),
            unneeded_since: HashMap::new(),
            tick: 0,
        }
    }

    /// Start a tick: bump the sequence number and clear per-tick
    /// idempotency keys.
    pub fn begin_tick(&mut self) -> u64 {
        self.tick += 1;
        for health in self.pools.values_mut() {
            health.applied_this_tick.clear();
        }
        self.tick
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    // ── Observation & reconciliation ──────────────────────────────

    /// Refresh a pool's health from this tick's snapshot and the provider's
    /// reported target. Creates the entry on first sight. Classifies
    /// unregistered nodes and triggers backoff when their count exceeds
    /// the threshold.
    pub fn observe_pool(
        &mut self,
        pool_id: &str,
        provider_target: u32,
        nodes: &[ObservedNode],
        now: u64,
    ) {
        let backoff = self.config.backoff.clone();
        let grace = self.config.registration_grace_secs;
        let max_unregistered = self.config.max_unregistered;

        let health = self
            .pools
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolHealth::new(pool_id, provider_target, &backoff));

        health.observed = nodes.len() as u32;
        health.ready = nodes.iter().filter(|n| n.ready).count() as u32;

        // Nodes that joined the API but never went Ready within grace.
        health.unregistered = nodes
            .iter()
            .filter(|n| !n.ready && now.saturating_sub(n.created_at) > grace)
            .map(|n| n.id.clone())
            .collect();
        health.unregistered.sort();

        // Adopt the provider's target when nothing is in flight, so
        // externally-made resizes converge instead of fighting the
        // optimistic count.
        let pool_draining = self.draining.values().any(|d| d.pool_id == pool_id);
        if health.registration_deadline.is_none() && !pool_draining {
            health.target = provider_target;
        }

        // A registration deadline that expired with a shortfall counts the
        // missing nodes as unregistered even if they never appeared.
        let mut unregistered_count = health.unregistered.len() as u32;
        if let Some(deadline) = health.registration_deadline
            && now >= deadline
            && health.observed < health.target
        {
            unregistered_count += health.target - health.observed;
        }

        if unregistered_count > max_unregistered
            && !health.in_backoff(now)
            && health.applied_this_tick.insert("unregistered-backoff".to_string())
        {
            warn!(
                pool = %pool_id,
                unregistered = unregistered_count,
                "registration timeout, pool backing off"
            );
            health.enter_backoff(now, &backoff);
        }

        health.reconcile(now, &backoff);
    }

    /// Drop per-node records for nodes no longer present in the snapshot.
    /// A draining node that vanished is the provider finishing an
    /// acknowledged removal: its pool's target is decremented here, at the
    /// reconciliation point, not when the call was issued.
    pub fn prune_nodes(&mut self, live: &HashSet<NodeId>, now: u64) {
        self.unneeded_since.retain(|id, _| live.contains(id));

        let gone: Vec<(NodeId, PoolId)> = self
            .draining
            .iter()
            .filter(|(id, _)| !live.contains(id.as_str()))
            .map(|(id, record)| (id.clone(), record.pool_id.clone()))
            .collect();
        for (node_id, pool_id) in gone {
            self.draining.remove(&node_id);
            if let Some(health) = self.pools.get_mut(&pool_id) {
                health.target = health.target.saturating_sub(1);
                health.last_scale_down_at = now;
                debug!(node = %node_id, pool = %pool_id, target = health.target, "removal reconciled");
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn is_healthy(&self, pool_id: &str) -> bool {
        self.pools
            .get(pool_id)
            .is_none_or(|h| matches!(h.phase, PoolPhase::Stable | PoolPhase::ScalingUp))
    }

    pub fn is_in_backoff(&self, pool_id: &str, now: u64) -> bool {
        self.pools
            .get(pool_id)
            .is_some_and(|h| h.in_backoff(now))
    }

    /// Nodes the pool expected that never became Ready — candidates for
    /// forced removal.
    pub fn unregistered_nodes(&self, pool_id: &str) -> Vec<NodeId> {
        self.pools
            .get(pool_id)
            .map(|h| h.unregistered.clone())
            .unwrap_or_default()
    }

    pub fn pool(&self, pool_id: &str) -> Option<&PoolHealth> {
        self.pools.get(pool_id)
    }

    // ── Scale-up bookkeeping ──────────────────────────────────────

    /// Record a scale-up the orchestrator is about to issue: raise the
    /// target optimistically and open a registration window.
    pub fn record_scale_up_attempt(
        &mut self,
        pool_id: &str,
        delta: u32,
        now: u64,
    ) -> RegistryResult<()> {
        let backoff = self.config.backoff.clone();
        let grace = self.config.registration_grace_secs;
        let health = self
            .pools
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolHealth::new(pool_id, 0, &backoff));

        let key = format!("scale-up-attempt:{delta}");
        if !health.applied_this_tick.insert(key) {
            return Ok(());
        }

        health.target += delta;
        health.pending_delta += delta;
        health.registration_deadline = Some(now + grace);
        health.last_scale_up_at = now;
        health.phase = PoolPhase::ScalingUp;
        debug!(pool = %pool_id, delta, target = health.target, "scale-up attempt recorded");
        Ok(())
    }

    /// Record the provider's response to a scale-up call. Failure rolls
    /// back the optimistic target and puts the pool into backoff.
    pub fn record_scale_up_result(
        &mut self,
        pool_id: &str,
        outcome: Outcome,
        now: u64,
    ) -> RegistryResult<()> {
        let backoff = self.config.backoff.clone();
        let health = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| RegistryError::UnknownPool(pool_id.to_string()))?;

        let key = format!("scale-up-result:{outcome:?}");
        if !health.applied_this_tick.insert(key) {
            return Ok(());
        }

        match outcome {
            Outcome::Success => {
                health.pending_delta = 0;
            }
            Outcome::Failure => {
                health.target = health.target.saturating_sub(health.pending_delta);
                health.pending_delta = 0;
                health.registration_deadline = None;
                health.enter_backoff(now, &backoff);
            }
        }
        Ok(())
    }

    /// A node expected from a scale-up became Ready: strike it off the
    /// unregistered list and, once the ready count has caught up to the
    /// target, close the registration window. Ready counts themselves come
    /// from [`Self::observe_pool`]'s recount — this never increments them,
    /// so reporting the same node any number of times is harmless.
    pub fn record_node_registered(
        &mut self,
        pool_id: &str,
        node_id: &str,
        _now: u64,
    ) -> RegistryResult<()> {
        let health = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| RegistryError::UnknownPool(pool_id.to_string()))?;

        let key = format!("registered:{node_id}");
        if !health.applied_this_tick.insert(key) {
            return Ok(());
        }
        health.unregistered.retain(|id| id != node_id);
        if health.ready >= health.target {
            health.registration_deadline = None;
        }
        Ok(())
    }

    // ── Scale-down bookkeeping ────────────────────────────────────

    /// Mark a node as draining until the provider confirms removal.
    pub fn begin_drain(&mut self, node_id: &str, pool_id: &str, now: u64) {
        self.draining.insert(
            node_id.to_string(),
            DrainRecord {
                pool_id: pool_id.to_string(),
                since: now,
            },
        );
    }

    pub fn is_draining(&self, node_id: &str) -> bool {
        self.draining.contains_key(node_id)
    }

    /// Nodes of a pool currently draining (for the per-pool concurrency cap).
    pub fn draining_count(&self, pool_id: &str) -> u32 {
        self.draining
            .values()
            .filter(|d| d.pool_id == pool_id)
            .count() as u32
    }

    /// Record the provider's response to a node removal. Success only
    /// acknowledges the call — the drain record stays until the node is
    /// observed gone ([`Self::prune_nodes`] decrements the target then), so
    /// a slow cloud deletion cannot be re-planned or double-decremented.
    /// Failure backs the pool off and releases the record so the node can
    /// be re-planned later.
    pub fn record_scale_down_result(
        &mut self,
        pool_id: &str,
        node_id: &str,
        outcome: Outcome,
        now: u64,
    ) -> RegistryResult<()> {
        let backoff = self.config.backoff.clone();
        let health = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| RegistryError::UnknownPool(pool_id.to_string()))?;

        let key = format!("scale-down-result:{node_id}:{outcome:?}");
        if !health.applied_this_tick.insert(key) {
            return Ok(());
        }

        match outcome {
            Outcome::Success => {
                health.last_scale_down_at = now;
            }
            Outcome::Failure => {
                health.enter_backoff(now, &backoff);
                self.draining.remove(node_id);
            }
        }
        Ok(())
    }

    // ── Utilization window ────────────────────────────────────────

    /// Track how long a node has been below the utilization threshold.
    /// Returns the seconds it has been continuously unneeded.
    pub fn observe_utilization(&mut self, node_id: &str, below_threshold: bool, now: u64) -> u64 {
        if !below_threshold {
            self.unneeded_since.remove(node_id);
            return 0;
        }
        let since = *self
            .unneeded_since
            .entry(node_id.to_string())
            .or_insert(now);
        now.saturating_sub(since)
    }

    pub fn unneeded_for(&self, node_id: &str, now: u64) -> u64 {
        self.unneeded_since
            .get(node_id)
            .map(|&since| now.saturating_sub(since))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(id: &str, ready: bool, created_at: u64) -> ObservedNode {
        ObservedNode {
            id: id.to_string(),
            ready,
            created_at,
        }
    }

    fn registry() -> ScalingRegistry {
        ScalingRegistry::new(RegistryConfig {
            backoff: BackoffConfig {
                base_secs: 60,
                max_secs: 1800,
                reset_after_secs: 180,
            },
            registration_grace_secs: 300,
            max_unregistered: 0,
        })
    }

    #[test]
    fn scale_up_attempt_raises_target_once_per_tick() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 2, &[observed("n1", true, 0), observed("n2", true, 0)], 1000);

        reg.record_scale_up_attempt("pool-a", 3, 1000).unwrap();
        reg.record_scale_up_attempt("pool-a", 3, 1000).unwrap();

        assert_eq!(reg.pool("pool-a").unwrap().target, 5);
    }

    #[test]
    fn scale_up_result_applied_twice_counts_once() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 2, &[], 1000);
        reg.record_scale_up_attempt("pool-a", 2, 1000).unwrap();

        reg.record_scale_up_result("pool-a", Outcome::Failure, 1000).unwrap();
        let after_once = (
            reg.pool("pool-a").unwrap().target,
            reg.pool("pool-a").unwrap().backoff_until,
            reg.pool("pool-a").unwrap().consecutive_failures,
        );

        reg.record_scale_up_result("pool-a", Outcome::Failure, 1000).unwrap();
        let after_twice = (
            reg.pool("pool-a").unwrap().target,
            reg.pool("pool-a").unwrap().backoff_until,
            reg.pool("pool-a").unwrap().consecutive_failures,
        );

        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn provider_failure_enters_backoff_and_rolls_back_target() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 2, &[], 1000);
        reg.record_scale_up_attempt("pool-a", 3, 1000).unwrap();
        assert_eq!(reg.pool("pool-a").unwrap().target, 5);

        reg.record_scale_up_result("pool-a", Outcome::Failure, 1000).unwrap();
        assert_eq!(reg.pool("pool-a").unwrap().target, 2);
        assert!(reg.is_in_backoff("pool-a", 1030));
        assert!(!reg.is_in_backoff("pool-a", 1061));
    }

    #[test]
    fn consecutive_failures_double_backoff() {
        let mut reg = registry();
        for (tick_now, expected_duration) in [(1000, 60), (1100, 120), (1200, 240)] {
            reg.begin_tick();
            reg.observe_pool("pool-a", 2, &[], tick_now);
            reg.record_scale_up_attempt("pool-a", 1, tick_now).unwrap();
            reg.record_scale_up_result("pool-a", Outcome::Failure, tick_now).unwrap();
            let health = reg.pool("pool-a").unwrap();
            assert_eq!(health.backoff_until - tick_now, expected_duration);
        }
    }

    #[test]
    fn stale_not_ready_node_is_unregistered() {
        let mut reg = registry();
        reg.begin_tick();
        let nodes = [
            observed("n1", true, 0),
            observed("n2", false, 500), // 600s old at now=1100, grace 300.
        ];
        reg.observe_pool("pool-a", 2, &nodes, 1100);

        assert_eq!(reg.unregistered_nodes("pool-a"), vec!["n2".to_string()]);
        // Count (1) exceeds threshold (0) → backoff.
        assert!(reg.is_in_backoff("pool-a", 1100));
    }

    #[test]
    fn fresh_not_ready_node_is_not_unregistered() {
        let mut reg = registry();
        reg.begin_tick();
        let nodes = [observed("n1", true, 0), observed("n2", false, 1000)];
        reg.observe_pool("pool-a", 2, &nodes, 1100);
        assert!(reg.unregistered_nodes("pool-a").is_empty());
        assert!(!reg.is_in_backoff("pool-a", 1100));
    }

    #[test]
    fn drain_target_decrements_only_when_node_observed_gone() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 3, &[], 1000);

        reg.begin_drain("n2", "pool-a", 1000);
        assert!(reg.is_draining("n2"));
        assert_eq!(reg.draining_count("pool-a"), 1);

        // Provider acknowledged, but the node still shows up in the
        // snapshot: the record holds and the target is untouched.
        reg.record_scale_down_result("pool-a", "n2", Outcome::Success, 1050).unwrap();
        assert!(reg.is_draining("n2"));
        assert_eq!(reg.pool("pool-a").unwrap().target, 3);

        // The node vanishes; prune reconciles.
        reg.prune_nodes(&HashSet::from(["n1".to_string(), "n3".to_string()]), 1100);
        assert!(!reg.is_draining("n2"));
        assert_eq!(reg.pool("pool-a").unwrap().target, 2);
    }

    #[test]
    fn scale_down_result_idempotent_within_tick() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 3, &[], 1000);
        reg.begin_drain("n2", "pool-a", 1000);

        reg.record_scale_down_result("pool-a", "n2", Outcome::Success, 1050).unwrap();
        let after_once = (reg.pool("pool-a").unwrap().target, reg.is_draining("n2"));
        reg.record_scale_down_result("pool-a", "n2", Outcome::Success, 1050).unwrap();
        let after_twice = (reg.pool("pool-a").unwrap().target, reg.is_draining("n2"));
        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn failed_removal_releases_drain_record() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 3, &[], 1000);
        reg.begin_drain("n2", "pool-a", 1000);

        reg.record_scale_down_result("pool-a", "n2", Outcome::Failure, 1050).unwrap();
        assert!(!reg.is_draining("n2"));
        assert!(reg.is_in_backoff("pool-a", 1051));
        assert_eq!(reg.pool("pool-a").unwrap().target, 3);
    }

    #[test]
    fn node_registration_never_double_counts_ready() {
        let mut reg = registry();
        reg.begin_tick();
        reg.observe_pool("pool-a", 2, &[observed("n1", true, 0)], 1000);
        reg.record_scale_up_attempt("pool-a", 1, 1000).unwrap();

        reg.record_node_registered("pool-a", "n1", 1000).unwrap();
        let after_once = (
            reg.pool("pool-a").unwrap().ready,
            reg.pool("pool-a").unwrap().registration_deadline,
        );
        reg.record_node_registered("pool-a", "n1", 1000).unwrap();
        let after_twice = (
            reg.pool("pool-a").unwrap().ready,
            reg.pool("pool-a").unwrap().registration_deadline,
        );

        assert_eq!(after_once, after_twice);
        // The recount from observe_pool stays authoritative.
        assert_eq!(reg.pool("pool-a").unwrap().ready, 1);
    }

    #[test]
    fn late_registration_clears_unregistered_and_closes_window() {
        let mut reg = registry();
        reg.begin_tick();
        // n2 is stale and not ready: classified unregistered.
        reg.observe_pool(
            "pool-a",
            2,
            &[observed("n1", true, 0), observed("n2", false, 500)],
            1100,
        );
        assert_eq!(reg.unregistered_nodes("pool-a"), vec!["n2".to_string()]);

        reg.begin_tick();
        // Next tick n2 finally went Ready.
        reg.observe_pool(
            "pool-a",
            2,
            &[observed("n1", true, 0), observed("n2", true, 500)],
            1200,
        );
        reg.record_node_registered("pool-a", "n2", 1200).unwrap();
        assert!(reg.unregistered_nodes("pool-a").is_empty());
        assert!(reg.pool("pool-a").unwrap().registration_deadline.is_none());
    }

    #[test]
    fn utilization_window_accumulates_and_resets() {
        let mut reg = registry();
        assert_eq!(reg.observe_utilization("n1", true, 1000), 0);
        assert_eq!(reg.observe_utilization("n1", true, 1600), 600);

        // A busy interval resets the window.
        assert_eq!(reg.observe_utilization("n1", false, 1700), 0);
        assert_eq!(reg.observe_utilization("n1", true, 1800), 0);
        assert_eq!(reg.observe_utilization("n1", true, 2000), 200);
    }

    #[test]
    fn prune_drops_records_for_vanished_nodes() {
        let mut reg = registry();
        reg.observe_utilization("gone", true, 1000);
        reg.begin_drain("gone", "pool-a", 1000);

        reg.prune_nodes(&HashSet::from(["kept".to_string()]), 2000);
        assert!(!reg.is_draining("gone"));
        assert_eq!(reg.unneeded_for("gone", 2000), 0);
    }

    #[test]
    fn unknown_pool_mutators_error() {
        let mut reg = registry();
        assert!(reg.record_scale_up_result("nope", Outcome::Success, 0).is_err());
        assert!(reg
            .record_scale_down_result("nope", "n1", Outcome::Success, 0)
            .is_err());
    }
}
