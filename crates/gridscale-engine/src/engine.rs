//! The control loop: one `tick()` per interval, strictly ordered.
//!
//! ```text
//! snapshot ─▶ validate ─▶ observe pools ─▶ force-remove unregistered
//!          ─▶ hypothetical scheduling ─▶ scale-up plan + apply
//!          ─▶ scale-down plan (sees pending capacity) + apply
//! ```
//!
//! The registry is owned here and handed to the planners as `&mut` — all
//! mutation is sequenced within the tick, never concurrent. Provider
//! calls run under a timeout; a timeout counts as a failure and backs the
//! pool off like any other provider error.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use gridscale_model::{
    BoxFuture, ClusterSnapshot, Node, NodePool, PodId, ScaleDownDecision, ScaleDownReason,
    ScaleUpDecision, pool_of,
};
use gridscale_registry::{ObservedNode, Outcome, ScalingRegistry};
use gridscale_scaledown::plan_scale_down;
use gridscale_scaleup::plan_scale_up;
use gridscale_sim::find_placement;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EntityKind, StatusEvent};

/// Where the engine gets its view of the cluster each tick.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<ClusterSnapshot>>;
}

/// Everything one tick decided and observed.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub tick: u64,
    /// Scale-ups successfully issued to the provider.
    pub scale_ups: Vec<ScaleUpDecision>,
    /// Node removals successfully issued (drains and forced removals).
    pub scale_downs: Vec<ScaleDownDecision>,
    /// Pods no pool's template can host.
    pub unschedulable: Vec<PodId>,
    pub events: Vec<StatusEvent>,
}

pub struct Engine {
    config: EngineConfig,
    source: Arc<dyn SnapshotSource>,
    pools: Vec<Arc<dyn NodePool>>,
    registry: ScalingRegistry,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn SnapshotSource>,
        pools: Vec<Arc<dyn NodePool>>,
    ) -> Self {
        let registry = ScalingRegistry::new(config.registry.clone());
        Self {
            config,
            source,
            pools,
            registry,
        }
    }

    /// Registry state, for inspection.
    pub fn registry(&self) -> &ScalingRegistry {
        &self.registry
    }

    /// Run one full decision cycle against a fresh snapshot.
    pub async fn tick(&mut self, now: u64) -> EngineResult<TickOutcome> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.tick_deadline_secs);
        let provider_timeout = Duration::from_secs(self.config.provider_timeout_secs);

        let raw = self
            .source
            .snapshot()
            .await
            .map_err(EngineError::Snapshot)?;

        let mut outcome = TickOutcome::default();
        let snapshot = self.validate(raw, &mut outcome.events);

        let was_backoff: Vec<(String, bool)> = self
            .pools
            .iter()
            .map(|p| (p.id().to_string(), self.registry.is_in_backoff(p.id(), now)))
            .collect();

        outcome.tick = self.registry.begin_tick();
        self.observe(&snapshot, now)?;

        self.remove_unregistered(provider_timeout, now, &mut outcome)
            .await?;

        // Hypothetical scheduling: pods that fit on existing capacity are
        // not pending, and two pods cannot both claim the same gap.
        let mut working = snapshot.fork();
        let mut pending = Vec::new();
        for pod in snapshot.unscheduled_pods() {
            match find_placement(&pod, &working) {
                Some(node_id) => working.assign_pod(&pod.id, &node_id),
                None => pending.push(pod),
            }
        }
        debug!(
            unscheduled = snapshot.unscheduled_pods().len(),
            pending = pending.len(),
            "hypothetical scheduling pass"
        );

        let up_plan = plan_scale_up(
            &pending,
            &self.pools,
            &snapshot,
            &mut self.registry,
            &self.config.scale_up,
            now,
            outcome.tick,
            Duration::from_millis(self.config.binpack_budget_ms),
        )
        .await;

        for pod_id in &up_plan.unschedulable {
            outcome.events.push(StatusEvent::PodUnschedulable {
                pod_id: pod_id.clone(),
            });
        }
        outcome.unschedulable = up_plan.unschedulable;

        let mut pending_capacity = Vec::new();
        for decision in &up_plan.decisions {
            let issued = self
                .apply_scale_up(decision, provider_timeout, now, &mut outcome.events)
                .await?;
            if issued {
                self.push_pending_capacity(decision, &mut pending_capacity);
                outcome.scale_ups.push(decision.clone());
            }
        }

        // Plan against the hypothetically-scheduled snapshot: capacity a
        // pending pod would claim is not free to absorb a drained node.
        let down_plan = plan_scale_down(
            &working,
            &self.pools,
            &mut self.registry,
            &pending_capacity,
            &self.config.scale_down,
            now,
            Some(deadline),
        );

        for skipped in down_plan.skipped {
            outcome.events.push(StatusEvent::ScaleDownSkipped {
                node_id: skipped.node_id,
                reason: skipped.reason,
            });
        }
        for decision in down_plan.decisions {
            let issued = self
                .apply_scale_down(&decision, provider_timeout, now, &mut outcome.events)
                .await?;
            if issued {
                outcome.scale_downs.push(decision);
            }
        }

        for (pool_id, was) in was_backoff {
            let is_now = self.registry.is_in_backoff(&pool_id, now);
            if is_now && !was {
                let until = self
                    .registry
                    .pool(&pool_id)
                    .map(|h| h.backoff_until)
                    .unwrap_or(0);
                outcome
                    .events
                    .push(StatusEvent::PoolBackoff { pool_id, until });
            } else if was && !is_now {
                outcome.events.push(StatusEvent::PoolRecovered { pool_id });
            }
        }

        info!(
            tick = outcome.tick,
            scale_ups = outcome.scale_ups.len(),
            scale_downs = outcome.scale_downs.len(),
            unschedulable = outcome.unschedulable.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick complete"
        );
        Ok(outcome)
    }

    /// Run the control loop until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.tick_interval_secs);
        info!(interval_secs = interval.as_secs(), "engine started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick(epoch_secs()).await {
                        error!(error = %e, "tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }
    }

    /// Drop entities the tick must not plan around: nodes with negative
    /// resource quantities, pods likewise, and nodes referencing pools no
    /// adapter serves. Pods assigned to an excluded node keep their
    /// assignment and drop out of planning with it.
    fn validate(
        &self,
        snapshot: ClusterSnapshot,
        events: &mut Vec<StatusEvent>,
    ) -> ClusterSnapshot {
        let mut unknown_pool: HashSet<String> = HashSet::new();
        for node in snapshot.nodes() {
            if let Some(pool_id) = &node.pool_id
                && pool_of(&self.pools, pool_id).is_none()
            {
                warn!(node = %node.id, pool = %pool_id, "excluding node referencing unknown pool");
                events.push(StatusEvent::UnknownPool {
                    node_id: node.id.clone(),
                    pool_id: pool_id.clone(),
                });
                unknown_pool.insert(node.id.clone());
            }
        }

        let clean = unknown_pool.is_empty()
            && snapshot.nodes().all(|n| n.capacity.validate().is_ok())
            && snapshot.pods().all(|p| p.requests.validate().is_ok());
        if clean {
            return snapshot;
        }

        let mut nodes = Vec::new();
        for node in snapshot.nodes() {
            if unknown_pool.contains(&node.id) {
                continue;
            }
            match node.capacity.validate() {
                Ok(()) => nodes.push((**node).clone()),
                Err(e) => {
                    warn!(node = %node.id, error = %e, "excluding node");
                    events.push(StatusEvent::InvalidResources {
                        kind: EntityKind::Node,
                        id: node.id.clone(),
                    });
                }
            }
        }
        let mut pods = Vec::new();
        for pod in snapshot.pods() {
            match pod.requests.validate() {
                Ok(()) => pods.push((**pod).clone()),
                Err(e) => {
                    warn!(pod = %pod.id, error = %e, "excluding pod");
                    events.push(StatusEvent::InvalidResources {
                        kind: EntityKind::Pod,
                        id: pod.id.clone(),
                    });
                }
            }
        }
        let pdbs = snapshot.pdbs().iter().map(|p| (**p).clone()).collect();
        ClusterSnapshot::new(nodes, pods, pdbs)
    }

    /// Feed this tick's snapshot into the registry, pool by pool. Ready
    /// nodes are reported as registered so an open registration window
    /// closes once the nodes a scale-up promised have all arrived.
    fn observe(&mut self, snapshot: &ClusterSnapshot, now: u64) -> EngineResult<()> {
        let mut by_pool: BTreeMap<&str, Vec<ObservedNode>> = BTreeMap::new();
        for node in snapshot.nodes() {
            if let Some(pool_id) = &node.pool_id {
                by_pool.entry(pool_id).or_default().push(ObservedNode {
                    id: node.id.clone(),
                    ready: node.ready,
                    created_at: node.created_at,
                });
            }
        }
        for pool in &self.pools {
            let observed = by_pool.remove(pool.id()).unwrap_or_default();
            self.registry
                .observe_pool(pool.id(), pool.target_size(), &observed, now);
            for node in observed.iter().filter(|n| n.ready) {
                self.registry
                    .record_node_registered(pool.id(), &node.id, now)?;
            }
        }

        let live: HashSet<_> = snapshot.nodes().map(|n| n.id.clone()).collect();
        self.registry.prune_nodes(&live, now);
        Ok(())
    }

    /// Delete nodes that joined the API but never became Ready within the
    /// registration grace period. These hold no workloads, so no drain
    /// simulation is needed.
    async fn remove_unregistered(
        &mut self,
        provider_timeout: Duration,
        now: u64,
        outcome: &mut TickOutcome,
    ) -> EngineResult<()> {
        let pools = self.pools.clone();
        for pool in &pools {
            let ids: Vec<String> = self
                .registry
                .unregistered_nodes(pool.id())
                .into_iter()
                .filter(|id| !self.registry.is_draining(id))
                .collect();
            if ids.is_empty() {
                continue;
            }
            for node_id in &ids {
                outcome.events.push(StatusEvent::NodeUnregistered {
                    node_id: node_id.clone(),
                    pool_id: pool.id().to_string(),
                });
            }
            warn!(pool = %pool.id(), count = ids.len(), "removing unregistered nodes");

            match timeout(provider_timeout, pool.delete_nodes(ids.clone())).await {
                Ok(Ok(())) => {
                    for node_id in ids {
                        self.registry.begin_drain(&node_id, pool.id(), now);
                        self.registry.record_scale_down_result(
                            pool.id(),
                            &node_id,
                            Outcome::Success,
                            now,
                        )?;
                        outcome.events.push(StatusEvent::ScaleDownIssued {
                            node_id: node_id.clone(),
                            pool_id: pool.id().to_string(),
                        });
                        outcome.scale_downs.push(ScaleDownDecision {
                            node_id,
                            pool_id: pool.id().to_string(),
                            reason: ScaleDownReason::Unregistered,
                            grace_period_secs: 0,
                        });
                    }
                }
                Ok(Err(e)) => {
                    warn!(pool = %pool.id(), error = %e, "unregistered removal failed");
                    self.fail_removal(pool.id(), &ids, now, &mut outcome.events)?;
                }
                Err(_) => {
                    warn!(pool = %pool.id(), "unregistered removal timed out");
                    self.fail_removal(pool.id(), &ids, now, &mut outcome.events)?;
                }
            }
        }
        Ok(())
    }

    fn fail_removal(
        &mut self,
        pool_id: &str,
        ids: &[String],
        now: u64,
        events: &mut Vec<StatusEvent>,
    ) -> EngineResult<()> {
        // One failure record is enough to back the pool off.
        if let Some(first) = ids.first() {
            self.registry
                .record_scale_down_result(pool_id, first, Outcome::Failure, now)?;
        }
        for node_id in ids {
            events.push(StatusEvent::ScaleDownFailed {
                node_id: node_id.clone(),
                pool_id: pool_id.to_string(),
            });
        }
        Ok(())
    }

    async fn apply_scale_up(
        &mut self,
        decision: &ScaleUpDecision,
        provider_timeout: Duration,
        now: u64,
        events: &mut Vec<StatusEvent>,
    ) -> EngineResult<bool> {
        let Some(pool) = pool_of(&self.pools, &decision.pool_id) else {
            warn!(pool = %decision.pool_id, "planned pool vanished");
            return Ok(false);
        };
        let new_target = pool.target_size() + decision.delta;

        match timeout(provider_timeout, pool.set_target_size(new_target)).await {
            Ok(Ok(())) => {
                self.registry
                    .record_scale_up_result(&decision.pool_id, Outcome::Success, now)?;
                info!(pool = %decision.pool_id, delta = decision.delta, new_target, "scale-up issued");
                events.push(StatusEvent::ScaleUpIssued {
                    pool_id: decision.pool_id.clone(),
                    delta: decision.delta,
                });
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!(pool = %decision.pool_id, error = %e, "scale-up failed");
                self.registry
                    .record_scale_up_result(&decision.pool_id, Outcome::Failure, now)?;
                events.push(StatusEvent::ScaleUpFailed {
                    pool_id: decision.pool_id.clone(),
                    delta: decision.delta,
                });
                Ok(false)
            }
            Err(_) => {
                warn!(pool = %decision.pool_id, "scale-up timed out");
                self.registry
                    .record_scale_up_result(&decision.pool_id, Outcome::Failure, now)?;
                events.push(StatusEvent::ScaleUpFailed {
                    pool_id: decision.pool_id.clone(),
                    delta: decision.delta,
                });
                Ok(false)
            }
        }
    }

    /// Synthesize the nodes an issued scale-up will eventually add, so the
    /// scale-down pass can re-place evicted pods onto them.
    fn push_pending_capacity(&self, decision: &ScaleUpDecision, out: &mut Vec<Node>) {
        let Some(pool) = pool_of(&self.pools, &decision.pool_id) else {
            return;
        };
        let template = pool.template();
        for seq in 0..decision.delta {
            out.push(template.instantiate(&decision.pool_id, seq));
        }
    }

    async fn apply_scale_down(
        &mut self,
        decision: &ScaleDownDecision,
        provider_timeout: Duration,
        now: u64,
        events: &mut Vec<StatusEvent>,
    ) -> EngineResult<bool> {
        let Some(pool) = pool_of(&self.pools, &decision.pool_id) else {
            warn!(pool = %decision.pool_id, "planned pool vanished");
            return Ok(false);
        };

        match timeout(
            provider_timeout,
            pool.delete_nodes(vec![decision.node_id.clone()]),
        )
        .await
        {
            Ok(Ok(())) => {
                self.registry.record_scale_down_result(
                    &decision.pool_id,
                    &decision.node_id,
                    Outcome::Success,
                    now,
                )?;
                info!(node = %decision.node_id, pool = %decision.pool_id, "scale-down issued");
                events.push(StatusEvent::ScaleDownIssued {
                    node_id: decision.node_id.clone(),
                    pool_id: decision.pool_id.clone(),
                });
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!(node = %decision.node_id, error = %e, "scale-down failed");
                self.registry.record_scale_down_result(
                    &decision.pool_id,
                    &decision.node_id,
                    Outcome::Failure,
                    now,
                )?;
                events.push(StatusEvent::ScaleDownFailed {
                    node_id: decision.node_id.clone(),
                    pool_id: decision.pool_id.clone(),
                });
                Ok(false)
            }
            Err(_) => {
                warn!(node = %decision.node_id, "scale-down timed out");
                self.registry.record_scale_down_result(
                    &decision.pool_id,
                    &decision.node_id,
                    Outcome::Failure,
                    now,
                )?;
                events.push(StatusEvent::ScaleDownFailed {
                    node_id: decision.node_id.clone(),
                    pool_id: decision.pool_id.clone(),
                });
                Ok(false)
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use gridscale_model::{
        NodeTemplate, Pod, PodOwner, Resources, Taint,
    };
    use gridscale_registry::PoolPhase;
    use gridscale_scaledown::ScaleDownConfig;

    struct TestPool {
        id: String,
        target: Mutex<u32>,
        min: u32,
        max: u32,
        fail_resize: bool,
        fail_delete: bool,
        deleted: Mutex<Vec<String>>,
    }

    impl TestPool {
        fn new(id: &str, target: u32) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                target: Mutex::new(target),
                min: 0,
                max: 10,
                fail_resize: false,
                fail_delete: false,
                deleted: Mutex::new(Vec::new()),
            })
        }

        fn failing(id: &str, target: u32) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                target: Mutex::new(target),
                min: 0,
                max: 10,
                fail_resize: true,
                fail_delete: false,
                deleted: Mutex::new(Vec::new()),
            })
        }

        fn failing_delete(id: &str, target: u32) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                target: Mutex::new(target),
                min: 0,
                max: 10,
                fail_resize: false,
                fail_delete: true,
                deleted: Mutex::new(Vec::new()),
            })
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    impl NodePool for TestPool {
        fn id(&self) -> &str {
            &self.id
        }
        fn target_size(&self) -> u32 {
            *self.target.lock().unwrap()
        }
        fn min_size(&self) -> u32 {
            self.min
        }
        fn max_size(&self) -> u32 {
            self.max
        }
        fn template(&self) -> NodeTemplate {
            NodeTemplate {
                capacity: Resources::new(4000, 8 << 30),
                labels: BTreeMap::new(),
                taints: Vec::<Taint>::new(),
            }
        }
        fn set_target_size(&self, n: u32) -> BoxFuture<'_, anyhow::Result<()>> {
            if self.fail_resize {
                return Box::pin(async { anyhow::bail!("quota exceeded") });
            }
            *self.target.lock().unwrap() = n;
            Box::pin(async { Ok(()) })
        }
        fn delete_nodes(&self, ids: Vec<String>) -> BoxFuture<'_, anyhow::Result<()>> {
            if self.fail_delete {
                return Box::pin(async { anyhow::bail!("instance group busy") });
            }
            self.deleted.lock().unwrap().extend(ids);
            Box::pin(async { Ok(()) })
        }
    }

    struct StaticSource {
        snapshot: Mutex<ClusterSnapshot>,
    }

    impl StaticSource {
        fn new(snapshot: ClusterSnapshot) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(snapshot),
            })
        }

        fn set(&self, snapshot: ClusterSnapshot) {
            *self.snapshot.lock().unwrap() = snapshot;
        }
    }

    impl SnapshotSource for StaticSource {
        fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<ClusterSnapshot>> {
            let snap = self.snapshot.lock().unwrap().clone();
            Box::pin(async move { Ok(snap) })
        }
    }

    fn node(id: &str, pool: &str, ready: bool) -> Node {
        Node {
            id: id.to_string(),
            pool_id: Some(pool.to_string()),
            capacity: Resources::new(4000, 8 << 30),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            ready,
            created_at: 0,
        }
    }

    fn pod(id: &str, node: Option<&str>, cpu: i64, mem: i64) -> Pod {
        Pod {
            id: id.to_string(),
            namespace: "default".to_string(),
            node_id: node.map(str::to_string),
            requests: Resources::new(cpu, mem),
            node_selector: BTreeMap::new(),
            affinity: None,
            tolerations: Vec::new(),
            owner: PodOwner::Controller {
                kind: "ReplicaSet".to_string(),
                name: "web".to_string(),
            },
            labels: BTreeMap::new(),
            safe_to_evict: None,
        }
    }

    fn engine_with(source: Arc<StaticSource>, pools: Vec<Arc<TestPool>>) -> Engine {
        let pools = pools
            .into_iter()
            .map(|p| p as Arc<dyn NodePool>)
            .collect();
        Engine::new(EngineConfig::default(), source, pools)
    }

    #[tokio::test]
    async fn pending_pod_triggers_scale_up() {
        // n1 is full; the pending pod needs a new node.
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![
                pod("p1", Some("n1"), 3800, 7 << 30),
                pod("p2", None, 1000, 1 << 30),
            ],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 1);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert_eq!(outcome.scale_ups.len(), 1);
        assert_eq!(outcome.scale_ups[0].pool_id, "pool-a");
        assert_eq!(outcome.scale_ups[0].delta, 1);
        assert_eq!(pool.target_size(), 2);
        assert!(outcome.unschedulable.is_empty());
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StatusEvent::ScaleUpIssued { .. })));
    }

    #[tokio::test]
    async fn pod_fitting_existing_capacity_causes_no_scale_up() {
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![pod("p1", None, 1000, 1 << 30)],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 1);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert!(outcome.scale_ups.is_empty());
        assert_eq!(pool.target_size(), 1);
    }

    #[tokio::test]
    async fn provider_failure_backs_pool_off_and_blocks_retry() {
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![
                pod("p1", Some("n1"), 3800, 7 << 30),
                pod("p2", None, 1000, 1 << 30),
            ],
            vec![],
        ));
        let pool = TestPool::failing("pool-a", 1);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert!(outcome.scale_ups.is_empty());
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StatusEvent::ScaleUpFailed { .. })));
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StatusEvent::PoolBackoff { .. })));
        assert!(engine.registry().is_in_backoff("pool-a", 1001));

        // Next tick: pool is backing off, nothing is attempted.
        let outcome = engine.tick(1010).await.unwrap();
        assert!(outcome.scale_ups.is_empty());
        assert!(outcome
            .events
            .iter()
            .all(|e| !matches!(e, StatusEvent::ScaleUpFailed { .. })));
    }

    #[tokio::test]
    async fn sustained_underutilization_drains_a_node() {
        // Three half-empty nodes; n1's pods fit elsewhere.
        let snapshot = ClusterSnapshot::new(
            vec![
                node("n1", "pool-a", true),
                node("n2", "pool-a", true),
                node("n3", "pool-a", true),
            ],
            vec![
                pod("p1", Some("n1"), 200, 1 << 28),
                pod("p2", Some("n1"), 200, 1 << 28),
                pod("q1", Some("n2"), 500, 1 << 30),
                pod("q2", Some("n3"), 500, 1 << 30),
            ],
            vec![],
        );
        let source = StaticSource::new(snapshot.clone());
        let pool = TestPool::new("pool-a", 3);
        let mut engine = engine_with(source.clone(), vec![pool.clone()]);

        // First tick starts the unneeded window; no decision yet.
        let outcome = engine.tick(1000).await.unwrap();
        assert!(outcome.scale_downs.is_empty());

        // Second tick, past the window: n1 is drained. The provider
        // acknowledged, but the node is still in the snapshot, so the
        // drain stays in flight and the target holds.
        let outcome = engine.tick(1000 + 700).await.unwrap();
        assert_eq!(outcome.scale_downs.len(), 1);
        assert_eq!(outcome.scale_downs[0].node_id, "n1");
        assert_eq!(outcome.scale_downs[0].reason, ScaleDownReason::Underutilized);
        assert_eq!(pool.deleted(), vec!["n1".to_string()]);
        assert!(engine.registry().is_draining("n1"));
        assert_eq!(engine.registry().pool("pool-a").unwrap().target, 3);

        // Slow cloud deletion: n1 lingers a tick. It must not be deleted
        // again, and the drain cap keeps its pool from over-draining.
        let outcome = engine.tick(1000 + 705).await.unwrap();
        assert!(outcome.scale_downs.is_empty());
        assert_eq!(pool.deleted(), vec!["n1".to_string()]);

        // n1 finally gone: the target is reconciled down.
        source.set(ClusterSnapshot::new(
            vec![node("n2", "pool-a", true), node("n3", "pool-a", true)],
            vec![
                pod("q1", Some("n2"), 500, 1 << 30),
                pod("q2", Some("n3"), 500, 1 << 30),
            ],
            vec![],
        ));
        engine.tick(1000 + 710).await.unwrap();
        assert!(!engine.registry().is_draining("n1"));
        assert_eq!(engine.registry().pool("pool-a").unwrap().target, 2);
    }

    #[tokio::test]
    async fn unregistered_node_is_force_removed() {
        // n2 joined the API but never went Ready; well past the grace
        // period by now=2000 with created_at=0... grace is 900.
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true), node("n2", "pool-a", false)],
            vec![pod("p1", Some("n1"), 500, 1 << 30)],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 2);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(2000).await.unwrap();

        assert_eq!(pool.deleted(), vec!["n2".to_string()]);
        assert_eq!(outcome.scale_downs.len(), 1);
        assert_eq!(outcome.scale_downs[0].node_id, "n2");
        assert_eq!(outcome.scale_downs[0].reason, ScaleDownReason::Unregistered);
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StatusEvent::NodeUnregistered { .. })));

        // The deletion is in flight; a tick where n2 still lingers must
        // not issue it again.
        let outcome = engine.tick(2010).await.unwrap();
        assert_eq!(pool.deleted(), vec!["n2".to_string()]);
        assert!(outcome.scale_downs.is_empty());
    }

    #[tokio::test]
    async fn failed_unregistered_removal_backs_pool_off() {
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true), node("n2", "pool-a", false)],
            vec![pod("p1", Some("n1"), 500, 1 << 30)],
            vec![],
        ));
        let pool = TestPool::failing_delete("pool-a", 2);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(2000).await.unwrap();

        assert!(pool.deleted().is_empty());
        assert!(outcome.scale_downs.is_empty());
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StatusEvent::ScaleDownFailed { .. })));
        assert!(engine.registry().is_in_backoff("pool-a", 2001));
        // The node stays eligible for forced removal next time.
        assert!(!engine.registry().is_draining("n2"));
    }

    #[tokio::test]
    async fn negative_requests_exclude_pod_from_planning() {
        let mut bad = pod("p-bad", None, 100, 1 << 30);
        bad.requests.cpu_millis = -100;
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![bad],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 1);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert!(outcome.scale_ups.is_empty());
        assert!(outcome.unschedulable.is_empty());
        assert!(outcome.events.contains(&StatusEvent::InvalidResources {
            kind: EntityKind::Pod,
            id: "p-bad".to_string(),
        }));
    }

    #[tokio::test]
    async fn node_with_unknown_pool_is_excluded_from_planning() {
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-ghost", true)],
            vec![pod("p1", None, 1000, 1 << 30)],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 0);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert!(outcome.events.contains(&StatusEvent::UnknownPool {
            node_id: "n1".to_string(),
            pool_id: "pool-ghost".to_string(),
        }));
        // The ghost node is no placement target: the pending pod still
        // needs a real node from a served pool.
        assert_eq!(outcome.scale_ups.len(), 1);
        assert_eq!(outcome.scale_ups[0].pool_id, "pool-a");
        assert_eq!(outcome.scale_ups[0].delta, 1);
        assert_eq!(pool.target_size(), 1);
    }

    #[tokio::test]
    async fn unschedulable_pod_is_reported_not_retried_as_scale_up() {
        // Pod larger than any pool template.
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![
                pod("p1", Some("n1"), 3800, 7 << 30),
                pod("p-huge", None, 50_000, 512 << 30),
            ],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 1);
        let mut engine = engine_with(source, vec![pool.clone()]);

        let outcome = engine.tick(1000).await.unwrap();

        assert_eq!(outcome.unschedulable, vec!["p-huge".to_string()]);
        assert!(outcome.scale_ups.is_empty());
        assert_eq!(pool.target_size(), 1);
    }

    #[tokio::test]
    async fn scale_up_capacity_feeds_scale_down_in_same_tick() {
        // One pool needs to grow while another pool's idle node can only
        // empty onto the incoming capacity. The pending pod is too big for
        // the idle node's remaining space, so it cannot absorb it either.
        let snapshot = ClusterSnapshot::new(
            vec![node("busy", "pool-a", true), node("idle", "pool-b", true)],
            vec![
                pod("p1", Some("busy"), 3800, 7 << 30),
                pod("p2", None, 3900, 1 << 30),
                pod("q1", Some("idle"), 500, 1 << 30),
            ],
            vec![],
        );
        let source = StaticSource::new(snapshot);
        let pool_a = TestPool::new("pool-a", 1);
        let pool_b = TestPool::new("pool-b", 1);
        let config = EngineConfig {
            scale_down: ScaleDownConfig {
                unneeded_window_secs: 0,
                ..ScaleDownConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(
            config,
            source,
            vec![
                pool_a.clone() as Arc<dyn NodePool>,
                pool_b.clone() as Arc<dyn NodePool>,
            ],
        );

        let outcome = engine.tick(1000).await.unwrap();

        assert_eq!(outcome.scale_ups.len(), 1);
        assert_eq!(outcome.scale_ups[0].pool_id, "pool-a");
        assert_eq!(outcome.scale_downs.len(), 1);
        assert_eq!(outcome.scale_downs[0].node_id, "idle");
        assert_eq!(pool_b.deleted(), vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn hypothetically_placed_pod_reserves_its_node() {
        // p2 fits existing capacity, so no scale-up happens — but the
        // capacity it claims on busy is then spoken for. Without that
        // claim q1 would look re-placeable onto busy and idle would be
        // drained out from under p2.
        let snapshot = ClusterSnapshot::new(
            vec![node("busy", "pool-a", true), node("idle", "pool-a", true)],
            vec![
                pod("b1", Some("busy"), 3000, 4 << 30),
                pod("p2", None, 1000, 1 << 30),
                pod("q1", Some("idle"), 500, 1 << 30),
            ],
            vec![],
        );
        let source = StaticSource::new(snapshot);
        let pool = TestPool::new("pool-a", 2);
        let config = EngineConfig {
            scale_down: ScaleDownConfig {
                unneeded_window_secs: 0,
                ..ScaleDownConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, source, vec![pool.clone() as Arc<dyn NodePool>]);

        let outcome = engine.tick(1000).await.unwrap();

        assert!(outcome.scale_ups.is_empty());
        assert!(outcome.scale_downs.is_empty());
        assert!(pool.deleted().is_empty());
        assert!(outcome.events.iter().any(
            |e| matches!(e, StatusEvent::ScaleDownSkipped { node_id, .. } if node_id == "idle")
        ));
    }

    #[tokio::test]
    async fn snapshot_source_failure_aborts_tick() {
        struct BrokenSource;
        impl SnapshotSource for BrokenSource {
            fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<ClusterSnapshot>> {
                Box::pin(async { anyhow::bail!("api unavailable") })
            }
        }

        let pool = TestPool::new("pool-a", 1);
        let mut engine = Engine::new(
            EngineConfig::default(),
            Arc::new(BrokenSource),
            vec![pool.clone() as Arc<dyn NodePool>],
        );

        let err = engine.tick(1000).await.unwrap_err();
        assert!(matches!(err, EngineError::Snapshot(_)));
        assert_eq!(pool.target_size(), 1);
    }

    #[tokio::test]
    async fn registry_reaches_stable_after_new_node_registers() {
        let source = StaticSource::new(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true)],
            vec![
                pod("p1", Some("n1"), 3800, 7 << 30),
                pod("p2", None, 1000, 1 << 30),
            ],
            vec![],
        ));
        let pool = TestPool::new("pool-a", 1);
        let mut engine = engine_with(source.clone(), vec![pool.clone()]);

        engine.tick(1000).await.unwrap();
        assert_eq!(
            engine.registry().pool("pool-a").unwrap().phase,
            PoolPhase::ScalingUp
        );

        // The new node shows up Ready; the pool settles.
        source.set(ClusterSnapshot::new(
            vec![node("n1", "pool-a", true), node("n2", "pool-a", true)],
            vec![
                pod("p1", Some("n1"), 3800, 7 << 30),
                pod("p2", Some("n2"), 1000, 1 << 30),
            ],
            vec![],
        ));
        engine.tick(1010).await.unwrap();
        assert_eq!(
            engine.registry().pool("pool-a").unwrap().phase,
            PoolPhase::Stable
        );
    }
}
