//! Engine configuration, aggregating the per-component knobs.

use serde::{Deserialize, Serialize};

use gridscale_registry::RegistryConfig;
use gridscale_scaledown::ScaleDownConfig;
use gridscale_scaleup::ScaleUpConfig;

/// Top-level configuration. Deserializes from JSON with every field
/// optional; absent fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between control loop ticks.
    pub tick_interval_secs: u64,
    /// Soft deadline for one tick; the scale-down pass defers remaining
    /// candidates once it is hit.
    pub tick_deadline_secs: u64,
    /// Wall-clock budget for the concurrent binpacking fan-out.
    pub binpack_budget_ms: u64,
    /// Timeout on each provider call (`set_target_size`, `delete_nodes`).
    pub provider_timeout_secs: u64,
    pub registry: RegistryConfig,
    pub scale_up: ScaleUpConfig,
    pub scale_down: ScaleDownConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            tick_deadline_secs: 30,
            binpack_budget_ms: 2_000,
            provider_timeout_secs: 30,
            registry: RegistryConfig::default(),
            scale_up: ScaleUpConfig::default(),
            scale_down: ScaleDownConfig::default(),
        }
    }
}
