//! Resource quantities with exact integer arithmetic.
//!
//! CPU is tracked in millicores, memory and ephemeral storage in bytes,
//! extended resources (GPUs, FPGAs, ...) as named integer counts. All
//! comparisons are exact — no floating point anywhere in the fit path, so
//! a pod requesting 100m CPU against 100m remaining always fits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A set of resource quantities, used both for node capacity and pod
/// requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: i64,
    /// Memory in bytes.
    pub memory_bytes: i64,
    /// Ephemeral storage in bytes.
    pub ephemeral_storage_bytes: i64,
    /// Extended resources by name (e.g. "nvidia.com/gpu" → 2).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, i64>,
}

/// Validation failure for a resource set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("negative quantity for {resource}: {value}")]
    Negative { resource: String, value: i64 },
}

impl Resources {
    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            ..Default::default()
        }
    }

    /// Reject negative quantities. A negative request or capacity is a hard
    /// configuration error; the owning entity is excluded from planning.
    pub fn validate(&self) -> Result<(), ResourceError> {
        let scalars = [
            ("cpu", self.cpu_millis),
            ("memory", self.memory_bytes),
            ("ephemeral-storage", self.ephemeral_storage_bytes),
        ];
        for (name, value) in scalars {
            if value < 0 {
                return Err(ResourceError::Negative {
                    resource: name.to_string(),
                    value,
                });
            }
        }
        for (name, &value) in &self.extended {
            if value < 0 {
                return Err(ResourceError::Negative {
                    resource: name.clone(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Whether every component of `self` fits within `available`.
    /// Extended resources absent from `available` count as zero.
    pub fn fits_within(&self, available: &Resources) -> bool {
        if self.cpu_millis > available.cpu_millis
            || self.memory_bytes > available.memory_bytes
            || self.ephemeral_storage_bytes > available.ephemeral_storage_bytes
        {
            return false;
        }
        self.extended
            .iter()
            .all(|(name, &qty)| qty <= available.extended.get(name).copied().unwrap_or(0))
    }

    /// Component-wise accumulation.
    pub fn accumulate(&mut self, other: &Resources) {
        self.cpu_millis = self.cpu_millis.saturating_add(other.cpu_millis);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        self.ephemeral_storage_bytes = self
            .ephemeral_storage_bytes
            .saturating_add(other.ephemeral_storage_bytes);
        for (name, &qty) in &other.extended {
            *self.extended.entry(name.clone()).or_insert(0) += qty;
        }
    }

    /// Component-wise subtraction, clamped at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut extended = self.extended.clone();
        for (name, &qty) in &other.extended {
            let entry = extended.entry(name.clone()).or_insert(0);
            *entry = (*entry - qty).max(0);
        }
        Resources {
            cpu_millis: (self.cpu_millis - other.cpu_millis).max(0),
            memory_bytes: (self.memory_bytes - other.memory_bytes).max(0),
            ephemeral_storage_bytes: (self.ephemeral_storage_bytes
                - other.ephemeral_storage_bytes)
                .max(0),
            extended,
        }
    }

    /// Utilization as the max of the CPU and memory requested fractions.
    /// Only used for scale-down eligibility ranking, never for fit.
    pub fn max_fraction_of(&self, capacity: &Resources) -> f64 {
        let frac = |used: i64, cap: i64| {
            if cap > 0 {
                used as f64 / cap as f64
            } else {
                0.0
            }
        };
        frac(self.cpu_millis, capacity.cpu_millis)
            .max(frac(self.memory_bytes, capacity.memory_bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0
            && self.memory_bytes == 0
            && self.ephemeral_storage_bytes == 0
            && self.extended.values().all(|&v| v == 0)
    }
}
