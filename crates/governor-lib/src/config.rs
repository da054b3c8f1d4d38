//! Governance configuration
//!
//! Settings are held as an immutable snapshot. Changes are applied through
//! [`ConfigHandle::reconfigure`], which validates the new snapshot and swaps
//! it in atomically; readers always observe a complete snapshot.

use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{NodeCapacity, ResourceKind, ResourceVector};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Upper bound for the configurable group count
pub const MAX_GROUPS_CEILING: usize = 100;

/// Default enforcement interval (1 second)
pub const DEFAULT_ENFORCEMENT_INTERVAL_MS: u64 = 1000;

/// Default number of consecutive breaches before the node is in duress
pub const DEFAULT_DURESS_STREAK: usize = 3;

/// Default node duress threshold for every resource
pub const DEFAULT_NODE_DURESS_THRESHOLD: f64 = 0.9;

/// Which cancellation policy the canceller uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    LongestRunningFirst,
    MostResourceIntensiveFirst,
}

/// Immutable governance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Maximum number of resource groups (1..=100)
    pub max_groups: usize,
    /// Fixed delay between enforcement ticks, in milliseconds
    pub enforcement_interval_ms: u64,
    /// Consecutive breaching evaluations required to report node duress
    pub duress_streak: usize,
    /// Node-wide usage fractions above which a resource is breaching
    pub node_duress_thresholds: ResourceVector,
    pub node_capacity: NodeCapacity,
    pub cancellation_policy: PolicyKind,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            max_groups: MAX_GROUPS_CEILING,
            enforcement_interval_ms: DEFAULT_ENFORCEMENT_INTERVAL_MS,
            duress_streak: DEFAULT_DURESS_STREAK,
            node_duress_thresholds: ResourceVector {
                cpu: DEFAULT_NODE_DURESS_THRESHOLD,
                memory: DEFAULT_NODE_DURESS_THRESHOLD,
            },
            node_capacity: NodeCapacity::default(),
            cancellation_policy: PolicyKind::default(),
        }
    }
}

impl GovernanceConfig {
    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_millis(self.enforcement_interval_ms)
    }

    pub fn node_duress_threshold(&self, kind: ResourceKind) -> f64 {
        self.node_duress_thresholds.get(kind)
    }

    pub fn validate(&self) -> GovernanceResult<()> {
        if !(1..=MAX_GROUPS_CEILING).contains(&self.max_groups) {
            return Err(GovernanceError::InvalidConfig(format!(
                "max_groups must be between 1 and {}, got {}",
                MAX_GROUPS_CEILING, self.max_groups
            )));
        }
        if self.enforcement_interval_ms == 0 {
            return Err(GovernanceError::InvalidConfig(
                "enforcement_interval_ms must be positive".to_string(),
            ));
        }
        if self.duress_streak == 0 {
            return Err(GovernanceError::InvalidConfig(
                "duress_streak must be at least 1".to_string(),
            ));
        }
        for kind in ResourceKind::ALL {
            let threshold = self.node_duress_threshold(kind);
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(GovernanceError::InvalidConfig(format!(
                    "node {} duress threshold must be in (0, 1], got {}",
                    kind, threshold
                )));
            }
        }
        if self.node_capacity.num_cores == 0 || self.node_capacity.total_memory_bytes == 0 {
            return Err(GovernanceError::InvalidConfig(
                "node capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared handle to the current configuration snapshot
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<GovernanceConfig>>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(GovernanceConfig::default()))),
        }
    }
}

impl ConfigHandle {
    /// Create a handle from a validated configuration
    pub fn new(config: GovernanceConfig) -> GovernanceResult<Self> {
        config.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Latest committed snapshot
    pub fn current(&self) -> Arc<GovernanceConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and swap in a new snapshot
    pub fn reconfigure(&self, config: GovernanceConfig) -> GovernanceResult<()> {
        config.validate()?;
        info!(
            max_groups = config.max_groups,
            interval_ms = config.enforcement_interval_ms,
            duress_streak = config.duress_streak,
            policy = ?config.cancellation_policy,
            "Applying governance configuration"
        );
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(config);
        Ok(())
    }
}
