//! Node duress hysteresis and group violation checks
//!
//! A node is only reported in duress for a resource after its usage has
//! exceeded the configured threshold on `duress_streak` consecutive
//! evaluations. Group violations are not gated: any positive excess over a
//! group's own limit is reported as soon as it is observed.

use crate::config::ConfigHandle;
use crate::models::{ResourceGroup, ResourceKind, ResourceVector};
use crate::sampler::GroupUsageSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts consecutive breaching observations
#[derive(Debug, Default)]
pub struct StreakBreachTracker {
    streak: AtomicUsize,
}

impl StreakBreachTracker {
    /// Record one observation; returns true once `required` consecutive
    /// breaches have been seen
    pub fn record(&self, breached: bool, required: usize) -> bool {
        if breached {
            let streak = self.streak.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            streak >= required.max(1)
        } else {
            self.streak.store(0, Ordering::SeqCst);
            false
        }
    }

    pub fn streak(&self) -> usize {
        self.streak.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.streak.store(0, Ordering::SeqCst);
    }
}

/// Per-resource node duress verdict of one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeDuress {
    pub cpu: bool,
    pub memory: bool,
}

impl NodeDuress {
    pub fn in_duress(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    pub fn any(&self) -> bool {
        self.cpu || self.memory
    }

    fn set(&mut self, kind: ResourceKind, value: bool) {
        match kind {
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Memory => self.memory = value,
        }
    }
}

pub struct DuressDetector {
    config: ConfigHandle,
    cpu: StreakBreachTracker,
    memory: StreakBreachTracker,
}

impl DuressDetector {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            cpu: StreakBreachTracker::default(),
            memory: StreakBreachTracker::default(),
        }
    }

    fn tracker(&self, kind: ResourceKind) -> &StreakBreachTracker {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
        }
    }

    /// Feed one node-wide usage observation and return the duress verdict
    pub fn evaluate(&self, node_usage: &ResourceVector) -> NodeDuress {
        let config = self.config.current();
        let mut duress = NodeDuress::default();
        for kind in ResourceKind::ALL {
            let breached = node_usage.get(kind) > config.node_duress_threshold(kind);
            duress.set(kind, self.tracker(kind).record(breached, config.duress_streak));
        }
        duress
    }

    /// Verdict implied by the current streaks, without recording anything
    pub fn node_in_duress(&self) -> NodeDuress {
        let required = self.config.current().duress_streak.max(1);
        let mut duress = NodeDuress::default();
        for kind in ResourceKind::ALL {
            duress.set(kind, self.tracker(kind).streak() >= required);
        }
        duress
    }

    pub fn reset(&self) {
        self.cpu.reset();
        self.memory.reset();
    }

    /// Excess usage over each configured limit of `group`; only positive
    /// excesses are reported
    pub fn group_in_violation(
        &self,
        group: &ResourceGroup,
        snapshot: &GroupUsageSnapshot,
    ) -> BTreeMap<ResourceKind, f64> {
        group
            .resource_limits
            .iter()
            .filter_map(|(kind, limit)| {
                let excess = snapshot.usage(&group.id, *kind) - limit;
                (excess > 0.0).then_some((*kind, excess))
            })
            .collect()
    }
}
