//! Per-group aggregation of raw task resource counters

use crate::models::{NodeCapacity, ResourceKind, ResourceVector, TaskId, TaskUsageSample};
use std::collections::BTreeMap;
use std::time::Instant;

/// Usage fractions of one task at sampling time
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFootprint {
    pub task_id: TaskId,
    pub group_id: String,
    pub started_at: Instant,
    pub usage: ResourceVector,
}

#[derive(Debug, Clone, Default)]
struct GroupUsage {
    total: ResourceVector,
    tasks: Vec<TaskFootprint>,
}

/// Usage of every group that had at least one tracked task, as fractions
/// of node capacity
#[derive(Debug, Clone, Default)]
pub struct GroupUsageSnapshot {
    groups: BTreeMap<String, GroupUsage>,
    node: ResourceVector,
}

impl GroupUsageSnapshot {
    /// Add a task's footprint to its group's totals
    pub fn record(&mut self, footprint: TaskFootprint) {
        self.node.accumulate(&footprint.usage);
        let entry = self.groups.entry(footprint.group_id.clone()).or_default();
        entry.total.accumulate(&footprint.usage);
        entry.tasks.push(footprint);
    }

    /// Summed usage of `kind` across the group's tasks; zero when absent
    pub fn usage(&self, group_id: &str, kind: ResourceKind) -> f64 {
        self.groups
            .get(group_id)
            .map(|g| g.total.get(kind))
            .unwrap_or(0.0)
    }

    pub fn group_usage(&self, group_id: &str) -> Option<ResourceVector> {
        self.groups.get(group_id).map(|g| g.total)
    }

    pub fn tasks_of(&self, group_id: &str) -> &[TaskFootprint] {
        self.groups
            .get(group_id)
            .map(|g| g.tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Usage summed over every tracked task on the node
    pub fn node_usage(&self) -> ResourceVector {
        self.node
    }

    pub fn task_count(&self) -> usize {
        self.groups.values().map(|g| g.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Converts raw counters into fractions of node capacity
#[derive(Debug, Clone)]
pub struct ResourceSampler {
    capacity: NodeCapacity,
}

impl ResourceSampler {
    pub fn new(capacity: NodeCapacity) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> NodeCapacity {
        self.capacity
    }

    /// Build a snapshot from `tasks` as observed at `now`.
    ///
    /// Pure function of its inputs.
    pub fn sample(&self, tasks: &[TaskUsageSample], now: Instant) -> GroupUsageSnapshot {
        let mut snapshot = GroupUsageSnapshot::default();
        for task in tasks {
            let elapsed = now.saturating_duration_since(task.started_at);
            let mut usage = ResourceVector::default();
            for kind in ResourceKind::ALL {
                usage.set(kind, kind.fraction(&task.usage, elapsed, &self.capacity));
            }
            snapshot.record(TaskFootprint {
                task_id: task.task_id,
                group_id: task.group_id.clone(),
                started_at: task.started_at,
                usage,
            });
        }
        snapshot
    }
}
