//! Per-group task counters for external reporting
//!
//! Counters are updated from task lifecycle callbacks, which may fire from
//! any thread while the scheduler is running. Each group owns its own set of
//! atomics, so updates for different groups never contend.

use crate::models::ResourceVector;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct GroupCounters {
    completed: AtomicU64,
    cancelled: AtomicU64,
    running: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    last_usage: RwLock<ResourceVector>,
}

impl GroupCounters {
    fn decrement_running(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    fn snapshot(&self) -> GroupStats {
        let last_usage = match self.last_usage.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        GroupStats {
            completed: self.completed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            last_usage,
        }
    }
}

/// Point-in-time view of one group's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub completed: u64,
    /// Cancellations issued against the group's tasks
    pub cancelled: u64,
    pub running: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Usage fractions observed on the most recent tick
    pub last_usage: ResourceVector,
}

/// Aggregates task counters and last observed usage per group
#[derive(Debug, Default)]
pub struct StatsAggregator {
    groups: DashMap<String, Arc<GroupCounters>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, group_id: &str) -> Arc<GroupCounters> {
        if let Some(existing) = self.groups.get(group_id) {
            return existing.clone();
        }
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .clone()
    }

    /// A task began running in the group
    pub fn on_task_started(&self, group_id: &str) {
        self.counters(group_id).running.fetch_add(1, Ordering::SeqCst);
    }

    /// A task ran to completion
    pub fn on_task_completed(&self, group_id: &str) {
        let counters = self.counters(group_id);
        counters.decrement_running();
        counters.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// A task terminated with an error
    pub fn on_task_failed(&self, group_id: &str) {
        let counters = self.counters(group_id);
        counters.decrement_running();
        counters.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// A cancellation was issued against one of the group's tasks.
    ///
    /// The task keeps counting as running until [`Self::on_task_exited`].
    pub fn on_task_cancelled(&self, group_id: &str) {
        self.counters(group_id)
            .cancelled
            .fetch_add(1, Ordering::SeqCst);
    }

    /// A previously cancelled task finally stopped
    pub fn on_task_exited(&self, group_id: &str) {
        self.counters(group_id).decrement_running();
    }

    /// A new task was refused admission into the group
    pub fn on_task_rejected(&self, group_id: &str) {
        self.counters(group_id).rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// Remember the usage observed for the group on the latest tick
    pub fn record_usage(&self, group_id: &str, usage: ResourceVector) {
        let counters = self.counters(group_id);
        let mut guard = match counters.last_usage.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = usage;
    }

    /// Stats for a single group, if anything was ever recorded for it
    pub fn group(&self, group_id: &str) -> Option<GroupStats> {
        self.groups.get(group_id).map(|c| c.snapshot())
    }

    /// Immutable snapshot of every group's counters
    pub fn snapshot(&self) -> BTreeMap<String, GroupStats> {
        self.groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Drop counters of a group that no longer exists
    pub fn remove_group(&self, group_id: &str) {
        self.groups.remove(group_id);
    }

    /// Drop idle counters of groups `is_known` does not recognise; returns
    /// the removed ids. Entries with running tasks are kept until they drain.
    pub fn retain_known(&self, is_known: impl Fn(&str) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.groups.retain(|group_id, counters| {
            let keep = is_known(group_id) || counters.running.load(Ordering::SeqCst) > 0;
            if !keep {
                removed.push(group_id.clone());
            }
            keep
        });
        removed
    }
}
