//! Task tracking collaborators
//!
//! The governance loop only sees tasks through [`TaskSource`] and only
//! cancels them through [`TaskCanceller`]. [`TaskTracker`] implements both
//! for tasks executed in-process: the execution subsystem reports lifecycle
//! events and usage readings, and polls its [`TaskHandle`] for cooperative
//! cancellation.

use crate::models::{ResourceUsage, TaskId, TaskUsageSample};
use crate::stats::StatsAggregator;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Enumerates tracked tasks and their latest resource readings
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// All tracked tasks with their current usage
    async fn tracked_tasks(&self) -> Result<Vec<TaskUsageSample>>;

    /// Number of unfinished tasks that reference the group
    async fn task_count(&self, group_id: &str) -> Result<usize>;
}

/// Best-effort, idempotent cancellation primitive
pub trait TaskCanceller: Send + Sync {
    /// Signal cancellation. Returns false when the task is unknown, already
    /// finished, or was already cancelled.
    fn cancel(&self, task_id: TaskId, reason: &str) -> bool;
}

/// How a tracked task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct TrackedTask {
    group_id: String,
    started_at: Instant,
    usage: ResourceUsage,
    cancelled: Arc<AtomicBool>,
}

/// Handle given to the task-execution subsystem for a started task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    group_id: String,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Whether the governor asked this task to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Concurrent registry of in-flight tasks grouped by resource group
pub struct TaskTracker {
    /// task_id -> task state
    tasks: DashMap<TaskId, TrackedTask>,
    /// group_id -> ids of its unfinished tasks
    by_group: DashMap<String, HashSet<TaskId>>,
    stats: Arc<StatsAggregator>,
}

impl TaskTracker {
    pub fn new(stats: Arc<StatsAggregator>) -> Self {
        Self {
            tasks: DashMap::new(),
            by_group: DashMap::new(),
            stats,
        }
    }

    /// Start tracking a task that begins now
    pub fn on_task_started(&self, task_id: TaskId, group_id: impl Into<String>) -> TaskHandle {
        self.on_task_started_at(task_id, group_id, Instant::now())
    }

    /// Start tracking a task with an explicit start time
    pub fn on_task_started_at(
        &self,
        task_id: TaskId,
        group_id: impl Into<String>,
        started_at: Instant,
    ) -> TaskHandle {
        let group_id = group_id.into();
        let cancelled = Arc::new(AtomicBool::new(false));

        match self.tasks.entry(task_id) {
            Entry::Occupied(existing) => {
                debug!(task_id, group_id = %existing.get().group_id, "Task already tracked");
                return TaskHandle {
                    task_id,
                    group_id: existing.get().group_id.clone(),
                    cancelled: existing.get().cancelled.clone(),
                };
            }
            Entry::Vacant(slot) => {
                // A concurrent finish blocks on this entry until the group
                // index and counters reflect the task
                self.by_group
                    .entry(group_id.clone())
                    .or_default()
                    .insert(task_id);
                self.stats.on_task_started(&group_id);
                slot.insert(TrackedTask {
                    group_id: group_id.clone(),
                    started_at,
                    usage: ResourceUsage::default(),
                    cancelled: cancelled.clone(),
                });
            }
        }

        debug!(task_id, group_id = %group_id, "Tracking task");
        TaskHandle {
            task_id,
            group_id,
            cancelled,
        }
    }

    /// Replace the latest usage reading of a task
    pub fn record_usage(&self, task_id: TaskId, usage: ResourceUsage) -> bool {
        match self.tasks.get_mut(&task_id) {
            Some(mut task) => {
                task.usage = usage;
                true
            }
            None => false,
        }
    }

    pub fn on_task_completed(&self, task_id: TaskId) {
        self.finish(task_id, TaskOutcome::Completed);
    }

    pub fn on_task_failed(&self, task_id: TaskId) {
        self.finish(task_id, TaskOutcome::Failed);
    }

    /// The task stopped because it was cancelled, by the governor or anyone else
    pub fn on_task_cancelled(&self, task_id: TaskId) {
        self.finish(task_id, TaskOutcome::Cancelled);
    }

    fn finish(&self, task_id: TaskId, outcome: TaskOutcome) {
        let Some((_, task)) = self.tasks.remove(&task_id) else {
            return;
        };

        if let Some(mut ids) = self.by_group.get_mut(&task.group_id) {
            ids.remove(&task_id);
        }
        self.by_group.remove_if(&task.group_id, |_, ids| ids.is_empty());

        let cancelled_by_governor = task.cancelled.load(Ordering::SeqCst);
        match (outcome, cancelled_by_governor) {
            (TaskOutcome::Failed, _) => self.stats.on_task_failed(&task.group_id),
            (_, true) => self.stats.on_task_exited(&task.group_id),
            (TaskOutcome::Completed, false) => self.stats.on_task_completed(&task.group_id),
            (TaskOutcome::Cancelled, false) => {
                self.stats.on_task_cancelled(&task.group_id);
                self.stats.on_task_exited(&task.group_id);
            }
        }

        debug!(task_id, group_id = %task.group_id, outcome = ?outcome, "Task finished");
    }

    pub fn is_cancelled(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .map(|t| t.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Group the task belongs to, while it is tracked
    pub fn group_of(&self, task_id: TaskId) -> Option<String> {
        self.tasks.get(&task_id).map(|t| t.group_id.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn count_for(&self, group_id: &str) -> usize {
        self.by_group.get(group_id).map(|ids| ids.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TaskSource for TaskTracker {
    async fn tracked_tasks(&self) -> Result<Vec<TaskUsageSample>> {
        Ok(self
            .tasks
            .iter()
            .map(|entry| TaskUsageSample {
                task_id: *entry.key(),
                group_id: entry.group_id.clone(),
                started_at: entry.started_at,
                usage: entry.usage,
            })
            .collect())
    }

    async fn task_count(&self, group_id: &str) -> Result<usize> {
        Ok(self.count_for(group_id))
    }
}

impl TaskCanceller for TaskTracker {
    fn cancel(&self, task_id: TaskId, reason: &str) -> bool {
        let Some(task) = self.tasks.get(&task_id) else {
            debug!(task_id, "Cancellation target already finished");
            return false;
        };

        if task.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }

        debug!(task_id, group_id = %task.group_id, reason = %reason, "Cancellation signalled");
        true
    }
}
