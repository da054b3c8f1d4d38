//! Cancel-set selection strategies
//!
//! Every policy shares the same accumulate-until-satisfied walk and only
//! differs in the order candidates are visited.

mod canceller;

pub use canceller::{CancellationReport, CancelledTask, Canceller};

use crate::config::PolicyKind;
use crate::models::ResourceKind;
use crate::sampler::TaskFootprint;
use std::cmp::Ordering;
use std::sync::Arc;

/// Slack allowed when comparing accumulated usage against the deficit
const EPSILON: f64 = 1e-9;

pub trait CancellationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Order in which candidates are considered for cancellation
    fn compare(&self, a: &TaskFootprint, b: &TaskFootprint, kind: ResourceKind) -> Ordering;

    /// Smallest prefix of the ordered candidates whose combined usage of
    /// `kind` reaches `reduce_by`. Tasks using none of `kind` are never
    /// selected. Returns every useful candidate when the total falls short.
    fn select_tasks_to_cancel<'a>(
        &self,
        candidates: &'a [TaskFootprint],
        reduce_by: f64,
        kind: ResourceKind,
    ) -> Vec<&'a TaskFootprint> {
        if reduce_by <= 0.0 {
            return Vec::new();
        }

        let mut ordered: Vec<&TaskFootprint> = candidates
            .iter()
            .filter(|t| t.usage.get(kind) > 0.0)
            .collect();
        ordered.sort_by(|a, b| self.compare(a, b, kind));

        let mut selected = Vec::new();
        let mut reclaimed = 0.0;
        for task in ordered {
            if reclaimed + EPSILON >= reduce_by {
                break;
            }
            reclaimed += task.usage.get(kind);
            selected.push(task);
        }
        selected
    }
}

/// Oldest tasks first
#[derive(Debug, Default, Clone, Copy)]
pub struct LongestRunningFirst;

impl CancellationPolicy for LongestRunningFirst {
    fn name(&self) -> &'static str {
        "longest_running_first"
    }

    fn compare(&self, a: &TaskFootprint, b: &TaskFootprint, _kind: ResourceKind) -> Ordering {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    }
}

/// Heaviest consumers of the breached resource first
#[derive(Debug, Default, Clone, Copy)]
pub struct MostResourceIntensiveFirst;

impl CancellationPolicy for MostResourceIntensiveFirst {
    fn name(&self) -> &'static str {
        "most_resource_intensive_first"
    }

    fn compare(&self, a: &TaskFootprint, b: &TaskFootprint, kind: ResourceKind) -> Ordering {
        b.usage
            .get(kind)
            .total_cmp(&a.usage.get(kind))
            .then_with(|| a.task_id.cmp(&b.task_id))
    }
}

pub fn policy_for(kind: PolicyKind) -> Arc<dyn CancellationPolicy> {
    match kind {
        PolicyKind::LongestRunningFirst => Arc::new(LongestRunningFirst),
        PolicyKind::MostResourceIntensiveFirst => Arc::new(MostResourceIntensiveFirst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceVector;
    use std::time::{Duration, Instant};

    fn task(task_id: u64, age_secs: u64, memory: f64) -> TaskFootprint {
        TaskFootprint {
            task_id,
            group_id: "g".into(),
            started_at: Instant::now() - Duration::from_secs(age_secs),
            usage: ResourceVector { cpu: 0.0, memory },
        }
    }

    fn ids(selected: &[&TaskFootprint]) -> Vec<u64> {
        selected.iter().map(|t| t.task_id).collect()
    }

    #[test]
    fn test_longest_running_first_picks_oldest() {
        let tasks = vec![task(1, 10, 0.2), task(2, 100, 0.1), task(3, 50, 0.3)];

        let selected = LongestRunningFirst.select_tasks_to_cancel(&tasks, 0.3, ResourceKind::Memory);
        assert_eq!(ids(&selected), vec![2, 3]);
    }

    #[test]
    fn test_most_intensive_first_picks_heaviest() {
        let tasks = vec![task(1, 10, 0.2), task(2, 100, 0.1), task(3, 50, 0.3)];

        let selected =
            MostResourceIntensiveFirst.select_tasks_to_cancel(&tasks, 0.3, ResourceKind::Memory);
        assert_eq!(ids(&selected), vec![3]);
    }

    #[test]
    fn test_stops_once_deficit_met_exactly() {
        let tasks = vec![task(1, 30, 0.4), task(2, 20, 0.4)];
        let selected = LongestRunningFirst.select_tasks_to_cancel(&tasks, 0.3, ResourceKind::Memory);
        assert_eq!(ids(&selected), vec![1]);

        let selected = LongestRunningFirst.select_tasks_to_cancel(&tasks, 0.4, ResourceKind::Memory);
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_insufficient_candidates_selects_all_useful() {
        let tasks = vec![task(1, 30, 0.1), task(2, 20, 0.0), task(3, 10, 0.1)];
        let selected = LongestRunningFirst.select_tasks_to_cancel(&tasks, 0.5, ResourceKind::Memory);
        assert_eq!(ids(&selected), vec![1, 3]);
    }

    #[test]
    fn test_no_deficit_selects_nothing() {
        let tasks = vec![task(1, 30, 0.4)];
        assert!(LongestRunningFirst
            .select_tasks_to_cancel(&tasks, 0.0, ResourceKind::Memory)
            .is_empty());
        assert!(LongestRunningFirst
            .select_tasks_to_cancel(&[], 0.2, ResourceKind::Memory)
            .is_empty());
    }

    #[test]
    fn test_policy_for() {
        assert_eq!(
            policy_for(PolicyKind::LongestRunningFirst).name(),
            "longest_running_first"
        );
        assert_eq!(
            policy_for(PolicyKind::MostResourceIntensiveFirst).name(),
            "most_resource_intensive_first"
        );
    }
}
