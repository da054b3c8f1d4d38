//! Per-tick cancellation pass over groups in violation

use super::{policy_for, CancellationPolicy};
use crate::config::ConfigHandle;
use crate::duress::{DuressDetector, NodeDuress};
use crate::models::{ResiliencyMode, ResourceGroup, ResourceKind, TaskId};
use crate::observability::{GovernanceMetrics, StructuredLogger};
use crate::sampler::GroupUsageSnapshot;
use crate::stats::StatsAggregator;
use crate::tracking::TaskCanceller;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A cancellation issued during one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelledTask {
    pub task_id: TaskId,
    pub group_id: String,
    pub resource: ResourceKind,
    /// The task's usage of `resource` when it was selected
    pub usage: f64,
}

/// Outcome of one cancellation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancellationReport {
    pub cancelled: Vec<CancelledTask>,
    /// Groups in violation, whether or not they were eligible
    pub violating_groups: Vec<String>,
    /// Sampled group ids that were not in the group table
    pub unknown_groups: Vec<String>,
}

impl CancellationReport {
    pub fn cancelled_in(&self, group_id: &str) -> usize {
        self.cancelled.iter().filter(|c| c.group_id == group_id).count()
    }
}

pub struct Canceller {
    config: ConfigHandle,
    tasks: Arc<dyn TaskCanceller>,
    stats: Arc<StatsAggregator>,
    policy_override: Option<Arc<dyn CancellationPolicy>>,
    metrics: GovernanceMetrics,
    logger: StructuredLogger,
}

impl Canceller {
    pub fn new(
        config: ConfigHandle,
        tasks: Arc<dyn TaskCanceller>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            config,
            tasks,
            stats,
            policy_override: None,
            metrics: GovernanceMetrics::new(),
            logger: StructuredLogger::default(),
        }
    }

    /// Use `policy` instead of the one named in the configuration
    pub fn with_policy(mut self, policy: Arc<dyn CancellationPolicy>) -> Self {
        self.policy_override = Some(policy);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    fn policy(&self) -> Arc<dyn CancellationPolicy> {
        match &self.policy_override {
            Some(policy) => policy.clone(),
            None => policy_for(self.config.current().cancellation_policy),
        }
    }

    /// Cancel tasks of eligible groups until each breached resource is back
    /// under its limit.
    ///
    /// ENFORCED groups are eligible whenever they violate a limit, SOFT groups
    /// only while the node is in duress, and MONITOR groups never.
    pub fn run(
        &self,
        groups: &[ResourceGroup],
        snapshot: &GroupUsageSnapshot,
        detector: &DuressDetector,
        node: NodeDuress,
    ) -> CancellationReport {
        let by_id: BTreeMap<&str, &ResourceGroup> =
            groups.iter().map(|g| (g.id.as_str(), g)).collect();
        let policy = self.policy();
        let mut report = CancellationReport::default();

        for group_id in snapshot.group_ids() {
            let Some(group) = by_id.get(group_id) else {
                debug!(group_id = %group_id, "Skipping tasks of unknown group");
                report.unknown_groups.push(group_id.to_string());
                continue;
            };

            let violations = detector.group_in_violation(group, snapshot);
            if violations.is_empty() {
                continue;
            }
            report.violating_groups.push(group.id.clone());
            for (kind, excess) in &violations {
                let limit = group.limit(*kind).unwrap_or_default();
                self.logger
                    .log_group_violation(&group.id, *kind, limit + excess, limit);
            }

            let eligible = match group.mode {
                ResiliencyMode::Monitor => false,
                ResiliencyMode::Soft => node.any(),
                ResiliencyMode::Enforced => true,
            };
            if !eligible {
                continue;
            }

            self.cancel_group(group, snapshot, &violations, policy.as_ref(), &mut report);
        }

        report
    }

    fn cancel_group(
        &self,
        group: &ResourceGroup,
        snapshot: &GroupUsageSnapshot,
        violations: &BTreeMap<ResourceKind, f64>,
        policy: &dyn CancellationPolicy,
        report: &mut CancellationReport,
    ) {
        let tasks = snapshot.tasks_of(&group.id);
        let mut selected: HashSet<TaskId> = HashSet::new();

        for (kind, excess) in violations {
            // Tasks picked for an earlier resource already relieve this one
            let reclaimed: f64 = tasks
                .iter()
                .filter(|t| selected.contains(&t.task_id))
                .map(|t| t.usage.get(*kind))
                .sum();
            let reduce_by = excess - reclaimed;
            if reduce_by <= 0.0 {
                continue;
            }

            let candidates: Vec<_> = tasks
                .iter()
                .filter(|t| !selected.contains(&t.task_id))
                .cloned()
                .collect();

            for task in policy.select_tasks_to_cancel(&candidates, reduce_by, *kind) {
                selected.insert(task.task_id);
                let usage = task.usage.get(*kind);
                let reason = format!(
                    "resource group '{}' exceeded its {} limit",
                    group.name, kind
                );
                if !self.tasks.cancel(task.task_id, &reason) {
                    continue;
                }

                self.stats.on_task_cancelled(&group.id);
                self.metrics.inc_tasks_cancelled(*kind);
                self.logger.log_task_cancelled(
                    task.task_id,
                    &group.id,
                    *kind,
                    usage,
                    reduce_by,
                    policy.name(),
                );
                report.cancelled.push(CancelledTask {
                    task_id: task.task_id,
                    group_id: group.id.clone(),
                    resource: *kind,
                    usage,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::MostResourceIntensiveFirst;
    use crate::models::ResourceVector;
    use crate::sampler::TaskFootprint;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingCanceller {
        calls: Mutex<Vec<TaskId>>,
        finished: HashSet<TaskId>,
    }

    impl TaskCanceller for RecordingCanceller {
        fn cancel(&self, task_id: TaskId, _reason: &str) -> bool {
            let mut calls = self.calls.lock().unwrap();
            if self.finished.contains(&task_id) || calls.contains(&task_id) {
                return false;
            }
            calls.push(task_id);
            true
        }
    }

    fn group(id: &str, mode: ResiliencyMode, limits: &[(ResourceKind, f64)]) -> ResourceGroup {
        ResourceGroup {
            id: id.into(),
            name: id.into(),
            mode,
            resource_limits: limits.iter().copied().collect(),
            updated_at_millis: 0,
        }
    }

    fn record(snapshot: &mut GroupUsageSnapshot, task_id: TaskId, group: &str, age_secs: u64, cpu: f64, memory: f64) {
        snapshot.record(TaskFootprint {
            task_id,
            group_id: group.into(),
            started_at: Instant::now() - Duration::from_secs(age_secs),
            usage: ResourceVector { cpu, memory },
        });
    }

    struct Fixture {
        canceller: Canceller,
        tasks: Arc<RecordingCanceller>,
        stats: Arc<StatsAggregator>,
        detector: DuressDetector,
    }

    fn fixture_with(tasks: RecordingCanceller) -> Fixture {
        let config = ConfigHandle::default();
        let tasks = Arc::new(tasks);
        let stats = Arc::new(StatsAggregator::new());
        Fixture {
            canceller: Canceller::new(config.clone(), tasks.clone(), stats.clone()),
            tasks,
            stats,
            detector: DuressDetector::new(config),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingCanceller::default())
    }

    const CALM: NodeDuress = NodeDuress {
        cpu: false,
        memory: false,
    };

    #[test]
    fn test_enforced_group_cancels_minimal_set() {
        let f = fixture();
        let groups = vec![group("g1", ResiliencyMode::Enforced, &[(ResourceKind::Memory, 0.5)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "g1", 20, 0.0, 0.4);
        record(&mut snapshot, 2, "g1", 10, 0.0, 0.4);

        let report = f.canceller.run(&groups, &snapshot, &f.detector, CALM);

        assert_eq!(report.cancelled.len(), 1);
        assert_eq!(report.cancelled[0].task_id, 1);
        assert_eq!(f.stats.group("g1").unwrap().cancelled, 1);
        assert_eq!(report.violating_groups, vec!["g1".to_string()]);
    }

    #[test]
    fn test_monitor_group_never_cancelled() {
        let f = fixture();
        let groups = vec![group("m", ResiliencyMode::Monitor, &[(ResourceKind::Memory, 0.1)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "m", 10, 0.0, 0.9);

        let report = f.canceller.run(&groups, &snapshot, &f.detector, NodeDuress { cpu: true, memory: true });
        assert!(report.cancelled.is_empty());
        assert_eq!(report.violating_groups.len(), 1);
    }

    #[test]
    fn test_soft_group_cancelled_only_under_node_duress() {
        let f = fixture();
        let groups = vec![group("s", ResiliencyMode::Soft, &[(ResourceKind::Cpu, 0.2)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "s", 10, 0.5, 0.0);

        assert!(f.canceller.run(&groups, &snapshot, &f.detector, CALM).cancelled.is_empty());

        let duress = NodeDuress { cpu: false, memory: true };
        let report = f.canceller.run(&groups, &snapshot, &f.detector, duress);
        assert_eq!(report.cancelled.len(), 1);
    }

    #[test]
    fn test_task_breaching_two_resources_cancelled_once() {
        let f = fixture();
        let groups = vec![group(
            "g",
            ResiliencyMode::Enforced,
            &[(ResourceKind::Cpu, 0.3), (ResourceKind::Memory, 0.3)],
        )];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "g", 30, 0.4, 0.4);
        record(&mut snapshot, 2, "g", 10, 0.1, 0.1);

        let report = f.canceller.run(&groups, &snapshot, &f.detector, CALM);

        assert_eq!(report.cancelled.len(), 1);
        assert_eq!(*f.tasks.calls.lock().unwrap(), vec![1]);
        assert_eq!(f.stats.group("g").unwrap().cancelled, 1);
    }

    #[test]
    fn test_unknown_group_skipped_without_aborting_pass() {
        let f = fixture();
        let groups = vec![group("known", ResiliencyMode::Enforced, &[(ResourceKind::Memory, 0.1)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "deleted", 10, 0.0, 0.9);
        record(&mut snapshot, 2, "known", 10, 0.0, 0.3);

        let report = f.canceller.run(&groups, &snapshot, &f.detector, CALM);
        assert_eq!(report.unknown_groups, vec!["deleted".to_string()]);
        assert_eq!(report.cancelled_in("known"), 1);
    }

    #[test]
    fn test_finished_task_is_not_counted() {
        let f = fixture_with(RecordingCanceller {
            finished: [1].into_iter().collect(),
            ..Default::default()
        });
        let groups = vec![group("g", ResiliencyMode::Enforced, &[(ResourceKind::Memory, 0.5)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "g", 20, 0.0, 0.4);
        record(&mut snapshot, 2, "g", 10, 0.0, 0.4);

        let report = f.canceller.run(&groups, &snapshot, &f.detector, CALM);
        assert!(report.cancelled.is_empty());
        assert!(f.stats.group("g").is_none());
    }

    #[test]
    fn test_policy_override() {
        let f = fixture();
        let canceller = Canceller::new(ConfigHandle::default(), f.tasks.clone(), f.stats.clone())
            .with_policy(Arc::new(MostResourceIntensiveFirst));
        let groups = vec![group("g", ResiliencyMode::Enforced, &[(ResourceKind::Memory, 0.5)])];
        let mut snapshot = GroupUsageSnapshot::default();
        record(&mut snapshot, 1, "g", 30, 0.0, 0.1);
        record(&mut snapshot, 2, "g", 10, 0.0, 0.6);

        let report = canceller.run(&groups, &snapshot, &f.detector, CALM);
        assert_eq!(report.cancelled[0].task_id, 2);
        assert_eq!(report.cancelled.len(), 1);
    }
}
