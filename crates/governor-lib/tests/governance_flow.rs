//! End-to-end tests driving the registry, tracker and scheduler together

use governor_lib::{
    Canceller, ConfigHandle, DuressDetector, GovernanceConfig, GovernanceSchedulerBuilder,
    GroupDefinition, GroupRegistry, GroupUsageSnapshot, InMemoryClusterStateStore, NodeCapacity,
    NodeDuress, ResiliencyMode, ResourceKind, ResourceUsage, ResourceVector, StatsAggregator,
    TaskFootprint, TaskTracker,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MEMORY_BYTES: u64 = 1_000;

struct Harness {
    config: ConfigHandle,
    stats: Arc<StatsAggregator>,
    tracker: Arc<TaskTracker>,
    registry: Arc<GroupRegistry>,
}

fn harness() -> Harness {
    let config = ConfigHandle::new(GovernanceConfig {
        node_capacity: NodeCapacity {
            num_cores: 4,
            total_memory_bytes: MEMORY_BYTES,
        },
        ..Default::default()
    })
    .unwrap();
    let stats = Arc::new(StatsAggregator::new());
    let tracker = Arc::new(TaskTracker::new(stats.clone()));
    let registry = Arc::new(GroupRegistry::new(
        InMemoryClusterStateStore::spawn(),
        tracker.clone(),
        config.clone(),
    ));
    Harness {
        config,
        stats,
        tracker,
        registry,
    }
}

fn start_task(h: &Harness, task_id: u64, group_id: &str, age: Duration, memory_bytes: u64) {
    h.tracker
        .on_task_started_at(task_id, group_id, Instant::now() - age);
    h.tracker.record_usage(
        task_id,
        ResourceUsage {
            cpu_time_nanos: 0,
            memory_bytes,
        },
    );
}

#[tokio::test]
async fn test_enforced_group_over_memory_loses_one_task() {
    let h = harness();
    let g1 = h
        .registry
        .create(
            GroupDefinition::new("g1", ResiliencyMode::Enforced)
                .with_limit(ResourceKind::Memory, 0.5),
        )
        .await
        .unwrap();

    let mut snapshot = GroupUsageSnapshot::default();
    for (task_id, age) in [(1, 30), (2, 10)] {
        h.tracker.on_task_started(task_id, g1.id.clone());
        snapshot.record(TaskFootprint {
            task_id,
            group_id: g1.id.clone(),
            started_at: Instant::now() - Duration::from_secs(age),
            usage: ResourceVector {
                cpu: 0.0,
                memory: 0.4,
            },
        });
    }
    assert!((snapshot.usage(&g1.id, ResourceKind::Memory) - 0.8).abs() < 1e-9);

    let canceller = Canceller::new(h.config.clone(), h.tracker.clone(), h.stats.clone());
    let detector = DuressDetector::new(h.config.clone());
    let report = canceller.run(
        &h.registry.live_groups(),
        &snapshot,
        &detector,
        NodeDuress::default(),
    );

    assert_eq!(report.cancelled.len(), 1);
    let remaining = 0.8 - report.cancelled[0].usage;
    assert!(remaining <= 0.5);
    assert_eq!(h.stats.group(&g1.id).unwrap().cancelled, 1);

    // The cancelled task exiting does not count a second cancellation
    h.tracker.on_task_cancelled(report.cancelled[0].task_id);
    let stats = h.stats.group(&g1.id).unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.running, 1);
}

#[tokio::test]
async fn test_scheduler_tick_enforces_and_repeats_until_relieved() {
    let h = harness();
    let g1 = h
        .registry
        .create(
            GroupDefinition::new("g1", ResiliencyMode::Enforced)
                .with_limit(ResourceKind::Memory, 0.5),
        )
        .await
        .unwrap();
    start_task(&h, 1, &g1.id, Duration::from_secs(30), 400);
    start_task(&h, 2, &g1.id, Duration::from_secs(10), 400);

    let scheduler = GovernanceSchedulerBuilder::new()
        .registry(h.registry.clone())
        .task_source(h.tracker.clone())
        .task_canceller(h.tracker.clone())
        .stats(h.stats.clone())
        .build()
        .unwrap();

    let report = scheduler.tick_once().await.unwrap();
    assert_eq!(report.cancelled.len(), 1);
    assert_eq!(report.cancelled[0].task_id, 1);

    // Task 1 has not exited yet; a second tick must not cancel it again or
    // pick another task for the same overage
    let report = scheduler.tick_once().await.unwrap();
    assert!(report.cancelled.is_empty());
    assert_eq!(h.stats.group(&g1.id).unwrap().cancelled, 1);

    h.tracker.on_task_cancelled(1);
    let report = scheduler.tick_once().await.unwrap();
    assert!(report.cancelled.is_empty());
    assert!((h.stats.group(&g1.id).unwrap().last_usage.memory - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_soft_group_cancelled_only_after_sustained_node_duress() {
    let h = harness();
    let soft = h
        .registry
        .create(
            GroupDefinition::new("adhoc", ResiliencyMode::Soft)
                .with_limit(ResourceKind::Memory, 0.3),
        )
        .await
        .unwrap();
    // 0.95 of node memory in one group: over its limit and over the node threshold
    start_task(&h, 1, &soft.id, Duration::from_secs(5), 950);

    let scheduler = GovernanceSchedulerBuilder::new()
        .registry(h.registry.clone())
        .task_source(h.tracker.clone())
        .task_canceller(h.tracker.clone())
        .stats(h.stats.clone())
        .build()
        .unwrap();

    for _ in 0..2 {
        let report = scheduler.tick_once().await.unwrap();
        assert!(!report.node_duress.memory);
        assert!(report.cancelled.is_empty());
    }

    let report = scheduler.tick_once().await.unwrap();
    assert!(report.node_duress.memory);
    assert_eq!(report.cancelled.len(), 1);
}

#[tokio::test]
async fn test_monitor_group_is_observed_only() {
    let h = harness();
    let monitor = h
        .registry
        .create(
            GroupDefinition::new("observe", ResiliencyMode::Monitor)
                .with_limit(ResourceKind::Memory, 0.1),
        )
        .await
        .unwrap();
    start_task(&h, 1, &monitor.id, Duration::from_secs(5), 950);

    let scheduler = GovernanceSchedulerBuilder::new()
        .registry(h.registry.clone())
        .task_source(h.tracker.clone())
        .task_canceller(h.tracker.clone())
        .stats(h.stats.clone())
        .build()
        .unwrap();

    for _ in 0..5 {
        assert!(scheduler.tick_once().await.unwrap().cancelled.is_empty());
    }
    assert!(!h.tracker.is_cancelled(1));
    assert!((h.stats.group(&monitor.id).unwrap().last_usage.memory - 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn test_pending_deletion_pruned_by_tick_once_drained() {
    let h = harness();
    let idle = h
        .registry
        .create(GroupDefinition::new("idle", ResiliencyMode::Soft).with_limit(ResourceKind::Cpu, 0.2))
        .await
        .unwrap();
    let busy = h
        .registry
        .create(GroupDefinition::new("busy", ResiliencyMode::Soft).with_limit(ResourceKind::Cpu, 0.2))
        .await
        .unwrap();
    start_task(&h, 7, &busy.id, Duration::from_secs(1), 10);

    h.registry.delete(Some("idle")).await.unwrap();
    assert!(h.registry.get(Some(&idle.id)).is_empty());

    h.registry.delete(Some("busy")).await.unwrap();
    assert_eq!(h.registry.get(Some("busy")).len(), 1);
    assert!(h.registry.is_pending_deletion(&busy.id));

    let scheduler = GovernanceSchedulerBuilder::new()
        .registry(h.registry.clone())
        .task_source(h.tracker.clone())
        .task_canceller(h.tracker.clone())
        .stats(h.stats.clone())
        .build()
        .unwrap();

    let report = scheduler.tick_once().await.unwrap();
    assert!(report.pruned_groups.is_empty());
    assert_eq!(h.registry.get(Some("busy")).len(), 1);

    h.tracker.on_task_completed(7);
    let report = scheduler.tick_once().await.unwrap();
    assert_eq!(report.pruned_groups, vec![busy.id.clone()]);
    assert!(h.registry.get(None).is_empty());
    assert!(h.stats.group(&busy.id).is_none());
}

#[tokio::test]
async fn test_running_loop_enforces_without_manual_ticks() {
    let h = harness();
    h.config
        .reconfigure(GovernanceConfig {
            enforcement_interval_ms: 10,
            ..(*h.config.current()).clone()
        })
        .unwrap();
    let g = h
        .registry
        .create(
            GroupDefinition::new("loop", ResiliencyMode::Enforced)
                .with_limit(ResourceKind::Memory, 0.2),
        )
        .await
        .unwrap();
    let handle = h.tracker.on_task_started(1, g.id.clone());
    h.tracker.record_usage(
        1,
        ResourceUsage {
            cpu_time_nanos: 0,
            memory_bytes: 500,
        },
    );

    let scheduler = GovernanceSchedulerBuilder::new()
        .registry(h.registry.clone())
        .task_source(h.tracker.clone())
        .task_canceller(h.tracker.clone())
        .stats(h.stats.clone())
        .build()
        .unwrap();
    assert!(scheduler.start());

    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.is_cancelled() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(scheduler.stop().await);
    assert!(handle.is_cancelled());
}
