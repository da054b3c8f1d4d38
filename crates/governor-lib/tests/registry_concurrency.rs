//! Concurrent registry mutations against the single-writer store

use governor_lib::{
    ConfigHandle, GovernanceConfig, GovernanceError, GroupDefinition, GroupRegistry,
    InMemoryClusterStateStore, ResiliencyMode, ResourceKind, StatsAggregator, TaskTracker,
};
use std::sync::Arc;

fn registry(max_groups: usize) -> Arc<GroupRegistry> {
    Arc::new(GroupRegistry::new(
        InMemoryClusterStateStore::spawn(),
        Arc::new(TaskTracker::new(Arc::new(StatsAggregator::new()))),
        ConfigHandle::new(GovernanceConfig {
            max_groups,
            ..Default::default()
        })
        .unwrap(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_respect_max_groups() {
    const N: usize = 40;
    const M: usize = 7;
    let registry = registry(M);

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .create(
                        GroupDefinition::new(format!("group-{}", i), ResiliencyMode::Monitor)
                            .with_limit(ResourceKind::Cpu, 0.01),
                    )
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    let mut capacity_failures = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(GovernanceError::CapacityExceeded { max }) => {
                assert_eq!(max, M);
                capacity_failures += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(successes, M);
    assert_eq!(capacity_failures, N - M);
    assert_eq!(registry.in_flight(), 0);
    assert_eq!(registry.get(None).len(), M);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_never_overallocate() {
    let registry = registry(100);

    // Each asks for 0.3 of memory; at most three fit under 1.0
    let handles: Vec<_> = (0..12)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .create(
                        GroupDefinition::new(format!("mem-{}", i), ResiliencyMode::Enforced)
                            .with_limit(ResourceKind::Memory, 0.3),
                    )
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, GovernanceError::OverAllocated { .. })),
        }
    }

    assert_eq!(successes, 3);
    let total: f64 = registry
        .get(None)
        .iter()
        .filter_map(|g| g.limit(ResourceKind::Memory))
        .sum();
    assert!(total <= 1.0 + 1e-9);
    assert_eq!(registry.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_names_single_winner() {
    let registry = registry(100);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .create(
                        GroupDefinition::new("shared", ResiliencyMode::Soft)
                            .with_limit(ResourceKind::Cpu, 0.05),
                    )
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e, GovernanceError::DuplicateName("shared".into())),
        }
    }
    assert_eq!(winners, 1);
}
