//! Workload governor daemon
//!
//! Runs the resource governance loop for one query-engine node and serves
//! health, metrics and group management endpoints.

use anyhow::{Context, Result};
use governor_lib::{
    health::{components, HealthRegistry},
    policy_for, ConfigHandle, GovernanceSchedulerBuilder, GroupRegistry,
    InMemoryClusterStateStore, StatsAggregator, StructuredLogger, TaskTracker,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod seed;

const GOVERNOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting workload-governor");

    let config = config::DaemonConfig::load()?;
    info!(
        node_name = %config.node_name,
        max_groups = config.governance.max_groups,
        interval_ms = config.governance.enforcement_interval_ms,
        "Governor configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::REGISTRY).await;
    health_registry.register(components::CLUSTER_STATE).await;

    let logger = StructuredLogger::new(&config.node_name);
    let governance =
        ConfigHandle::new(config.governance.clone()).context("invalid governance settings")?;

    let stats = Arc::new(StatsAggregator::new());
    let tracker = Arc::new(TaskTracker::new(stats.clone()));
    let registry = Arc::new(
        GroupRegistry::new(
            InMemoryClusterStateStore::spawn(),
            tracker.clone(),
            governance.clone(),
        )
        .with_logger(logger.clone())
        .with_health(health_registry.clone()),
    );

    if let Some(path) = &config.groups_file {
        let definitions = seed::load_groups(path)?;
        let created = seed::seed_groups(&registry, definitions).await;
        info!(path = %path, created, "Seeded resource groups");
    }

    let scheduler = GovernanceSchedulerBuilder::new()
        .config(governance.clone())
        .registry(registry.clone())
        .task_source(tracker.clone())
        .task_canceller(tracker)
        .stats(stats.clone())
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;
    scheduler.start();

    logger.log_startup(
        GOVERNOR_VERSION,
        policy_for(governance.current().cancellation_policy).name(),
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        registry,
        stats,
    ));
    health_registry.set_ready(true).await;

    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            "SIGINT received"
        }
        served = &mut api_handle => {
            match served {
                Ok(Ok(())) => "API server exited",
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    "API server failed"
                }
                Err(e) => {
                    error!(error = %e, "API server task aborted");
                    "API server task aborted"
                }
            }
        }
    };

    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    scheduler.stop().await;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
