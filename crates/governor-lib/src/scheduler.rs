//! Fixed-delay enforcement loop
//!
//! Each tick runs, in order: sample tracked tasks, evaluate node duress,
//! cancel tasks of eligible groups in violation, then prune groups whose
//! pending deletion has drained. A tick that fails or panics is logged and
//! the loop carries on with the next one.

use crate::cancellation::{Canceller, CancelledTask};
use crate::config::ConfigHandle;
use crate::duress::{DuressDetector, NodeDuress};
use crate::health::{components, HealthRegistry};
use crate::models::ResourceKind;
use crate::observability::{GovernanceMetrics, StructuredLogger};
use crate::registry::GroupRegistry;
use crate::sampler::ResourceSampler;
use crate::stats::StatsAggregator;
use crate::tracking::{TaskCanceller, TaskSource};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the enforcement loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::Running,
            2 => SchedulerState::Stopping,
            _ => SchedulerState::Stopped,
        }
    }
}

/// What one tick observed and did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tracked_tasks: usize,
    pub node_duress: NodeDuress,
    pub cancelled: Vec<CancelledTask>,
    pub pruned_groups: Vec<String>,
}

struct TickContext {
    config: ConfigHandle,
    registry: Arc<GroupRegistry>,
    tasks: Arc<dyn TaskSource>,
    detector: DuressDetector,
    canceller: Canceller,
    stats: Arc<StatsAggregator>,
    health: Option<HealthRegistry>,
    metrics: GovernanceMetrics,
    logger: StructuredLogger,
}

impl TickContext {
    async fn tick(&self) -> Result<TickReport> {
        let config = self.config.current();

        let tracked = self
            .tasks
            .tracked_tasks()
            .await
            .context("listing tracked tasks")?;
        let snapshot = ResourceSampler::new(config.node_capacity).sample(&tracked, Instant::now());

        let groups = self.registry.live_groups();
        for group in &groups {
            self.stats
                .record_usage(&group.id, snapshot.group_usage(&group.id).unwrap_or_default());
        }

        let node_usage = snapshot.node_usage();
        let node_duress = self.detector.evaluate(&node_usage);
        for kind in ResourceKind::ALL {
            let in_duress = node_duress.in_duress(kind);
            self.metrics.set_node_duress(kind, in_duress);
            if in_duress {
                self.logger.log_node_duress(
                    kind,
                    node_usage.get(kind),
                    config.node_duress_threshold(kind),
                );
            }
        }

        let cancellation = self
            .canceller
            .run(&groups, &snapshot, &self.detector, node_duress);

        let pruned_groups = self
            .registry
            .prune_pending()
            .await
            .context("pruning drained groups")?;
        for id in &pruned_groups {
            self.stats.remove_group(id);
        }
        let known: HashSet<String> = self
            .registry
            .live_groups()
            .into_iter()
            .map(|g| g.id)
            .collect();
        let dropped = self.stats.retain_known(|id| known.contains(id));
        if !dropped.is_empty() {
            debug!(groups = ?dropped, "Dropped stats of unknown groups");
        }

        self.metrics.set_groups(
            groups.len() - pruned_groups.len().min(groups.len()),
            self.registry.pending_deletion_count(),
        );
        self.metrics.set_tracked_tasks(tracked.len());

        Ok(TickReport {
            tracked_tasks: tracked.len(),
            node_duress,
            cancelled: cancellation.cancelled,
            pruned_groups,
        })
    }

    /// Run one tick on its own task so a panic cannot take down the loop
    async fn guarded_tick(self: Arc<Self>) {
        let started = Instant::now();
        let ctx = self.clone();
        let outcome = tokio::spawn(async move { ctx.tick().await }).await;
        self.metrics
            .observe_tick_latency(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(report)) => {
                debug!(
                    tracked_tasks = report.tracked_tasks,
                    cancelled = report.cancelled.len(),
                    pruned = report.pruned_groups.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Enforcement tick complete"
                );
                None
            }
            Ok(Err(e)) => Some(format!("tick failed: {:#}", e)),
            Err(e) if e.is_panic() => Some("tick panicked".to_string()),
            Err(e) => Some(format!("tick aborted: {}", e)),
        };

        match failure {
            None => {
                if let Some(health) = &self.health {
                    health.set_healthy(components::SCHEDULER).await;
                }
            }
            Some(message) => {
                self.metrics.inc_tick_errors();
                error!(error = %message, "Enforcement tick failed, continuing");
                if let Some(health) = &self.health {
                    health.set_degraded(components::SCHEDULER, message).await;
                }
            }
        }
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drives the periodic enforcement loop
pub struct GovernanceScheduler {
    context: Arc<TickContext>,
    state: AtomicU8,
    control: Mutex<Option<RunningLoop>>,
}

impl GovernanceScheduler {
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Start the loop. Returns false if it was not stopped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        // Held across the transition so a running state always has its loop
        let mut control = self.lock_control();
        if self
            .state
            .compare_exchange(
                SchedulerState::Stopped as u8,
                SchedulerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(state = ?self.state(), "Scheduler start ignored");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.context.clone(), shutdown_rx));
        *control = Some(RunningLoop { shutdown, handle });
        drop(control);

        info!(
            interval_ms = self.context.config.current().enforcement_interval_ms,
            "Governance scheduler started"
        );
        true
    }

    /// Stop the loop and wait for it to exit. A tick already in progress
    /// runs to completion; no tick starts afterwards. Returns false if the
    /// loop was not running.
    pub async fn stop(&self) -> bool {
        let running = {
            let mut control = self.lock_control();
            if self
                .state
                .compare_exchange(
                    SchedulerState::Running as u8,
                    SchedulerState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                debug!(state = ?self.state(), "Scheduler stop ignored");
                return false;
            }
            control.take()
        };

        if let Some(RunningLoop { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        self.state
            .store(SchedulerState::Stopped as u8, Ordering::SeqCst);
        info!("Governance scheduler stopped");
        true
    }

    /// Run a single tick immediately, outside the loop
    pub async fn tick_once(&self) -> Result<TickReport> {
        self.context.tick().await
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.context.stats
    }

    pub fn detector(&self) -> &DuressDetector {
        &self.context.detector
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Option<RunningLoop>> {
        match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_loop(context: Arc<TickContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let delay = context.config.current().enforcement_interval();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        context.clone().guarded_tick().await;
    }
    debug!("Governance loop exited");
}

/// Builder for [`GovernanceScheduler`]
#[derive(Default)]
pub struct GovernanceSchedulerBuilder {
    config: Option<ConfigHandle>,
    registry: Option<Arc<GroupRegistry>>,
    tasks: Option<Arc<dyn TaskSource>>,
    canceller: Option<Arc<dyn TaskCanceller>>,
    stats: Option<Arc<StatsAggregator>>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl GovernanceSchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to the registry's configuration handle
    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<GroupRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn task_source(mut self, tasks: Arc<dyn TaskSource>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn task_canceller(mut self, canceller: Arc<dyn TaskCanceller>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn stats(mut self, stats: Arc<StatsAggregator>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<GovernanceScheduler> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Group registry is required"))?;
        let tasks = self
            .tasks
            .ok_or_else(|| anyhow::anyhow!("Task source is required"))?;
        let task_canceller = self
            .canceller
            .ok_or_else(|| anyhow::anyhow!("Task canceller is required"))?;

        let config = self.config.unwrap_or_else(|| registry.config().clone());
        let stats = self.stats.unwrap_or_default();
        let logger = self.logger.unwrap_or_default();
        let canceller = Canceller::new(config.clone(), task_canceller, stats.clone())
            .with_logger(logger.clone());

        Ok(GovernanceScheduler {
            context: Arc::new(TickContext {
                detector: DuressDetector::new(config.clone()),
                config,
                registry,
                tasks,
                canceller,
                stats,
                health: self.health,
                metrics: GovernanceMetrics::new(),
                logger,
            }),
            state: AtomicU8::new(SchedulerState::Stopped as u8),
            control: Mutex::new(None),
        })
    }
}
