//! Observability for the governance loop
//!
//! Provides:
//! - Prometheus metrics (tick latency, group and task gauges, cancellations, node duress)
//! - Structured JSON logging of governance events with tracing

use crate::models::{ResourceGroup, ResourceKind, TaskId};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

static GLOBAL_METRICS: OnceLock<GovernanceMetricsInner> = OnceLock::new();

struct GovernanceMetricsInner {
    tick_latency_seconds: Histogram,
    tick_errors: IntCounter,
    live_groups: IntGauge,
    pending_deletion_groups: IntGauge,
    tracked_tasks: IntGauge,
    tasks_cancelled: IntCounterVec,
    node_duress: IntGaugeVec,
    requests_rejected: IntCounter,
}

impl GovernanceMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "workload_governor_tick_latency_seconds",
                "Time spent in one enforcement tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            tick_errors: register_int_counter!(
                "workload_governor_tick_errors_total",
                "Enforcement ticks aborted by an error"
            )
            .expect("Failed to register tick_errors"),

            live_groups: register_int_gauge!(
                "workload_governor_live_groups",
                "Resource groups in the committed group table"
            )
            .expect("Failed to register live_groups"),

            pending_deletion_groups: register_int_gauge!(
                "workload_governor_pending_deletion_groups",
                "Resource groups waiting for their tasks to drain"
            )
            .expect("Failed to register pending_deletion_groups"),

            tracked_tasks: register_int_gauge!(
                "workload_governor_tracked_tasks",
                "Tasks seen by the last sample"
            )
            .expect("Failed to register tracked_tasks"),

            tasks_cancelled: register_int_counter_vec!(
                "workload_governor_tasks_cancelled_total",
                "Tasks cancelled by the governor",
                &["resource"]
            )
            .expect("Failed to register tasks_cancelled"),

            node_duress: register_int_gauge_vec!(
                "workload_governor_node_duress",
                "Whether the node is in duress for a resource (1) or not (0)",
                &["resource"]
            )
            .expect("Failed to register node_duress"),

            requests_rejected: register_int_counter!(
                "workload_governor_requests_rejected_total",
                "Requests rejected at admission"
            )
            .expect("Failed to register requests_rejected"),
        }
    }
}

/// Lightweight handle to the process-wide governance metrics
#[derive(Clone)]
pub struct GovernanceMetrics {
    _private: (),
}

impl Default for GovernanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GovernanceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GovernanceMetricsInner {
        GLOBAL_METRICS.get_or_init(GovernanceMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_tick_errors(&self) {
        self.inner().tick_errors.inc();
    }

    pub fn set_groups(&self, live: usize, pending_deletion: usize) {
        self.inner().live_groups.set(live as i64);
        self.inner().pending_deletion_groups.set(pending_deletion as i64);
    }

    pub fn set_tracked_tasks(&self, count: usize) {
        self.inner().tracked_tasks.set(count as i64);
    }

    pub fn inc_tasks_cancelled(&self, kind: ResourceKind) {
        self.inner()
            .tasks_cancelled
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn set_node_duress(&self, kind: ResourceKind, in_duress: bool) {
        self.inner()
            .node_duress
            .with_label_values(&[kind.as_str()])
            .set(in_duress as i64);
    }

    pub fn inc_requests_rejected(&self) {
        self.inner().requests_rejected.inc();
    }
}

/// Structured logger for governance events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("local")
    }
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_task_cancelled(
        &self,
        task_id: TaskId,
        group_id: &str,
        kind: ResourceKind,
        usage: f64,
        reduce_by: f64,
        policy: &str,
    ) {
        info!(
            event = "task_cancelled",
            node = %self.node_name,
            task_id = task_id,
            group_id = %group_id,
            resource = %kind,
            usage = usage,
            reduce_by = reduce_by,
            policy = %policy,
            "Cancelled task to relieve resource pressure"
        );
    }

    pub fn log_group_violation(&self, group_id: &str, kind: ResourceKind, usage: f64, limit: f64) {
        warn!(
            event = "group_violation",
            node = %self.node_name,
            group_id = %group_id,
            resource = %kind,
            usage = usage,
            limit = limit,
            "Resource group exceeds its limit"
        );
    }

    pub fn log_node_duress(&self, kind: ResourceKind, usage: f64, threshold: f64) {
        warn!(
            event = "node_duress",
            node = %self.node_name,
            resource = %kind,
            usage = usage,
            threshold = threshold,
            "Node in resource duress"
        );
    }

    pub fn log_group_created(&self, group: &ResourceGroup) {
        info!(
            event = "group_created",
            node = %self.node_name,
            group_id = %group.id,
            name = %group.name,
            mode = %group.mode,
            "Resource group created"
        );
    }

    pub fn log_group_updated(&self, group: &ResourceGroup) {
        info!(
            event = "group_updated",
            node = %self.node_name,
            group_id = %group.id,
            name = %group.name,
            mode = %group.mode,
            "Resource group updated"
        );
    }

    /// `deferred` is set when the group still has tasks and was only marked
    pub fn log_group_deleted(&self, group: &ResourceGroup, deferred: bool) {
        info!(
            event = "group_deleted",
            node = %self.node_name,
            group_id = %group.id,
            name = %group.name,
            deferred = deferred,
            "Resource group deleted"
        );
    }

    pub fn log_startup(&self, version: &str, policy: &str) {
        info!(
            event = "governor_started",
            node = %self.node_name,
            governor_version = %version,
            policy = %policy,
            "Workload governor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "governor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Workload governor shutting down"
        );
    }
}
