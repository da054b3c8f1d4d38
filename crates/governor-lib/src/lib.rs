//! Resource governance core for a multi-tenant query engine
//!
//! This crate provides:
//! - A cluster-wide registry of resource groups with CPU/memory limits
//! - Sampling of per-task usage aggregated per group
//! - Node duress detection with hysteresis
//! - Pluggable policies that pick which tasks to cancel
//! - The periodic enforcement loop and per-group statistics
//! - Health checks and observability

pub mod admission;
pub mod cancellation;
pub mod config;
pub mod duress;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod stats;
pub mod tracking;

pub use admission::{AdmissionController, AttributeClassifier, RequestAttributes, UserClassifier};
pub use cancellation::{
    policy_for, CancellationPolicy, CancellationReport, CancelledTask, Canceller,
    LongestRunningFirst, MostResourceIntensiveFirst,
};
pub use config::{ConfigHandle, GovernanceConfig, PolicyKind};
pub use duress::{DuressDetector, NodeDuress};
pub use error::{GovernanceError, GovernanceResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GovernanceMetrics, StructuredLogger};
pub use registry::{ClusterStateStore, GroupRegistry, GroupTable, InMemoryClusterStateStore};
pub use sampler::{GroupUsageSnapshot, ResourceSampler, TaskFootprint};
pub use scheduler::{GovernanceScheduler, GovernanceSchedulerBuilder, SchedulerState, TickReport};
pub use stats::{GroupStats, StatsAggregator};
pub use tracking::{TaskCanceller, TaskHandle, TaskSource, TaskTracker};
