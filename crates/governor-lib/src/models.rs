//! Core data models for the workload governor

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Identifier of a tracked task, as assigned by the task-execution subsystem
pub type TaskId = u64;

/// Per-resource thresholds of a group, as fractions of node capacity
pub type ResourceLimits = BTreeMap<ResourceKind, f64>;

/// The governed resource dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

/// Converts a raw usage reading into a fraction of node capacity
type UsageExtractor = fn(&ResourceUsage, Duration, &NodeCapacity) -> f64;

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
        }
    }

    /// Fraction of node capacity consumed by `usage` for a task alive for `elapsed`
    pub fn fraction(self, usage: &ResourceUsage, elapsed: Duration, capacity: &NodeCapacity) -> f64 {
        (self.extractor())(usage, elapsed, capacity)
    }

    fn extractor(self) -> UsageExtractor {
        match self {
            ResourceKind::Cpu => cpu_fraction,
            ResourceKind::Memory => memory_fraction,
        }
    }
}

fn cpu_fraction(usage: &ResourceUsage, elapsed: Duration, capacity: &NodeCapacity) -> f64 {
    let available_nanos = elapsed.as_nanos() as f64 * capacity.num_cores as f64;
    if available_nanos <= 0.0 {
        return 0.0;
    }
    usage.cpu_time_nanos as f64 / available_nanos
}

fn memory_fraction(usage: &ResourceUsage, _elapsed: Duration, capacity: &NodeCapacity) -> f64 {
    if capacity.total_memory_bytes == 0 {
        return 0.0;
    }
    usage.memory_bytes as f64 / capacity.total_memory_bytes as f64
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "memory" => Ok(ResourceKind::Memory),
            other => Err(format!("unknown resource kind '{}'", other)),
        }
    }
}

/// Enforcement mode of a resource group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResiliencyMode {
    /// Observe only, never cancel
    Monitor,
    /// Cancel only while the node is in duress
    Soft,
    /// Cancel whenever the group breaches its own limit
    Enforced,
}

impl ResiliencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResiliencyMode::Monitor => "monitor",
            ResiliencyMode::Soft => "soft",
            ResiliencyMode::Enforced => "enforced",
        }
    }
}

impl fmt::Display for ResiliencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResiliencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monitor" => Ok(ResiliencyMode::Monitor),
            "soft" => Ok(ResiliencyMode::Soft),
            "enforced" => Ok(ResiliencyMode::Enforced),
            other => Err(format!("unknown resiliency mode '{}'", other)),
        }
    }
}

/// A named governance unit with resource thresholds and an enforcement mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub id: String,
    pub name: String,
    pub mode: ResiliencyMode,
    pub resource_limits: ResourceLimits,
    pub updated_at_millis: i64,
}

impl ResourceGroup {
    /// Configured threshold for `kind`, if the group limits it
    pub fn limit(&self, kind: ResourceKind) -> Option<f64> {
        self.resource_limits.get(&kind).copied()
    }

    /// Whether `name_or_id` refers to this group
    pub fn matches(&self, name_or_id: &str) -> bool {
        self.id == name_or_id || self.name == name_or_id
    }
}

/// Caller-supplied definition for a new group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    /// Optional caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub mode: ResiliencyMode,
    pub resource_limits: ResourceLimits,
    /// Defaults to the creation time
    #[serde(default)]
    pub updated_at_millis: Option<i64>,
}

impl GroupDefinition {
    pub fn new(name: impl Into<String>, mode: ResiliencyMode) -> Self {
        Self {
            id: None,
            name: name.into(),
            mode,
            resource_limits: ResourceLimits::new(),
            updated_at_millis: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_limit(mut self, kind: ResourceKind, threshold: f64) -> Self {
        self.resource_limits.insert(kind, threshold);
        self
    }

    pub fn with_updated_at(mut self, millis: i64) -> Self {
        self.updated_at_millis = Some(millis);
        self
    }
}

/// Partial update of an existing group; only supplied fields change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: Option<ResiliencyMode>,
    /// Merged into the existing limits kind by kind
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub updated_at_millis: Option<i64>,
}

impl GroupUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.mode.is_none()
            && self.resource_limits.is_none()
            && self.updated_at_millis.is_none()
    }
}

/// Resources available on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCapacity {
    pub num_cores: usize,
    pub total_memory_bytes: u64,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            num_cores: 1,
            total_memory_bytes: 1 << 30,
        }
    }
}

/// Raw resource counters of one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_time_nanos: u64,
    pub memory_bytes: u64,
}

/// Point-in-time resource consumption of one tracked task
#[derive(Debug, Clone)]
pub struct TaskUsageSample {
    pub task_id: TaskId,
    pub group_id: String,
    pub started_at: Instant,
    pub usage: ResourceUsage,
}

/// Usage fractions per resource kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceVector {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        match kind {
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Memory => self.memory = value,
        }
    }

    pub fn accumulate(&mut self, other: &ResourceVector) {
        self.cpu += other.cpu;
        self.memory += other.memory;
    }
}
