//! Request classification and admission against group usage
//!
//! Admission only looks at the usage recorded by the last enforcement
//! tick, so it never blocks on sampling.

use crate::error::{GovernanceError, GovernanceResult};
use crate::models::ResiliencyMode;
use crate::observability::GovernanceMetrics;
use crate::registry::GroupRegistry;
use crate::stats::StatsAggregator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Attributes of an inbound request used to pick its group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    attributes: BTreeMap<String, String>,
}

impl RequestAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Assigns a request to a resource group
pub trait UserClassifier: Send + Sync {
    /// Name or id of the group, or `None` when the request is ungoverned
    fn classify(&self, request: &RequestAttributes) -> Option<String>;
}

/// Maps the value of one request attribute to a group
#[derive(Debug, Clone)]
pub struct AttributeClassifier {
    attribute: String,
    groups: HashMap<String, String>,
    default_group: Option<String>,
}

impl AttributeClassifier {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            groups: HashMap::new(),
            default_group: None,
        }
    }

    pub fn route(mut self, value: impl Into<String>, group: impl Into<String>) -> Self {
        self.groups.insert(value.into(), group.into());
        self
    }

    /// Group used when the attribute is missing or unmapped
    pub fn default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = Some(group.into());
        self
    }
}

impl UserClassifier for AttributeClassifier {
    fn classify(&self, request: &RequestAttributes) -> Option<String> {
        request
            .get(&self.attribute)
            .and_then(|value| self.groups.get(value))
            .or(self.default_group.as_ref())
            .cloned()
    }
}

pub struct AdmissionController {
    classifier: Arc<dyn UserClassifier>,
    registry: Arc<GroupRegistry>,
    stats: Arc<StatsAggregator>,
    metrics: GovernanceMetrics,
}

impl AdmissionController {
    pub fn new(
        classifier: Arc<dyn UserClassifier>,
        registry: Arc<GroupRegistry>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            classifier,
            registry,
            stats,
            metrics: GovernanceMetrics::new(),
        }
    }

    /// Classify `request` and decide whether it may start.
    ///
    /// Returns the id of the group the request belongs to, or the classifier's
    /// answer unchanged when no such group exists. ENFORCED groups whose last
    /// observed usage already reaches a limit reject new work.
    pub fn admit(&self, request: &RequestAttributes) -> GovernanceResult<Option<String>> {
        let Some(key) = self.classifier.classify(request) else {
            return Ok(None);
        };
        let Some(group) = self.registry.get(Some(&key)).into_iter().next() else {
            debug!(group = %key, "Request classified into unknown group, admitting");
            return Ok(Some(key));
        };

        if group.mode != ResiliencyMode::Enforced {
            return Ok(Some(group.id));
        }

        let usage = self
            .stats
            .group(&group.id)
            .map(|s| s.last_usage)
            .unwrap_or_default();
        let saturated = group
            .resource_limits
            .iter()
            .find(|(kind, limit)| usage.get(**kind) >= **limit);

        match saturated {
            None => Ok(Some(group.id)),
            Some((kind, limit)) => {
                self.stats.on_task_rejected(&group.id);
                self.metrics.inc_requests_rejected();
                Err(GovernanceError::Rejected {
                    group: group.name.clone(),
                    reason: format!(
                        "{} usage {:.2} has reached its limit {:.2}",
                        kind,
                        usage.get(*kind),
                        limit
                    ),
                })
            }
        }
    }
}
