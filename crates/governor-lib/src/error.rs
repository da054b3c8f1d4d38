//! Error taxonomy for the governance core

use crate::models::ResourceKind;
use thiserror::Error;

/// Errors surfaced by the registry, configuration and admission paths
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernanceError {
    #[error("invalid group definition: {0}")]
    InvalidDefinition(String),

    #[error("a resource group named '{0}' already exists")]
    DuplicateName(String),

    #[error("resource group limit of {max} reached")]
    CapacityExceeded { max: usize },

    #[error("total {kind} allocation would reach {total:.2}, exceeding 1.0")]
    OverAllocated { kind: ResourceKind, total: f64 },

    #[error("resource group '{0}' not found")]
    NotFound(String),

    #[error("cluster state mutation lost: {0}")]
    MutationConflict(String),

    #[error("request rejected by resource group '{group}': {reason}")]
    Rejected { group: String, reason: String },

    #[error("invalid governance configuration: {0}")]
    InvalidConfig(String),
}

impl GovernanceError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, GovernanceError::MutationConflict(_))
    }
}

pub type GovernanceResult<T> = Result<T, GovernanceError>;
