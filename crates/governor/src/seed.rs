//! Startup group definitions

use anyhow::{Context, Result};
use governor_lib::{GovernanceError, GroupDefinition, GroupRegistry};
use std::path::Path;
use tracing::{info, warn};

/// Read a JSON array of group definitions
pub fn load_groups(path: impl AsRef<Path>) -> Result<Vec<GroupDefinition>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read groups file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse groups file {}", path.display()))
}

/// Create each definition, skipping ones that already exist. Returns the
/// number of groups created.
pub async fn seed_groups(registry: &GroupRegistry, definitions: Vec<GroupDefinition>) -> usize {
    let mut created = 0;
    for def in definitions {
        let name = def.name.clone();
        match registry.create(def).await {
            Ok(_) => created += 1,
            Err(GovernanceError::DuplicateName(_)) => {
                info!(name = %name, "Seed group already exists");
            }
            Err(e) => warn!(name = %name, error = %e, "Failed to seed group"),
        }
    }
    created
}
