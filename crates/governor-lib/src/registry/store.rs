//! Replicated group table and its single-writer commit path
//!
//! All registry mutations are expressed as functions from the committed
//! table to the next table. A [`ClusterStateStore`] applies them one at a
//! time, publishes the result, and reports the outcome through a
//! [`MutationListener`]. Proposing never blocks the caller.

use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{ResourceGroup, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The group table as stored in cluster metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupTable {
    /// Incremented on every committed mutation
    pub version: u64,
    /// Groups keyed by id
    groups: BTreeMap<String, ResourceGroup>,
    /// Ids of groups waiting for their tasks to drain before removal
    #[serde(default)]
    pending_deletion: BTreeSet<String>,
}

impl GroupTable {
    pub fn get(&self, id: &str) -> Option<&ResourceGroup> {
        self.groups.get(id)
    }

    /// Look a group up by id first, then by name
    pub fn find(&self, name_or_id: &str) -> Option<&ResourceGroup> {
        self.groups
            .get(name_or_id)
            .or_else(|| self.groups.values().find(|g| g.name == name_or_id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &ResourceGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether a group other than `excluding` answers to `key` as its id or
    /// its name. Ids and names share the lookup space of [`Self::find`].
    pub fn key_in_use(&self, key: &str, excluding: Option<&str>) -> bool {
        self.groups
            .values()
            .filter(|g| Some(g.id.as_str()) != excluding)
            .any(|g| g.id == key || g.name == key)
    }

    /// Sum of `kind` thresholds across groups, optionally leaving one out
    pub fn allocation(&self, kind: ResourceKind, excluding: Option<&str>) -> f64 {
        self.groups
            .values()
            .filter(|g| Some(g.id.as_str()) != excluding)
            .filter_map(|g| g.limit(kind))
            .sum()
    }

    pub fn upsert(&mut self, group: ResourceGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn remove(&mut self, id: &str) -> Option<ResourceGroup> {
        self.pending_deletion.remove(id);
        self.groups.remove(id)
    }

    pub fn mark_pending_deletion(&mut self, id: &str) -> bool {
        self.groups.contains_key(id) && self.pending_deletion.insert(id.to_string())
    }

    pub fn is_pending_deletion(&self, id: &str) -> bool {
        self.pending_deletion.contains(id)
    }

    pub fn pending_deletion(&self) -> impl Iterator<Item = &String> {
        self.pending_deletion.iter()
    }
}

/// A state transition proposed against the committed table
pub type Mutation = Box<dyn FnOnce(&GroupTable) -> GovernanceResult<GroupTable> + Send>;

/// Completion callbacks for a proposed mutation
pub trait MutationListener: Send {
    fn on_success(self: Box<Self>, committed: Arc<GroupTable>);

    fn on_failure(self: Box<Self>, error: GovernanceError);
}

/// Single-writer, linearizable store of the group table
pub trait ClusterStateStore: Send + Sync {
    /// Last fully committed table
    fn state(&self) -> Arc<GroupTable>;

    /// Queue a mutation; the listener is invoked exactly once with the outcome
    fn propose_mutation(&self, source: &str, mutation: Mutation, listener: Box<dyn MutationListener>);
}

struct Proposal {
    source: String,
    mutation: Mutation,
    listener: Box<dyn MutationListener>,
}

/// In-process store backed by a dedicated writer task
pub struct InMemoryClusterStateStore {
    committed: Arc<RwLock<Arc<GroupTable>>>,
    proposals: mpsc::UnboundedSender<Proposal>,
}

impl InMemoryClusterStateStore {
    /// Spawn the writer task on the current tokio runtime with an empty table
    pub fn spawn() -> Arc<Self> {
        Self::spawn_with(GroupTable::default())
    }

    /// Spawn the writer task starting from an existing table
    pub fn spawn_with(initial: GroupTable) -> Arc<Self> {
        let committed = Arc::new(RwLock::new(Arc::new(initial)));
        let (proposals, rx) = mpsc::unbounded_channel();

        tokio::spawn(apply_proposals(committed.clone(), rx));

        Arc::new(Self {
            committed,
            proposals,
        })
    }
}

impl ClusterStateStore for InMemoryClusterStateStore {
    fn state(&self) -> Arc<GroupTable> {
        read_committed(&self.committed)
    }

    fn propose_mutation(&self, source: &str, mutation: Mutation, listener: Box<dyn MutationListener>) {
        let proposal = Proposal {
            source: source.to_string(),
            mutation,
            listener,
        };

        if let Err(mpsc::error::SendError(proposal)) = self.proposals.send(proposal) {
            warn!(source = %proposal.source, "Cluster state writer stopped, dropping proposal");
            proposal.listener.on_failure(GovernanceError::MutationConflict(
                "cluster state writer is not running".to_string(),
            ));
        }
    }
}

fn read_committed(committed: &RwLock<Arc<GroupTable>>) -> Arc<GroupTable> {
    match committed.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Writer loop: applies one proposal at a time in submission order
async fn apply_proposals(
    committed: Arc<RwLock<Arc<GroupTable>>>,
    mut rx: mpsc::UnboundedReceiver<Proposal>,
) {
    while let Some(proposal) = rx.recv().await {
        let current = read_committed(&committed);

        match (proposal.mutation)(&current) {
            Ok(mut next) => {
                next.version = current.version + 1;
                let next = Arc::new(next);
                {
                    let mut guard = match committed.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *guard = next.clone();
                }
                debug!(source = %proposal.source, version = next.version, "Committed group table");
                proposal.listener.on_success(next);
            }
            Err(e) => {
                debug!(source = %proposal.source, error = %e, "Mutation rejected");
                proposal.listener.on_failure(e);
            }
        }
    }

    debug!("Cluster state writer stopped");
}
