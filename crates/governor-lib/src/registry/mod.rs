//! Cluster-wide registry of resource group definitions
//!
//! Every create, update and delete is turned into a [`Mutation`] and
//! committed through the [`ClusterStateStore`], so the store's single writer
//! is the only place the table ever changes. Validation happens twice: once
//! against the committed table for a fast answer, and again inside the
//! mutation against the table it is actually applied to.
//!
//! Creates reserve a slot in an in-flight counter before proposing. The
//! reservation is released when the mutation is applied (before the new
//! table is published) or when the proposal fails, whichever comes first.
//! Capacity checks read the committed table before the counter, so a
//! create is never counted both as committed and as in flight.

mod store;
mod validation;

pub use store::{ClusterStateStore, GroupTable, InMemoryClusterStateStore, Mutation, MutationListener};
pub use validation::{
    check_allocation, validate_definition, validate_name, validate_threshold, validate_update,
    MAX_NAME_LENGTH,
};

use crate::config::ConfigHandle;
use crate::error::{GovernanceError, GovernanceResult};
use crate::health::{components, HealthRegistry};
use crate::models::{GroupDefinition, GroupUpdate, ResourceGroup};
use crate::observability::StructuredLogger;
use crate::tracking::TaskSource;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One in-flight create counted against the group limit
struct Reservation {
    counter: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl Reservation {
    /// Take a slot; returns the reservation and the number held before it
    fn acquire(counter: &Arc<AtomicUsize>) -> (Arc<Self>, usize) {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        let reservation = Arc::new(Self {
            counter: counter.clone(),
            released: AtomicBool::new(false),
        });
        (reservation, previous)
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bridges store callbacks back to the awaiting caller
struct CommitListener {
    responder: oneshot::Sender<GovernanceResult<Arc<GroupTable>>>,
    reservation: Option<Arc<Reservation>>,
}

impl MutationListener for CommitListener {
    fn on_success(self: Box<Self>, committed: Arc<GroupTable>) {
        if let Some(reservation) = &self.reservation {
            reservation.release();
        }
        let _ = self.responder.send(Ok(committed));
    }

    fn on_failure(self: Box<Self>, error: GovernanceError) {
        if let Some(reservation) = &self.reservation {
            reservation.release();
        }
        let _ = self.responder.send(Err(error));
    }
}

/// Registry of resource groups with create/get/update/delete semantics
pub struct GroupRegistry {
    store: Arc<dyn ClusterStateStore>,
    tasks: Arc<dyn TaskSource>,
    config: ConfigHandle,
    in_flight: Arc<AtomicUsize>,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl GroupRegistry {
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        tasks: Arc<dyn TaskSource>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            tasks,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            logger: StructuredLogger::default(),
            health: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Report commit outcomes as `cluster_state` health and task-count
    /// failures as `registry` health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Validate and commit a new group
    pub async fn create(&self, def: GroupDefinition) -> GovernanceResult<ResourceGroup> {
        let now = now_millis();
        validate_definition(&def, now)?;

        let group = ResourceGroup {
            id: def
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: def.name.clone(),
            mode: def.mode,
            resource_limits: def.resource_limits.clone(),
            updated_at_millis: def.updated_at_millis.unwrap_or(now),
        };
        let max_groups = self.config.current().max_groups;

        let committed = self.store.state();
        check_create(&committed, &group, max_groups)?;

        let (reservation, pending) = Reservation::acquire(&self.in_flight);
        if committed.len() + pending + 1 > max_groups {
            reservation.release();
            debug!(name = %group.name, pending, "Rejecting create, group limit reached");
            return Err(GovernanceError::CapacityExceeded { max: max_groups });
        }

        let id = group.id.clone();
        let applied = reservation.clone();
        let mutation: Mutation = Box::new(move |table: &GroupTable| {
            applied.release();
            check_create(table, &group, max_groups)?;
            let mut next = table.clone();
            next.upsert(group);
            Ok(next)
        });

        let committed = self
            .propose("create-resource-group", mutation, Some(reservation))
            .await?;
        let created = committed
            .get(&id)
            .cloned()
            .ok_or_else(|| GovernanceError::NotFound(id.clone()))?;

        self.logger.log_group_created(&created);
        Ok(created)
    }

    /// Groups matching `name_or_id`, or every group when it is absent or empty
    pub fn get(&self, name_or_id: Option<&str>) -> Vec<ResourceGroup> {
        let table = self.store.state();
        match name_or_id.filter(|s| !s.is_empty()) {
            None => table.groups().cloned().collect(),
            Some(key) => table.find(key).cloned().into_iter().collect(),
        }
    }

    /// Every group currently in the committed table, pending ones included
    pub fn live_groups(&self) -> Vec<ResourceGroup> {
        self.get(None)
    }

    pub fn is_pending_deletion(&self, id: &str) -> bool {
        self.store.state().is_pending_deletion(id)
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.store.state().pending_deletion().count()
    }

    /// Number of creates currently holding a reservation
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Apply the supplied fields of `update` to the group with `id`
    pub async fn update(&self, id: &str, update: GroupUpdate) -> GovernanceResult<ResourceGroup> {
        let now = now_millis();
        validate_update(&update, now)?;

        let committed = self.store.state();
        apply_update(&committed, id, &update, now)?;

        let target = id.to_string();
        let mutation: Mutation = Box::new(move |table: &GroupTable| {
            let updated = apply_update(table, &target, &update, now)?;
            let mut next = table.clone();
            next.upsert(updated);
            Ok(next)
        });

        let committed = self.propose("update-resource-group", mutation, None).await?;
        let updated = committed
            .get(id)
            .cloned()
            .ok_or_else(|| GovernanceError::NotFound(id.to_string()))?;

        self.logger.log_group_updated(&updated);
        Ok(updated)
    }

    /// Delete one group by name or id, or every group when absent or empty.
    ///
    /// Groups that still have unfinished tasks are only marked for deletion
    /// and stay visible until a later prune removes them.
    pub async fn delete(&self, name_or_id: Option<&str>) -> GovernanceResult<Vec<ResourceGroup>> {
        let committed = self.store.state();
        let key = name_or_id.filter(|s| !s.is_empty()).map(str::to_string);

        let targets: Vec<ResourceGroup> = match &key {
            None => committed.groups().cloned().collect(),
            Some(k) => vec![committed
                .find(k)
                .cloned()
                .ok_or_else(|| GovernanceError::NotFound(k.clone()))?],
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut purge = HashSet::new();
        let mut defer = HashSet::new();
        for group in &targets {
            if self.has_tasks(&group.id).await {
                defer.insert(group.id.clone());
            } else {
                purge.insert(group.id.clone());
            }
        }

        let explicit = key.clone();
        let mutation: Mutation = Box::new(move |table: &GroupTable| {
            if let Some(k) = &explicit {
                if table.find(k).is_none() {
                    return Err(GovernanceError::NotFound(k.clone()));
                }
            }
            let mut next = table.clone();
            for id in &purge {
                next.remove(id);
            }
            for id in &defer {
                next.mark_pending_deletion(id);
            }
            Ok(next)
        });

        let committed = self.propose("delete-resource-group", mutation, None).await?;

        for group in &targets {
            self.logger
                .log_group_deleted(group, committed.is_pending_deletion(&group.id));
        }
        Ok(targets)
    }

    /// Remove pending groups whose tasks have drained; returns their ids
    pub async fn prune_pending(&self) -> GovernanceResult<Vec<String>> {
        let pending: Vec<String> = self.store.state().pending_deletion().cloned().collect();

        let mut drained = Vec::new();
        for id in pending {
            if !self.has_tasks(&id).await {
                drained.push(id);
            }
        }
        if drained.is_empty() {
            return Ok(drained);
        }

        let ids = drained.clone();
        let mutation: Mutation = Box::new(move |table: &GroupTable| {
            let mut next = table.clone();
            for id in &ids {
                if next.is_pending_deletion(id) {
                    next.remove(id);
                }
            }
            Ok(next)
        });
        self.propose("prune-resource-groups", mutation, None).await?;

        info!(pruned = ?drained, "Pruned drained resource groups");
        Ok(drained)
    }

    async fn has_tasks(&self, group_id: &str) -> bool {
        match self.tasks.task_count(group_id).await {
            Ok(count) => {
                if let Some(health) = &self.health {
                    health.set_healthy(components::REGISTRY).await;
                }
                count > 0
            }
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "Could not count tasks, assuming busy");
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::REGISTRY, format!("task count failed: {}", e))
                        .await;
                }
                true
            }
        }
    }

    async fn propose(
        &self,
        source: &str,
        mutation: Mutation,
        reservation: Option<Arc<Reservation>>,
    ) -> GovernanceResult<Arc<GroupTable>> {
        let (responder, rx) = oneshot::channel();
        self.store.propose_mutation(
            source,
            mutation,
            Box::new(CommitListener {
                responder,
                reservation,
            }),
        );

        let outcome = rx.await.unwrap_or_else(|_| {
            Err(GovernanceError::MutationConflict(format!(
                "{} was dropped before completion",
                source
            )))
        });

        if let Some(health) = &self.health {
            match &outcome {
                Ok(_) => health.set_healthy(components::CLUSTER_STATE).await,
                Err(GovernanceError::MutationConflict(reason)) => {
                    health
                        .set_degraded(components::CLUSTER_STATE, reason.clone())
                        .await
                }
                Err(_) => {}
            }
        }
        outcome
    }
}

fn check_create(table: &GroupTable, group: &ResourceGroup, max_groups: usize) -> GovernanceResult<()> {
    if table.key_in_use(&group.name, None) {
        return Err(GovernanceError::DuplicateName(group.name.clone()));
    }
    if table.key_in_use(&group.id, None) {
        return Err(GovernanceError::InvalidDefinition(format!(
            "id '{}' is already in use",
            group.id
        )));
    }
    if table.len() >= max_groups {
        return Err(GovernanceError::CapacityExceeded { max: max_groups });
    }
    check_allocation(table, &group.resource_limits, None)
}

fn apply_update(
    table: &GroupTable,
    id: &str,
    update: &GroupUpdate,
    now: i64,
) -> GovernanceResult<ResourceGroup> {
    let mut group = table
        .get(id)
        .cloned()
        .ok_or_else(|| GovernanceError::NotFound(id.to_string()))?;

    if let Some(name) = &update.name {
        if table.key_in_use(name, Some(id)) {
            return Err(GovernanceError::DuplicateName(name.clone()));
        }
        group.name = name.clone();
    }
    if let Some(mode) = update.mode {
        group.mode = mode;
    }
    if let Some(limits) = &update.resource_limits {
        for (kind, threshold) in limits {
            group.resource_limits.insert(*kind, *threshold);
        }
        check_allocation(table, &group.resource_limits, Some(id))?;
    }
    group.updated_at_millis = update.updated_at_millis.unwrap_or(now);
    Ok(group)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
