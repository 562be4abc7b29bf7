mod allocations;
mod catalog;
mod classify;
mod compaction;
mod error;
mod maintenance;
mod schedule;
mod validate;

pub use allocations::{AllocationChanges, AllocationOutcome};
pub use catalog::{CategoryChanges, NewUser, ProjectChanges, ResourceChanges, UserChanges};
pub use classify::{classify, conflict_message, severity_of, Classification, ConflictReport};
pub use error::EngineError;
pub use maintenance::{MaintenanceChanges, MaintenanceFilter};
pub use schedule::merge_schedule;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it and everything already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command found while draining ends the batch and runs after it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush of {} events failed: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride along with the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::stage_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// In-memory interval store plus catalog, backed by the WAL.
///
/// Lock order, outermost first: `catalog_lock`, per-resource allocation
/// mutexes (ascending id), per-resource state `RwLock`s (ascending id).
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// The resource lock that serializes allocation mutations per resource.
    pub(super) allocation_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) projects: DashMap<Ulid, Project>,
    pub(super) categories: DashMap<Ulid, Category>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) usernames: DashMap<String, Ulid>,
    /// Allocation or maintenance window id → owning resource id.
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    /// Write: catalog mutations and compaction. Read: allocation create/update,
    /// which must see referenced projects and resources stay put.
    pub(super) catalog_lock: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply an interval event to one resource (no locking, caller holds the lock).
///
/// Update events are applied to both the previous and the new owner: each side
/// drops its copy and only the new owner re-inserts.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AllocationCreated { allocation } => {
            entity_map.insert(allocation.id, allocation.resource_id);
            rs.insert_allocation(allocation.clone());
        }
        Event::AllocationUpdated { allocation, .. } => {
            rs.remove_allocation(allocation.id);
            if rs.id() == allocation.resource_id {
                entity_map.insert(allocation.id, allocation.resource_id);
                rs.insert_allocation(allocation.clone());
            }
        }
        Event::AllocationCancelled { id, at, .. } => {
            if let Some(a) = rs.allocation_mut(*id) {
                a.status = AllocationStatus::Cancelled;
                a.updated_at = *at;
            }
        }
        Event::AllocationDeleted { id, .. } => {
            rs.remove_allocation(*id);
            entity_map.remove(id);
        }
        Event::MaintenanceCreated { window } => {
            entity_map.insert(window.id, window.resource_id);
            rs.insert_window(window.clone());
        }
        Event::MaintenanceUpdated { window, .. } => {
            rs.remove_window(window.id);
            if rs.id() == window.resource_id {
                entity_map.insert(window.id, window.resource_id);
                rs.insert_window(window.clone());
            }
        }
        Event::MaintenanceDeleted { id, .. } => {
            rs.remove_window(*id);
            entity_map.remove(id);
        }
        Event::ResourceUpdated { resource } => {
            rs.resource = resource.clone();
        }
        Event::ResourceDeleted { .. } => {
            rs.deleted = true;
        }
        _ => {}
    }
}

/// Resources whose state an event touches. Catalog-only events touch none.
fn event_resource_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::AllocationCreated { allocation } => vec![allocation.resource_id],
        Event::AllocationUpdated {
            allocation,
            previous_resource_id,
        } => moved_pair(*previous_resource_id, allocation.resource_id),
        Event::MaintenanceCreated { window } => vec![window.resource_id],
        Event::MaintenanceUpdated {
            window,
            previous_resource_id,
        } => moved_pair(*previous_resource_id, window.resource_id),
        Event::AllocationCancelled { resource_id, .. }
        | Event::AllocationDeleted { resource_id, .. }
        | Event::MaintenanceDeleted { resource_id, .. } => vec![*resource_id],
        Event::ResourceUpdated { resource } => vec![resource.id],
        _ => Vec::new(),
    }
}

fn moved_pair(previous: Ulid, current: Ulid) -> Vec<Ulid> {
    if previous == current {
        vec![current]
    } else {
        vec![previous, current]
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            allocation_locks: DashMap::new(),
            projects: DashMap::new(),
            categories: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            entity_to_resource: DashMap::new(),
            catalog_lock: RwLock::new(()),
            wal_tx,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            engine.apply_catalog(event);
            for resource_id in event_resource_ids(event) {
                let Some(rs) = engine.get_resource(&resource_id) else {
                    tracing::warn!("replay: event for unknown resource {resource_id} skipped");
                    continue;
                };
                if let Ok(mut guard) = rs.try_write() {
                    apply_to_resource(&mut guard, event, &engine.entity_to_resource);
                }
            }
        }
        tracing::info!(
            "replayed {} WAL events: {} resources, {} projects, {} users",
            events.len(),
            engine.resources.len(),
            engine.projects.len(),
            engine.users.len()
        );

        Ok(engine)
    }

    /// Map-level effects of catalog events. Resource records inside
    /// `ResourceState` are updated by `apply_to_resource`.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::CategoryCreated { category } | Event::CategoryUpdated { category } => {
                self.categories.insert(category.id, category.clone());
            }
            Event::CategoryDeleted { id } => {
                self.categories.remove(id);
            }
            Event::ResourceCreated { resource } => {
                self.allocation_locks
                    .insert(resource.id, Arc::new(Mutex::new(())));
                self.resources.insert(
                    resource.id,
                    Arc::new(RwLock::new(ResourceState::new(resource.clone()))),
                );
            }
            Event::ResourceDeleted { id } => {
                if let Some((_, rs)) = self.resources.remove(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    guard.deleted = true;
                }
                self.allocation_locks.remove(id);
            }
            Event::ProjectCreated { project } | Event::ProjectUpdated { project } => {
                self.projects.insert(project.id, project.clone());
            }
            Event::ProjectDeleted { id } => {
                self.projects.remove(id);
            }
            Event::UserCreated { user } | Event::UserUpdated { user } => {
                if let Some(previous) = self.users.get(&user.id)
                    && previous.username != user.username
                {
                    self.usernames.remove(&previous.username);
                }
                self.usernames.insert(user.username.clone(), user.id);
                self.users.insert(user.id, user.clone());
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, while the caller holds the resource's write lock,
    /// so log order equals apply order.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        Ok(())
    }

    /// Same as `persist_and_apply` for an event that moves an interval between
    /// two resources. Both write locks must be held.
    pub(super) async fn persist_and_apply_moved(
        &self,
        from: &mut ResourceState,
        to: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(from, event, &self.entity_to_resource);
        apply_to_resource(to, event, &self.entity_to_resource);
        Ok(())
    }

    /// WAL-append then apply a catalog event. Caller holds `catalog_lock` for writing.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// Acquire the resource lock, then re-check the resource still exists.
    /// `None` means the resource is unknown or was deleted while waiting.
    pub(super) async fn lock_resource(
        &self,
        id: Ulid,
    ) -> Option<(OwnedMutexGuard<()>, SharedResourceState)> {
        let mutex = self.allocation_locks.get(&id).map(|m| m.value().clone())?;
        let guard = mutex.lock_owned().await;
        let rs = self.get_resource(&id)?;
        Some((guard, rs))
    }

    /// Write-lock two distinct resources in ascending id order.
    pub(super) async fn write_pair(
        a: &SharedResourceState,
        a_id: Ulid,
        b: &SharedResourceState,
        b_id: Ulid,
    ) -> (
        OwnedRwLockWriteGuard<ResourceState>,
        OwnedRwLockWriteGuard<ResourceState>,
    ) {
        if a_id < b_id {
            let ga = a.clone().write_owned().await;
            let gb = b.clone().write_owned().await;
            (ga, gb)
        } else {
            let gb = b.clone().write_owned().await;
            let ga = a.clone().write_owned().await;
            (ga, gb)
        }
    }
}
