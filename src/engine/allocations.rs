use tokio::sync::{OwnedMutexGuard, OwnedRwLockWriteGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::classify::{classify, Classification, ConflictReport};
use super::validate::{now_ms, validate_span, validate_text};
use super::{Engine, EngineError};

/// Fields an allocation update may change. `None` keeps the current value;
/// `note: Some(None)` clears the note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationChanges {
    pub resource_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub note: Option<Option<String>>,
}

/// A committed allocation and the severity it was admitted with.
/// `Severity::Soft` means the caller should surface a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub allocation: Allocation,
    pub severity: Severity,
}

impl AllocationChanges {
    fn apply_to(&self, current: &Allocation, now: Ms) -> Result<Allocation, EngineError> {
        let span = validate_span(
            self.start.unwrap_or(current.span.start),
            self.end.unwrap_or(current.span.end),
        )?;
        let note = match &self.note {
            Some(note) => note.clone(),
            None => current.note.clone(),
        };
        Ok(Allocation {
            id: current.id,
            resource_id: self.resource_id.unwrap_or(current.resource_id),
            project_id: self.project_id.unwrap_or(current.project_id),
            span,
            status: current.status,
            note,
            created_at: current.created_at,
            updated_at: now,
        })
    }
}

impl Engine {
    /// Turn a classification into admit/reject. HARD is an expected outcome
    /// and is logged at info, never error.
    fn admit(
        &self,
        resource_id: Ulid,
        span: Span,
        c: &Classification,
    ) -> Result<Severity, EngineError> {
        debug!(
            "classified {span} on {resource_id}: {} ({} allocation overlaps, {} maintenance overlaps)",
            c.severity,
            c.allocations.len(),
            c.windows.len()
        );
        metrics::counter!(observability::ALLOCATION_DECISIONS_TOTAL, "severity" => c.severity.as_str())
            .increment(1);
        match c.severity {
            Severity::Hard => {
                info!("allocation on {resource_id} rejected: {span} conflicts");
                Err(EngineError::Conflict { resource_id, span })
            }
            Severity::Soft => {
                warn!("allocation on {resource_id} over {span} overlaps soft maintenance");
                Ok(Severity::Soft)
            }
            Severity::None => Ok(Severity::None),
        }
    }

    fn require_project(&self, project_id: Ulid) -> Result<(), EngineError> {
        if self.projects.contains_key(&project_id) {
            Ok(())
        } else {
            Err(EngineError::not_found("project", project_id))
        }
    }

    pub async fn create_allocation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        project_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    ) -> Result<AllocationOutcome, EngineError> {
        let span = validate_span(start, end)?;
        validate_text(note.as_deref())?;

        let _catalog = self.catalog_lock.read().await;
        let (_lock, rs) = self
            .lock_resource(resource_id)
            .await
            .ok_or_else(|| EngineError::not_found("resource", resource_id))?;
        self.require_project(project_id)?;
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::not_found("resource", resource_id));
        }
        if guard.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        let severity = self.admit(resource_id, span, &classify(&guard, &span, None))?;

        let now = now_ms();
        let allocation = Allocation {
            id,
            resource_id,
            project_id,
            span,
            status: AllocationStatus::Active,
            note,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AllocationCreated {
            allocation: allocation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("allocation {id} created on {resource_id} for project {project_id} {span}");
        Ok(AllocationOutcome {
            allocation,
            severity,
        })
    }

    /// Re-validate and re-classify an existing allocation. The allocation's own
    /// interval never conflicts with itself. A rejected update leaves the record untouched.
    pub async fn update_allocation(
        &self,
        id: Ulid,
        changes: AllocationChanges,
    ) -> Result<AllocationOutcome, EngineError> {
        if let Some(note) = &changes.note {
            validate_text(note.as_deref())?;
        }
        let _catalog = self.catalog_lock.read().await;

        loop {
            let old_rid = self
                .get_resource_for_entity(&id)
                .ok_or_else(|| EngineError::not_found("allocation", id))?;
            let new_rid = changes.resource_id.unwrap_or(old_rid);

            let mut lock_order = vec![old_rid, new_rid];
            lock_order.sort();
            lock_order.dedup();
            let mut held = Vec::with_capacity(lock_order.len());
            for rid in lock_order {
                let locked = self
                    .lock_resource(rid)
                    .await
                    .ok_or_else(|| EngineError::not_found("resource", rid))?;
                held.push(locked);
            }
            // Another update may have moved it while we waited.
            if self.get_resource_for_entity(&id) != Some(old_rid) {
                continue;
            }
            let old_rs = self
                .get_resource(&old_rid)
                .ok_or_else(|| EngineError::not_found("allocation", id))?;

            if old_rid == new_rid {
                let mut guard = old_rs.write().await;
                let current = guard
                    .allocation(id)
                    .cloned()
                    .ok_or_else(|| EngineError::not_found("allocation", id))?;
                let updated = changes.apply_to(&current, now_ms())?;
                self.require_project(updated.project_id)?;
                let severity =
                    self.admit(new_rid, updated.span, &classify(&guard, &updated.span, Some(id)))?;
                let event = Event::AllocationUpdated {
                    allocation: updated.clone(),
                    previous_resource_id: old_rid,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                info!("allocation {id} updated on {new_rid} {}", updated.span);
                return Ok(AllocationOutcome {
                    allocation: updated,
                    severity,
                });
            }

            let new_rs = self
                .get_resource(&new_rid)
                .ok_or_else(|| EngineError::not_found("resource", new_rid))?;
            let (mut from, mut to) = Self::write_pair(&old_rs, old_rid, &new_rs, new_rid).await;
            if to.deleted {
                return Err(EngineError::not_found("resource", new_rid));
            }
            let current = from
                .allocation(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("allocation", id))?;
            let updated = changes.apply_to(&current, now_ms())?;
            self.require_project(updated.project_id)?;
            if to.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many intervals on resource"));
            }
            let severity =
                self.admit(new_rid, updated.span, &classify(&to, &updated.span, Some(id)))?;
            let event = Event::AllocationUpdated {
                allocation: updated.clone(),
                previous_resource_id: old_rid,
            };
            self.persist_and_apply_moved(&mut from, &mut to, &event).await?;
            info!("allocation {id} moved from {old_rid} to {new_rid} {}", updated.span);
            return Ok(AllocationOutcome {
                allocation: updated,
                severity,
            });
        }
    }

    /// Hold the resource lock and write lock of the resource that owns `id`.
    async fn lock_allocation(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<()>, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        loop {
            let rid = self
                .get_resource_for_entity(&id)
                .ok_or_else(|| EngineError::not_found("allocation", id))?;
            let (lock, rs) = self
                .lock_resource(rid)
                .await
                .ok_or_else(|| EngineError::not_found("allocation", id))?;
            let guard = rs.write_owned().await;
            if guard.allocation(id).is_some() {
                return Ok((lock, guard));
            }
            if self.get_resource_for_entity(&id) == Some(rid) {
                // Mapped here but not an allocation: a maintenance window id.
                return Err(EngineError::not_found("allocation", id));
            }
        }
    }

    /// Status becomes CANCELLED; interval and other fields stay as they were.
    pub async fn cancel_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let (_lock, mut guard) = self.lock_allocation(id).await?;
        let resource_id = guard.id();
        let event = Event::AllocationCancelled {
            id,
            resource_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("allocation {id} on {resource_id} cancelled");
        guard
            .allocation(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("allocation", id))
    }

    /// Hard delete. Returns whether a row was removed; an unknown id is not an error.
    pub async fn delete_allocation(&self, id: Ulid) -> Result<bool, EngineError> {
        let (_lock, mut guard) = match self.lock_allocation(id).await {
            Ok(held) => held,
            Err(EngineError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let resource_id = guard.id();
        let event = Event::AllocationDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("allocation {id} on {resource_id} deleted");
        Ok(true)
    }

    /// Read-only pre-flight check, same classification as create.
    /// Bounds are validated exactly as create validates them, so a span create
    /// would refuse (inverted, outside 2000..2200, too wide) fails here with
    /// the same error. An unknown resource has nothing to conflict with.
    pub async fn check_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<ConflictReport, EngineError> {
        let span = validate_span(start, end)?;
        let severity = match self.get_resource(&resource_id) {
            Some(rs) => {
                let guard = rs.read().await;
                classify(&guard, &span, None).severity
            }
            None => Severity::None,
        };
        debug!("conflict check on {resource_id} {span}: {severity}");
        metrics::counter!(observability::CONFLICT_CHECKS_TOTAL, "severity" => severity.as_str())
            .increment(1);
        Ok(ConflictReport::from(severity))
    }

    async fn collect_allocations(&self, keep: impl Fn(&Allocation) -> bool) -> Vec<Allocation> {
        let states: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(guard.allocations.iter().filter(|a| keep(a)).cloned());
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        out
    }

    pub async fn list_allocations(&self) -> Vec<Allocation> {
        self.collect_allocations(|_| true).await
    }

    pub async fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let not_found = || EngineError::not_found("allocation", id);
        let rid = self.get_resource_for_entity(&id).ok_or_else(not_found)?;
        let rs = self.get_resource(&rid).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard.allocation(id).cloned().ok_or_else(not_found)
    }

    pub async fn list_allocations_by_resource(&self, resource_id: Ulid) -> Vec<Allocation> {
        match self.get_resource(&resource_id) {
            Some(rs) => rs.read().await.allocations.clone(),
            None => Vec::new(),
        }
    }

    pub async fn list_allocations_by_project(&self, project_id: Ulid) -> Vec<Allocation> {
        self.collect_allocations(|a| a.project_id == project_id).await
    }
}
