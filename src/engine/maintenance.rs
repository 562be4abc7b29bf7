use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{now_ms, validate_query_window, validate_span, validate_text};
use super::{Engine, EngineError};

/// Fields a maintenance update may change. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceChanges {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub kind: Option<MaintenanceKind>,
    pub reason: Option<Option<String>>,
}

/// Listing filter. With both bounds only windows overlapping `[start, end)`
/// match; a single bound cuts one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceFilter {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl MaintenanceFilter {
    fn matches(&self, w: &MaintenanceWindow) -> bool {
        self.start.is_none_or(|s| w.span.end > s) && self.end.is_none_or(|e| w.span.start < e)
    }
}

/// Overlapping live allocations are reported, never refused: maintenance is
/// authoritative and the allocation side yields on its next write.
fn note_overlaps(rs: &ResourceState, window: &MaintenanceWindow) {
    let overlapping = rs.active_allocations_overlapping(&window.span, None).count();
    if overlapping > 0 {
        info!(
            "{} maintenance {} on {} covers {overlapping} active allocations",
            window.kind,
            window.id,
            rs.id()
        );
    }
}

impl Engine {
    /// Maintenance writes take only the resource's state lock, never the
    /// allocation lock, and never check conflicts.
    pub async fn create_maintenance(
        &self,
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        kind: Option<MaintenanceKind>,
        reason: Option<String>,
    ) -> Result<MaintenanceWindow, EngineError> {
        let span = validate_span(start, end)?;
        validate_text(reason.as_deref())?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or_else(|| EngineError::not_found("resource", resource_id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::not_found("resource", resource_id));
        }
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }

        let now = now_ms();
        let window = MaintenanceWindow {
            id,
            resource_id,
            span,
            kind: kind.unwrap_or_default(),
            reason,
            created_at: now,
            updated_at: now,
        };
        note_overlaps(&guard, &window);
        let event = Event::MaintenanceCreated {
            window: window.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("{} maintenance {id} declared on {resource_id} {span}", window.kind);
        Ok(window)
    }

    pub async fn update_maintenance(
        &self,
        id: Ulid,
        changes: MaintenanceChanges,
    ) -> Result<MaintenanceWindow, EngineError> {
        if let Some(reason) = &changes.reason {
            validate_text(reason.as_deref())?;
        }
        loop {
            let old_rid = self
                .get_resource_for_entity(&id)
                .ok_or_else(|| EngineError::not_found("maintenance window", id))?;
            let new_rid = changes.resource_id.unwrap_or(old_rid);
            let old_rs = self
                .get_resource(&old_rid)
                .ok_or_else(|| EngineError::not_found("maintenance window", id))?;

            let (mut from, mut to): (_, Option<OwnedRwLockWriteGuard<ResourceState>>) =
                if old_rid == new_rid {
                    (old_rs.write_owned().await, None)
                } else {
                    let new_rs = self
                        .get_resource(&new_rid)
                        .ok_or_else(|| EngineError::not_found("resource", new_rid))?;
                    let (a, b) = Self::write_pair(&old_rs, old_rid, &new_rs, new_rid).await;
                    (a, Some(b))
                };

            let Some(current) = from.window(id).cloned() else {
                if self.get_resource_for_entity(&id) == Some(old_rid) {
                    return Err(EngineError::not_found("maintenance window", id));
                }
                continue;
            };
            let span = validate_span(
                changes.start.unwrap_or(current.span.start),
                changes.end.unwrap_or(current.span.end),
            )?;
            let window = MaintenanceWindow {
                id,
                resource_id: new_rid,
                span,
                kind: changes.kind.unwrap_or(current.kind),
                reason: match &changes.reason {
                    Some(reason) => reason.clone(),
                    None => current.reason.clone(),
                },
                created_at: current.created_at,
                updated_at: now_ms(),
            };
            let event = Event::MaintenanceUpdated {
                window: window.clone(),
                previous_resource_id: old_rid,
            };

            match to.as_mut() {
                None => {
                    note_overlaps(&from, &window);
                    self.persist_and_apply(&mut from, &event).await?;
                }
                Some(to) => {
                    if to.deleted {
                        return Err(EngineError::not_found("resource", new_rid));
                    }
                    if to.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
                        return Err(EngineError::LimitExceeded("too many intervals on resource"));
                    }
                    note_overlaps(&**to, &window);
                    self.persist_and_apply_moved(&mut from, &mut **to, &event).await?;
                }
            }
            info!("maintenance {id} updated on {new_rid} {span}");
            return Ok(window);
        }
    }

    /// Returns whether a row was removed; an unknown id is not an error.
    pub async fn delete_maintenance(&self, id: Ulid) -> Result<bool, EngineError> {
        loop {
            let Some(rid) = self.get_resource_for_entity(&id) else {
                return Ok(false);
            };
            let Some(rs) = self.get_resource(&rid) else {
                return Ok(false);
            };
            let mut guard = rs.write().await;
            if guard.window(id).is_none() {
                if self.get_resource_for_entity(&id) == Some(rid) {
                    return Ok(false);
                }
                continue;
            }
            let event = Event::MaintenanceDeleted {
                id,
                resource_id: rid,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("maintenance {id} on {rid} deleted");
            return Ok(true);
        }
    }

    pub async fn get_maintenance(&self, id: Ulid) -> Result<MaintenanceWindow, EngineError> {
        let not_found = || EngineError::not_found("maintenance window", id);
        let rid = self.get_resource_for_entity(&id).ok_or_else(not_found)?;
        let rs = self.get_resource(&rid).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard.window(id).cloned().ok_or_else(not_found)
    }

    /// Windows matching the filter, ordered by start. An unknown resource lists nothing.
    pub async fn list_maintenance(
        &self,
        filter: MaintenanceFilter,
    ) -> Result<Vec<MaintenanceWindow>, EngineError> {
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            validate_query_window(start, end)?;
        }
        let states: Vec<_> = match filter.resource_id {
            Some(rid) => self.get_resource(&rid).into_iter().collect(),
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(guard.windows.iter().filter(|w| filter.matches(w)).cloned());
        }
        out.sort_by_key(|w| (w.span.start, w.id));
        Ok(out)
    }
}
