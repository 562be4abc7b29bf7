use ulid::Ulid;

use crate::model::*;

use super::validate::validate_query_window;
use super::{Engine, EngineError};

const DEFAULT_MAINTENANCE_LABEL: &str = "maintenance window";

fn allocation_item(a: &Allocation) -> ScheduleItem {
    ScheduleItem {
        kind: ScheduleKind::Allocation,
        severity: Severity::Hard,
        span: a.span,
        label: format!("project {}", a.project_id),
        reference_id: a.id,
    }
}

fn maintenance_item(w: &MaintenanceWindow) -> ScheduleItem {
    let label = match w.reason.as_deref().map(str::trim) {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => DEFAULT_MAINTENANCE_LABEL.to_string(),
    };
    ScheduleItem {
        kind: ScheduleKind::Maintenance,
        severity: w.kind.into(),
        span: w.span,
        label,
        reference_id: w.id,
    }
}

/// Project allocations then windows into one timeline ordered by start.
/// The sort is stable: equal starts keep allocations before windows and
/// each side in input order. Nothing is classified here.
pub fn merge_schedule<'a>(
    allocations: impl IntoIterator<Item = &'a Allocation>,
    windows: impl IntoIterator<Item = &'a MaintenanceWindow>,
) -> Vec<ScheduleItem> {
    let mut items: Vec<ScheduleItem> = allocations
        .into_iter()
        .map(allocation_item)
        .chain(windows.into_iter().map(maintenance_item))
        .collect();
    items.sort_by_key(|item| item.span.start);
    items
}

impl Engine {
    /// ACTIVE allocations and maintenance windows of one resource that overlap
    /// `[start, end)`, as a single timeline.
    pub async fn get_schedule(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<ScheduleItem>, EngineError> {
        let window = validate_query_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or_else(|| EngineError::not_found("resource", resource_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::not_found("resource", resource_id));
        }
        Ok(merge_schedule(
            guard.active_allocations_overlapping(&window, None),
            guard.windows_overlapping(&window),
        ))
    }
}
