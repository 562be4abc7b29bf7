use ulid::Ulid;

use crate::model::*;

/// Overlaps found for a candidate span and the severity they add up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    /// ACTIVE allocations overlapping the candidate.
    pub allocations: Vec<Ulid>,
    /// Maintenance windows overlapping the candidate.
    pub windows: Vec<(Ulid, MaintenanceKind)>,
}

/// Answer to a pre-flight conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub severity: Severity,
    pub message: String,
}

impl From<Severity> for ConflictReport {
    fn from(severity: Severity) -> Self {
        Self {
            has_conflict: severity != Severity::None,
            severity,
            message: conflict_message(severity).to_string(),
        }
    }
}

pub fn conflict_message(severity: Severity) -> &'static str {
    match severity {
        Severity::Hard => {
            "resource is already allocated or under hard maintenance during this span; it cannot be allocated"
        }
        Severity::Soft => "span overlaps advisory maintenance; the allocation may still be submitted",
        Severity::None => "resource is available",
    }
}

/// Dominance rule over raw overlap results. Any allocation overlap is HARD;
/// each maintenance window contributes its own kind; the strongest wins.
pub fn severity_of<I>(allocation_overlaps: usize, maintenance_kinds: I) -> Severity
where
    I: IntoIterator<Item = MaintenanceKind>,
{
    let base = if allocation_overlaps > 0 {
        Severity::Hard
    } else {
        Severity::None
    };
    maintenance_kinds
        .into_iter()
        .map(Severity::from)
        .fold(base, Severity::max)
}

/// Classify `span` against everything committed on `rs`.
///
/// Pure read: the caller decides what to do with the result and is expected
/// to hold the resource's allocation lock when the answer gates a write.
pub fn classify(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Classification {
    let allocations: Vec<Ulid> = rs
        .active_allocations_overlapping(span, exclude)
        .map(|a| a.id)
        .collect();
    let windows: Vec<(Ulid, MaintenanceKind)> = rs
        .windows_overlapping(span)
        .map(|w| (w.id, w.kind))
        .collect();
    let severity = severity_of(allocations.len(), windows.iter().map(|(_, kind)| *kind));
    Classification {
        severity,
        allocations,
        windows,
    }
}
