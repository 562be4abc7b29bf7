use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from caller input, rejecting `end <= start`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Saturates at `Ms::MAX` for spans wider than `i64` can express.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Boundary-equal spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Unknown enum label coming from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Enum <-> lowercase label, case-insensitive on parse.
macro_rules! labelled_enum {
    ($name:ident, $field:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { field: $field, value: s.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceStatus {
    #[default]
    Available,
    Maintenance,
    Retired,
}

labelled_enum!(ResourceStatus, "resource status", {
    Available => "available",
    Maintenance => "maintenance",
    Retired => "retired",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    Active,
    Completed,
    Cancelled,
}

labelled_enum!(ProjectStatus, "project status", {
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationStatus {
    #[default]
    Active,
    Completed,
    Cancelled,
}

labelled_enum!(AllocationStatus, "allocation status", {
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// How strongly a maintenance window forbids use of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaintenanceKind {
    /// Resource unusable; same weight as an allocation conflict.
    #[default]
    Hard,
    /// Use discouraged, not forbidden.
    Soft,
}

labelled_enum!(MaintenanceKind, "maintenance type", {
    Hard => "hard",
    Soft => "soft",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    Admin,
    #[default]
    User,
}

labelled_enum!(Role, "role", {
    Admin => "admin",
    User => "user",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
}

labelled_enum!(UserStatus, "user status", {
    Active => "active",
    Disabled => "disabled",
});

// ── Catalog records ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub category_id: Option<Ulid>,
    pub status: ResourceStatus,
    pub description: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Ulid,
    pub name: String,
    pub manager: Option<String>,
    pub status: ProjectStatus,
    pub description: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub password: String,
    pub role: Role,
    pub status: UserStatus,
}

/// What the rest of the system learns about a logged-in caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
}

// ── Intervals ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Ulid,
    pub span: Span,
    pub status: AllocationStatus,
    pub note: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub kind: MaintenanceKind,
    pub reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Insert keeping the list sorted by `span.start`; equal starts keep insertion order.
fn insert_sorted<T>(items: &mut Vec<T>, item: T, start: impl Fn(&T) -> Ms) {
    let key = start(&item);
    let pos = items.partition_point(|i| start(i) <= key);
    items.insert(pos, item);
}

/// Items in a start-sorted list whose span overlaps `query`.
/// Everything at index >= the right bound starts at or after `query.end`.
fn overlapping_in<'a, T>(
    items: &'a [T],
    query: &Span,
    span: impl Fn(&T) -> &Span + Copy + 'a,
) -> impl Iterator<Item = &'a T> + 'a {
    let right_bound = items.partition_point(|i| span(i).start < query.end);
    let query_start = query.start;
    items[..right_bound]
        .iter()
        .filter(move |i| span(*i).end > query_start)
}

/// One resource plus every interval committed against it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Allocations in every status, sorted by `span.start`.
    pub allocations: Vec<Allocation>,
    /// Maintenance windows, sorted by `span.start`.
    pub windows: Vec<MaintenanceWindow>,
    /// Set under the write lock when the resource is removed from the catalog.
    /// Holders of a stale `Arc` must treat the resource as gone.
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            allocations: Vec::new(),
            windows: Vec::new(),
            deleted: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.resource.id
    }

    pub fn interval_count(&self) -> usize {
        self.allocations.len() + self.windows.len()
    }

    pub fn insert_allocation(&mut self, allocation: Allocation) {
        insert_sorted(&mut self.allocations, allocation, |a| a.span.start);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn allocation(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    pub fn allocation_mut(&mut self, id: Ulid) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == id)
    }

    pub fn insert_window(&mut self, window: MaintenanceWindow) {
        insert_sorted(&mut self.windows, window, |w| w.span.start);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<MaintenanceWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window(&self, id: Ulid) -> Option<&MaintenanceWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    /// ACTIVE allocations overlapping `query`, optionally skipping one id.
    pub fn active_allocations_overlapping<'a>(
        &'a self,
        query: &Span,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Allocation> + 'a {
        overlapping_in(&self.allocations, query, |a: &Allocation| &a.span)
            .filter(move |a| a.is_active() && Some(a.id) != exclude)
    }

    pub fn windows_overlapping<'a>(
        &'a self,
        query: &Span,
    ) -> impl Iterator<Item = &'a MaintenanceWindow> + 'a {
        overlapping_in(&self.windows, query, |w: &MaintenanceWindow| &w.span)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryCreated { category: Category },
    CategoryUpdated { category: Category },
    CategoryDeleted { id: Ulid },
    ResourceCreated { resource: Resource },
    ResourceUpdated { resource: Resource },
    ResourceDeleted { id: Ulid },
    ProjectCreated { project: Project },
    ProjectUpdated { project: Project },
    ProjectDeleted { id: Ulid },
    UserCreated { user: User },
    UserUpdated { user: User },
    AllocationCreated {
        allocation: Allocation,
    },
    /// `previous_resource_id` differs from `allocation.resource_id` when the
    /// allocation moved to another resource.
    AllocationUpdated {
        allocation: Allocation,
        previous_resource_id: Ulid,
    },
    AllocationCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    AllocationDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    MaintenanceCreated {
        window: MaintenanceWindow,
    },
    MaintenanceUpdated {
        window: MaintenanceWindow,
        previous_resource_id: Ulid,
    },
    MaintenanceDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Derived, never persisted ─────────────────────────────────────

/// Outcome of a conflict check. Ordered so the dominance rule is `max`:
/// `None < Soft < Hard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    #[default]
    None,
    Soft,
    Hard,
}

labelled_enum!(Severity, "severity", {
    None => "none",
    Soft => "soft",
    Hard => "hard",
});

impl From<MaintenanceKind> for Severity {
    fn from(kind: MaintenanceKind) -> Self {
        match kind {
            MaintenanceKind::Hard => Severity::Hard,
            MaintenanceKind::Soft => Severity::Soft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Allocation,
    Maintenance,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Allocation => "allocation",
            ScheduleKind::Maintenance => "maintenance",
        }
    }
}

/// One row of a resource timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleItem {
    pub kind: ScheduleKind,
    pub severity: Severity,
    pub span: Span,
    pub label: String,
    pub reference_id: Ulid,
}
