use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Resources are addressed by their human label ("201", "Hall A").
pub type ResourceId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Builds a span without validation; the engine rejects `end <= start`
    /// with `InvalidInterval` before a span is ever stored.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Room,
    Hall,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Room => "room",
            ResourceKind::Hall => "hall",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "room" | "rooms" => Ok(ResourceKind::Room),
            "hall" | "halls" | "conference" => Ok(ResourceKind::Hall),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// A bookable room or conference hall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub capacity: u32,
    /// Floor or wing label, e.g. "Ground", "First".
    pub zone: String,
    /// Soft-retired resources keep their history but accept no new assignments.
    pub retired: bool,
    /// Set on check-out, cleared by housekeeping.
    pub needs_cleaning: bool,
}

impl Resource {
    pub fn new(id: impl Into<ResourceId>, kind: ResourceKind, capacity: u32, zone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity,
            zone: zone.into(),
            retired: false,
            needs_cleaning: false,
        }
    }

    pub fn room(id: impl Into<ResourceId>, capacity: u32, zone: impl Into<String>) -> Self {
        Self::new(id, ResourceKind::Room, capacity, zone)
    }

    pub fn hall(id: impl Into<ResourceId>, capacity: u32, zone: impl Into<String>) -> Self {
        Self::new(id, ResourceKind::Hall, capacity, zone)
    }
}

/// Reservation lifecycle. `Confirmed` and `CheckedIn` hold their resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Confirmed,
        Status::CheckedIn,
        Status::CheckedOut,
        Status::Cancelled,
    ];

    pub fn is_holding(&self) -> bool {
        match self {
            Status::Confirmed | Status::CheckedIn => true,
            Status::Pending | Status::CheckedOut | Status::Cancelled => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Status::CheckedOut | Status::Cancelled => true,
            Status::Pending | Status::Confirmed | Status::CheckedIn => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::CheckedIn => "checked-in",
            Status::CheckedOut => "checked-out",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(Status::Pending),
            "confirmed" => Ok(Status::Confirmed),
            "checked-in" => Ok(Status::CheckedIn),
            "checked-out" => Ok(Status::CheckedOut),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who the reservation is for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Guest {
    pub name: String,
    /// Phone number or other contact handle.
    pub contact: String,
    pub id_number: Option<String>,
    pub designation: Option<String>,
    pub department: Option<String>,
}

impl Guest {
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub guest: Guest,
    /// `None` while the request waits for a room.
    pub resource_id: Option<ResourceId>,
    pub span: Span,
    pub party_size: u32,
    pub status: Status,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    /// Shared by the room and hall halves of a combined booking.
    pub correlation_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub checked_in_at: Option<Ms>,
    pub checked_out_at: Option<Ms>,
}

impl Reservation {
    /// True when this reservation blocks its resource for `span`.
    pub fn holds(&self) -> bool {
        self.status.is_holding() && self.resource_id.is_some()
    }

    /// Fold a reservation event into this record. Events for other
    /// reservations and resource events are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } | Event::ReservationAmended { reservation }
                if reservation.id == self.id =>
            {
                *self = reservation.clone();
            }
            Event::ResourceAssigned { id, resource_id, at } if *id == self.id => {
                self.resource_id = Some(resource_id.clone());
                self.status = Status::Confirmed;
                self.updated_at = *at;
            }
            Event::CheckedIn { id, at } if *id == self.id => {
                self.status = Status::CheckedIn;
                self.checked_in_at = Some(*at);
                self.updated_at = *at;
            }
            Event::CheckedOut { id, at } if *id == self.id => {
                self.status = Status::CheckedOut;
                self.checked_out_at = Some(*at);
                self.updated_at = *at;
            }
            Event::Cancelled { id, at } if *id == self.id => {
                self.status = Status::Cancelled;
                self.updated_at = *at;
            }
            _ => {}
        }
    }
}

/// Input to `create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub guest: Guest,
    pub resource_id: Option<ResourceId>,
    pub span: Span,
    pub party_size: u32,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    pub correlation_id: Option<Ulid>,
}

impl ReservationDraft {
    pub fn new(guest: Guest, span: Span, party_size: u32) -> Self {
        Self {
            guest,
            resource_id: None,
            span,
            party_size,
            purpose: None,
            notes: None,
            correlation_id: None,
        }
    }

    pub fn on(mut self, resource_id: impl Into<ResourceId>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationPatch {
    pub guest_name: Option<String>,
    pub contact: Option<String>,
    pub resource_id: Option<ResourceId>,
    pub span: Option<Span>,
    pub party_size: Option<u32>,
    pub purpose: Option<String>,
    pub notes: Option<String>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        *self == ReservationPatch::default()
    }
}

/// Filter for reservation listings. All present fields must match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationFilter {
    pub status: Option<Status>,
    pub resource_id: Option<ResourceId>,
    /// Keep reservations whose span overlaps this window.
    pub window: Option<Span>,
}

/// One holding reservation in a resource's occupancy index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub reservation_id: Ulid,
    pub span: Span,
    pub status: Status,
}

impl Allocation {
    pub fn of(reservation: &Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            span: reservation.span,
            status: reservation.status,
        }
    }
}

/// A resource plus its holding allocations, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    pub allocations: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            allocations: Vec::new(),
        }
    }

    /// Insert allocation maintaining sort order by span.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .partition_point(|a| a.span.start <= allocation.span.start);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, reservation_id: Ulid) -> Option<Allocation> {
        let pos = self
            .allocations
            .iter()
            .position(|a| a.reservation_id == reservation_id)?;
        Some(self.allocations.remove(pos))
    }

    /// Allocations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// The allocation covering instant `t`, if any.
    pub fn covering(&self, t: Ms) -> Option<&Allocation> {
        self.overlapping(&Span::new(t, t + 1)).next()
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: ResourceId,
        kind: ResourceKind,
        capacity: u32,
        zone: String,
    },
    ResourceRetired {
        id: ResourceId,
    },
    ResourceCleaned {
        id: ResourceId,
    },
    /// Full resource snapshot, written by compaction.
    ResourceRestored {
        resource: Resource,
    },
    /// Also used by compaction to restore a reservation in any status.
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationAmended {
        reservation: Reservation,
    },
    ResourceAssigned {
        id: Ulid,
        resource_id: ResourceId,
        at: Ms,
    },
    CheckedIn {
        id: Ulid,
        at: Ms,
    },
    CheckedOut {
        id: Ulid,
        at: Ms,
    },
    Cancelled {
        id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// The reservation this event changes, if it is a reservation event.
    pub fn reservation_id(&self) -> Option<Ulid> {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationAmended { reservation } => {
                Some(reservation.id)
            }
            Event::ResourceAssigned { id, .. }
            | Event::CheckedIn { id, .. }
            | Event::CheckedOut { id, .. }
            | Event::Cancelled { id, .. } => Some(*id),
            Event::ResourceRegistered { .. }
            | Event::ResourceRetired { .. }
            | Event::ResourceCleaned { .. }
            | Event::ResourceRestored { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// What the room board shows for a resource at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardState {
    Available,
    Reserved,
    Occupied,
    Cleaning,
    Retired,
}

impl BoardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardState::Available => "available",
            BoardState::Reserved => "reserved",
            BoardState::Occupied => "occupied",
            BoardState::Cleaning => "cleaning",
            BoardState::Retired => "retired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardEntry {
    pub resource: Resource,
    pub state: BoardState,
    pub reservation_id: Option<Ulid>,
    pub guest_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounts {
    pub pending: usize,
    pub confirmed: usize,
    pub checked_in: usize,
    pub checked_out: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: Status) {
        match status {
            Status::Pending => self.pending += 1,
            Status::Confirmed => self.confirmed += 1,
            Status::CheckedIn => self.checked_in += 1,
            Status::CheckedOut => self.checked_out += 1,
            Status::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, status: Status) -> usize {
        match status {
            Status::Pending => self.pending,
            Status::Confirmed => self.confirmed,
            Status::CheckedIn => self.checked_in,
            Status::CheckedOut => self.checked_out,
            Status::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        Status::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSummary {
    pub at: Ms,
    pub room_occupancy: f64,
    pub hall_occupancy: f64,
    pub counts: StatusCounts,
    pub arrivals: Vec<Reservation>,
    pub departures: Vec<Reservation>,
}
