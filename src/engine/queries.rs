use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::validate_window;
use super::{Engine, EngineError};

const DAY_MS: Ms = 24 * 3_600_000;

fn sort_by_start(list: &mut [Reservation]) {
    list.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.id.cmp(&b.id)));
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn matches_term(r: &Reservation, term: &str) -> bool {
    let needle = term.to_lowercase();
    if r.guest.name.to_lowercase().contains(&needle) || r.id.to_string().to_lowercase().starts_with(&needle) {
        return true;
    }
    if r.guest.contact.to_lowercase().contains(&needle) {
        return true;
    }
    looks_like_phone(term) && digits(&r.guest.contact).contains(&digits(term))
}

fn looks_like_phone(term: &str) -> bool {
    term.chars().any(|c| c.is_ascii_digit())
        && term
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'))
}

impl Engine {
    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        sort_by_start(&mut out);
        out
    }

    /// Every reservation ever bound to the resource, in any status. With a
    /// window, only those overlapping it.
    pub fn list_by_resource(&self, resource_id: &str, window: Option<Span>) -> Result<Vec<Reservation>, EngineError> {
        if !self.resources.contains_key(resource_id) {
            return Err(EngineError::resource_not_found(resource_id));
        }
        self.list_reservations(&ReservationFilter {
            resource_id: Some(resource_id.to_string()),
            window,
            ..Default::default()
        })
    }

    pub fn list_by_status(&self, status: Status) -> Vec<Reservation> {
        self.collect_reservations(|r| r.status == status)
    }

    pub fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        if let Some(window) = &filter.window {
            validate_window(window)?;
        }
        Ok(self.collect_reservations(|r| {
            filter.status.is_none_or(|s| r.status == s)
                && filter
                    .resource_id
                    .as_deref()
                    .is_none_or(|rid| r.resource_id.as_deref() == Some(rid))
                && filter.window.is_none_or(|w| r.span.overlaps(&w))
        }))
    }

    /// Case-insensitive match on guest name, reservation id prefix, or phone.
    pub fn search(&self, term: &str) -> Result<Vec<Reservation>, EngineError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(EngineError::Validation("search term must not be empty".into()));
        }
        if term.len() > MAX_SEARCH_TERM_LEN {
            return Err(EngineError::LimitExceeded("search term too long"));
        }
        Ok(self.collect_reservations(|r| matches_term(r, term)))
    }

    /// Share of active resources of `kind` held at instant `at`.
    pub async fn occupancy_rate(&self, kind: ResourceKind, at: Ms) -> f64 {
        let states: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut total = 0usize;
        let mut held = 0usize;
        for rs in states {
            let guard = rs.read().await;
            if guard.resource.kind != kind || guard.resource.retired {
                continue;
            }
            total += 1;
            if guard.covering(at).is_some() {
                held += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        held as f64 / total as f64
    }

    /// Holding reservations starting in `[from, to)`.
    pub fn arrivals_in_window(&self, from: Ms, to: Ms) -> Result<Vec<Reservation>, EngineError> {
        let window = Span::new(from, to);
        validate_window(&window)?;
        Ok(self.collect_reservations(|r| r.status.is_holding() && window.contains_instant(r.span.start)))
    }

    /// Holding reservations ending in `[from, to)`.
    pub fn departures_in_window(&self, from: Ms, to: Ms) -> Result<Vec<Reservation>, EngineError> {
        let window = Span::new(from, to);
        validate_window(&window)?;
        let mut out = self.collect_reservations(|r| r.status.is_holding() && window.contains_instant(r.span.end));
        out.sort_by(|a, b| a.span.end.cmp(&b.span.end).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.reservations.iter() {
            counts.record(entry.value().status);
        }
        counts
    }

    /// Per-resource state at `at`, grouped by zone and ordered by id.
    pub async fn resource_board(&self, kind: Option<ResourceKind>, at: Ms) -> Vec<BoardEntry> {
        let states: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut board = Vec::with_capacity(states.len());
        for rs in states {
            let guard = rs.read().await;
            let resource = &guard.resource;
            if kind.is_some_and(|k| resource.kind != k) {
                continue;
            }
            let current = guard.covering(at).copied();
            let state = match (resource.retired, current.map(|a| a.status)) {
                (true, _) => BoardState::Retired,
                (false, Some(Status::CheckedIn)) => BoardState::Occupied,
                (false, Some(_)) => BoardState::Reserved,
                (false, None) if resource.needs_cleaning => BoardState::Cleaning,
                (false, None) => BoardState::Available,
            };
            let holder = current.and_then(|a| self.reservations.get(&a.reservation_id).map(|r| r.value().clone()));
            board.push(BoardEntry {
                resource: resource.clone(),
                state,
                reservation_id: holder.as_ref().map(|r| r.id),
                guest_name: holder.map(|r| r.guest.name),
            });
        }
        board.sort_by(|a, b| {
            a.resource
                .zone
                .cmp(&b.resource.zone)
                .then_with(|| a.resource.id.cmp(&b.resource.id))
        });
        board
    }

    /// Dashboard cards: occupancy now plus arrivals and departures over the
    /// next 24 hours.
    pub async fn dashboard_summary(&self, now: Ms) -> Result<DashboardSummary, EngineError> {
        Ok(DashboardSummary {
            at: now,
            room_occupancy: self.occupancy_rate(ResourceKind::Room, now).await,
            hall_occupancy: self.occupancy_rate(ResourceKind::Hall, now).await,
            counts: self.status_counts(),
            arrivals: self.arrivals_in_window(now, now + DAY_MS)?,
            departures: self.departures_in_window(now, now + DAY_MS)?,
        })
    }
}
