use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::format_ms;

use super::conflict::{check_assignable, now_ms, validate_span};
use super::{touched_resources, Engine, EngineError};

fn illegal(prev: &Reservation, op: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: prev.id,
        from: prev.status,
        op,
    }
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_guest(guest: &Guest) -> Result<(), EngineError> {
    if guest.name.trim().is_empty() {
        return Err(EngineError::Validation("guest name must not be empty".into()));
    }
    check_len(Some(&guest.name), MAX_NAME_LEN, "guest name too long")?;
    check_len(Some(&guest.contact), MAX_CONTACT_LEN, "contact too long")?;
    check_len(guest.id_number.as_deref(), MAX_NAME_LEN, "id number too long")?;
    check_len(guest.designation.as_deref(), MAX_NAME_LEN, "designation too long")?;
    check_len(guest.department.as_deref(), MAX_NAME_LEN, "department too long")
}

fn validate_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 {
        return Err(EngineError::Validation("party size must be positive".into()));
    }
    if party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party size too large"));
    }
    Ok(())
}

fn validate_resource_ref(resource_id: Option<&str>) -> Result<(), EngineError> {
    match resource_id {
        Some(rid) if rid.trim().is_empty() => Err(EngineError::Validation("resource id must not be empty".into())),
        other => check_len(other, MAX_RESOURCE_ID_LEN, "resource id too long"),
    }
}

fn validate_draft(draft: &ReservationDraft) -> Result<(), EngineError> {
    validate_span(&draft.span)?;
    validate_party_size(draft.party_size)?;
    validate_guest(&draft.guest)?;
    validate_resource_ref(draft.resource_id.as_deref())?;
    check_len(draft.purpose.as_deref(), MAX_NOTES_LEN, "purpose too long")?;
    check_len(draft.notes.as_deref(), MAX_NOTES_LEN, "notes too long")
}

/// The holding footprint changed, so the conflict and capacity gate must run again.
fn needs_recheck(prev: &Reservation, next: &Reservation) -> bool {
    !prev.holds()
        || prev.resource_id != next.resource_id
        || prev.span != next.span
        || prev.party_size != next.party_size
}

/// `prev` with `patch` applied. A pending reservation that gains a
/// resource becomes confirmed.
fn amend(prev: &Reservation, patch: ReservationPatch, now: Ms) -> Result<Reservation, EngineError> {
    let mut next = prev.clone();
    if let Some(name) = patch.guest_name {
        next.guest.name = name;
    }
    if let Some(contact) = patch.contact {
        next.guest.contact = contact;
    }
    if let Some(span) = patch.span {
        validate_span(&span)?;
        next.span = span;
    }
    if let Some(party_size) = patch.party_size {
        validate_party_size(party_size)?;
        next.party_size = party_size;
    }
    if let Some(resource_id) = patch.resource_id {
        validate_resource_ref(Some(&resource_id))?;
        next.resource_id = Some(resource_id);
        if next.status == Status::Pending {
            next.status = Status::Confirmed;
        }
    }
    if patch.purpose.is_some() {
        check_len(patch.purpose.as_deref(), MAX_NOTES_LEN, "purpose too long")?;
        next.purpose = patch.purpose;
    }
    if patch.notes.is_some() {
        check_len(patch.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        next.notes = patch.notes;
    }
    validate_guest(&next.guest)?;
    next.updated_at = now;
    Ok(next)
}

impl Engine {
    fn next_id(&self) -> Ulid {
        let mut generator = self.id_gen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    /// Record a booking request. With a resource it is conflict-checked and
    /// confirmed at once; without one it waits as pending.
    pub async fn create_reservation(&self, draft: ReservationDraft) -> Result<Reservation, EngineError> {
        validate_draft(&draft)?;
        if self.reservations.len() >= MAX_RESERVATIONS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }

        let now = now_ms();
        let status = if draft.resource_id.is_some() {
            Status::Confirmed
        } else {
            Status::Pending
        };
        let reservation = Reservation {
            id: self.next_id(),
            guest: draft.guest,
            resource_id: draft.resource_id,
            span: draft.span,
            party_size: draft.party_size,
            status,
            purpose: draft.purpose,
            notes: draft.notes,
            correlation_id: draft.correlation_id,
            created_at: now,
            updated_at: now,
            checked_in_at: None,
            checked_out_at: None,
        };

        let _commit = self.commit_lock.read().await;
        let mut guards = self.lock_resources(touched_resources(None, &reservation)).await?;
        if let Some(guard) = guards.first() {
            check_assignable(guard, &reservation).inspect_err(|e| debug!("create rejected: {e}"))?;
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        self.gates.insert(reservation.id, Arc::default());
        self.commit(&mut guards, None, reservation.clone());

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} created for {} ({}, resource {}, {} to {})",
            reservation.id,
            reservation.guest.name,
            reservation.status,
            reservation.resource_id.as_deref().unwrap_or("-"),
            format_ms(reservation.span.start),
            format_ms(reservation.span.end)
        );
        Ok(reservation)
    }

    pub async fn assign_resource(&self, id: Ulid, resource_id: &str) -> Result<Reservation, EngineError> {
        validate_resource_ref(Some(resource_id))?;
        self.transition(id, "assign", |prev, at| match prev.status {
            Status::Pending => Ok(Event::ResourceAssigned {
                id,
                resource_id: resource_id.to_string(),
                at,
            }),
            _ => Err(illegal(prev, "assign")),
        })
        .await
    }

    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, "check-in", |prev, at| match prev.status {
            Status::Confirmed if prev.resource_id.is_some() => Ok(Event::CheckedIn { id, at }),
            _ => Err(illegal(prev, "check-in")),
        })
        .await
    }

    /// Ends the stay now. The rest of the interval is released and the
    /// resource is flagged for cleaning.
    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, "check-out", |prev, at| match prev.status {
            Status::CheckedIn => Ok(Event::CheckedOut { id, at }),
            _ => Err(illegal(prev, "check-out")),
        })
        .await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, "cancel", |prev, at| match prev.status {
            Status::Pending | Status::Confirmed => Ok(Event::Cancelled { id, at }),
            _ => Err(illegal(prev, "cancel")),
        })
        .await
    }

    /// Edit guest details, dates, party size or resource. Moves and
    /// resizes of a holding reservation are conflict-checked.
    pub async fn update(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        self.transition(id, "update", move |prev, at| {
            if prev.status.is_terminal() {
                return Err(illegal(prev, "update"));
            }
            Ok(Event::ReservationAmended {
                reservation: amend(prev, patch, at)?,
            })
        })
        .await
    }

    /// Run one reservation transition: plan the event under the
    /// reservation's gate, gate it on the touched resources, journal, apply.
    async fn transition<F>(&self, id: Ulid, op: &'static str, plan: F) -> Result<Reservation, EngineError>
    where
        F: FnOnce(&Reservation, Ms) -> Result<Event, EngineError>,
    {
        let gate = self.gate(id)?;
        let _gate = gate.lock().await;
        let prev = self
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::reservation_not_found(id))?;

        let event = plan(&prev, now_ms())?;
        let mut next = prev.clone();
        next.apply(&event);

        let _commit = self.commit_lock.read().await;
        let mut guards = self.lock_resources(touched_resources(Some(&prev), &next)).await?;
        if next.holds() && needs_recheck(&prev, &next) {
            let rid = next.resource_id.as_deref().unwrap_or_default();
            let guard = guards
                .iter()
                .find(|g| g.resource.id == rid)
                .ok_or_else(|| EngineError::Invariant(format!("resource {rid} not locked for {op}")))?;
            check_assignable(guard, &next).inspect_err(|e| debug!("{op} of {id} rejected: {e}"))?;
        }
        Self::verify_index(&guards, Some(&prev), &next)?;

        self.wal_append(&event).await?;
        self.commit(&mut guards, Some(&prev), next.clone());

        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "op" => op).increment(1);
        info!(
            "reservation {id}: {} -> {} ({op}, {} to {})",
            prev.status,
            next.status,
            format_ms(next.span.start),
            format_ms(next.span.end)
        );
        Ok(next)
    }
}
