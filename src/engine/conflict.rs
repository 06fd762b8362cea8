use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_valid() {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First holding reservation on `rs` that overlaps `span`, other than `exclude`.
pub fn find_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|a| Some(a.reservation_id) != exclude)
        .map(|a| a.reservation_id)
}

/// Gate for every write that makes `reservation` hold `rs`.
pub(crate) fn check_assignable(rs: &ResourceState, reservation: &Reservation) -> Result<(), EngineError> {
    if rs.resource.retired {
        return Err(EngineError::Validation(format!(
            "resource {} is retired",
            rs.resource.id
        )));
    }
    if reservation.party_size > rs.resource.capacity {
        return Err(EngineError::Validation(format!(
            "party of {} exceeds capacity {} of {}",
            reservation.party_size, rs.resource.capacity, rs.resource.id
        )));
    }
    if let Some(held_by) = find_conflict(rs, &reservation.span, Some(reservation.id)) {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        return Err(EngineError::Conflict {
            resource_id: rs.resource.id.clone(),
            held_by,
        });
    }
    Ok(())
}
