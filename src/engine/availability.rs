use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::find_conflict;
use super::{Engine, EngineError, SharedResourceState};

// ── Availability Algorithm ────────────────────────────────────────

/// Free sub-intervals of `window` on one resource: the window minus the
/// merged spans of every holding allocation that touches it.
pub(crate) fn free_spans(rs: &ResourceState, window: &Span) -> Vec<Span> {
    let mut held: Vec<Span> = rs
        .overlapping(window)
        .map(|a| Span::new(a.span.start.max(window.start), a.span.end.min(window.end)))
        .collect();
    if held.is_empty() {
        return vec![*window];
    }
    held.sort_by_key(|s| s.start);
    subtract_intervals(&[*window], &merge_overlapping(&held))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

pub(super) fn validate_window(window: &Span) -> Result<(), EngineError> {
    if !window.is_valid() {
        return Err(EngineError::InvalidInterval {
            start: window.start,
            end: window.end,
        });
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// True if a holding reservation other than `exclude` overlaps `span`
    /// on the resource.
    pub async fn has_conflict(
        &self,
        resource_id: &str,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_window(&span)?;
        let rs = self
            .resource_state(resource_id)
            .ok_or_else(|| EngineError::resource_not_found(resource_id))?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }

    /// Resources of `kind` that could take a party of `min_capacity` for
    /// `span` right now, smallest first.
    pub async fn suggest_resources(
        &self,
        kind: ResourceKind,
        span: Span,
        min_capacity: u32,
    ) -> Result<Vec<Resource>, EngineError> {
        validate_window(&span)?;
        let states: Vec<SharedResourceState> = self.resources.iter().map(|e| e.value().clone()).collect();

        let mut fits = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            let resource = &guard.resource;
            if resource.kind != kind || resource.retired || resource.capacity < min_capacity {
                continue;
            }
            if find_conflict(&guard, &span, None).is_none() {
                fits.push(resource.clone());
            }
        }
        fits.sort_by(|a, b| a.capacity.cmp(&b.capacity).then_with(|| a.id.cmp(&b.id)));
        Ok(fits)
    }

    pub async fn free_windows(&self, resource_id: &str, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let rs = self
            .resource_state(resource_id)
            .ok_or_else(|| EngineError::resource_not_found(resource_id))?;
        let guard = rs.read().await;
        Ok(free_spans(&guard, &window))
    }
}
