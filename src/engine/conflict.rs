use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn a raw `(start, end)` pair into a span. Runs before any conflict check.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::Validation(format!(
            "end_at ({end}) must be strictly after start_at ({start})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(Span::new(start, end))
}

/// First non-cancelled appointment on the service that overlaps `candidate`.
/// `exclude` skips the appointment being moved.
pub fn find_conflict<'a>(
    ss: &'a ServiceState,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Appointment> {
    ss.overlapping(candidate)
        .filter(|a| a.is_active())
        .find(|a| Some(a.id) != exclude)
}

pub fn is_admissible(ss: &ServiceState, candidate: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(ss, candidate, exclude).is_none()
}

/// Admission check used by the ledger. The caller must hold the service's
/// write lock until the resulting event is applied.
pub(crate) fn check_admissible(
    ss: &ServiceState,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ss, candidate, exclude) {
        None => Ok(()),
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                appointment_id: existing.id,
                start: existing.span.start,
                end: existing.span.end,
            })
        }
    }
}
