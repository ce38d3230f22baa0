use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::schedule::StaffSchedule;
use super::{EngineError, ValidationError};

/// What a candidate window ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSource {
    Appointment { id: Ulid, window: Span },
    Exception { id: Ulid, kind: ExceptionKind, window: Span },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub staff_id: Ulid,
    /// The buffer-expanded window that was being placed.
    pub candidate: Span,
    pub with: ConflictSource,
}

impl Conflict {
    pub fn source_label(&self) -> &'static str {
        match self.with {
            ConflictSource::Appointment { .. } => "appointment",
            ConflictSource::Exception { .. } => "exception",
        }
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.candidate;
        match &self.with {
            ConflictSource::Appointment { id, window } => write!(
                f,
                "window [{}, {}) for staff {} conflicts with appointment {id} [{}, {})",
                c.start, c.end, self.staff_id, window.start, window.end
            ),
            ConflictSource::Exception { id, kind, window } => write!(
                f,
                "window [{}, {}) for staff {} conflicts with {} {id} [{}, {})",
                c.start, c.end, self.staff_id, kind.as_str(), window.start, window.end
            ),
        }
    }
}

pub(crate) fn validate_span(
    span: &Span,
    what: &'static str,
    max_duration: Ms,
) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(ValidationError::EmptySpan(what).into());
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_duration {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// First live line (other than `exclude`'s) or unavailable interval that
/// overlaps `candidate`. Appointment lines are reported before exceptions.
pub fn find_conflict(
    schedule: &StaffSchedule,
    unavailable: &[UnavailableInterval],
    candidate: Span,
    exclude: Option<Ulid>,
) -> Option<Conflict> {
    let booked = schedule
        .overlapping(&candidate)
        .find(|o| Some(o.appointment_id) != exclude)
        .map(|o| ConflictSource::Appointment {
            id: o.appointment_id,
            window: o.effective,
        });
    let blocked = || {
        unavailable
            .iter()
            .find(|u| u.span.overlaps(&candidate))
            .map(|u| ConflictSource::Exception {
                id: u.exception_id,
                kind: u.kind,
                window: u.span,
            })
    };
    booked.or_else(blocked).map(|with| Conflict {
        staff_id: schedule.id,
        candidate,
        with,
    })
}

pub fn has_conflict(
    schedule: &StaffSchedule,
    unavailable: &[UnavailableInterval],
    candidate: Span,
    exclude: Option<Ulid>,
) -> bool {
    find_conflict(schedule, unavailable, candidate, exclude).is_some()
}
