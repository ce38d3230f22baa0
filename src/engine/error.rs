use thiserror::Error;
use ulid::Ulid;

use crate::model::AppointmentStatus;
use crate::recurrence::RecurrenceError;

use super::conflict::Conflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Staff,
    Service,
    Exception,
    Appointment,
    Completion,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Staff => "staff member",
            Entity::Service => "service",
            Entity::Exception => "availability exception",
            Entity::Appointment => "appointment",
            Entity::Completion => "completion record",
        })
    }
}

/// Caller input that can never succeed as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0}: end must be after start")]
    EmptySpan(&'static str),
    #[error("appointment has no service lines")]
    NoLines,
    #[error("{0} must not be negative")]
    NegativeAmount(&'static str),
    #[error("cancellation reason must not be empty")]
    EmptyReason,
    #[error("{0} is too long")]
    TooLong(&'static str),
    #[error("staff member {0} is inactive")]
    InactiveStaff(Ulid),
    #[error("service {0} is inactive")]
    InactiveService(Ulid),
    #[error("service line does not fit the appointment window")]
    LineOutsideWindow,
    #[error("custom hours cannot be a full-day exception")]
    FullDayCustomHours,
    #[error("exception {0} belongs to a different staff member")]
    StaffMismatch(Ulid),
    #[error("invalid recurrence rule: {0}")]
    Recurrence(#[from] RecurrenceError),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Conflict(Box<Conflict>),
    #[error("cannot {action} appointment {id} in status {from}{}", .reason.map(|r| format!(": {r}")).unwrap_or_default())]
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        action: &'static str,
        reason: Option<&'static str>,
    },
    #[error("{0} not found: {1}")]
    NotFound(Entity, Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("timed out waiting for the schedule of staff member {staff_id}; retry")]
    ConcurrencyConflict { staff_id: Ulid },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<Conflict> for EngineError {
    fn from(conflict: Conflict) -> Self {
        EngineError::Conflict(Box::new(conflict))
    }
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ConcurrencyConflict { .. } => "concurrency",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::Storage(_) => "storage",
        }
    }
}
