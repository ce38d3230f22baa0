use crate::model::{Cents, DAY, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_STAFF_PER_TENANT: usize = 10_000;
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_EXCEPTIONS_PER_STAFF: usize = 10_000;
pub const MAX_LIVE_LINES_PER_STAFF: usize = 100_000;
pub const MAX_LINES_PER_APPOINTMENT: usize = 16;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_RRULE_LEN: usize = 512;
pub const MAX_ACTOR_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_APPOINTMENT_DURATION_MS: Ms = DAY;
pub const MAX_EXCEPTION_DURATION_MS: Ms = 366 * DAY;
pub const MAX_BUFFER_MINUTES: i64 = 24 * 60;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY;

pub const MAX_RECURRENCE_OCCURRENCES: usize = 10_000;
pub const MAX_OPEN_SLOTS: usize = 500;
pub const MIN_SLOT_STEP_MS: Ms = 60_000;

/// Largest price, deposit or charge, in cents.
pub const MAX_PRICE_CENTS: Cents = 100_000_000_000;
