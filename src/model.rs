use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in minor currency units (45.00 is `4500`).
pub type Cents = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Start of the UTC day containing `t`.
pub fn day_floor(t: Ms) -> Ms {
    t.div_euclid(DAY) * DAY
}

/// Start of the first UTC day at or after `t`.
pub fn day_ceil(t: Ms) -> Ms {
    let floor = day_floor(t);
    if floor == t { t } else { floor + DAY }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for caller-supplied windows.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
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

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection of two spans, if they overlap.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        Span::checked(self.start.max(window.start), self.end.min(window.end))
    }

    pub fn shifted(&self, delta: Ms) -> Span {
        Span::new(self.start + delta, self.end + delta)
    }

    /// Expand to whole UTC days.
    pub fn to_full_days(&self) -> Span {
        Span::new(day_floor(self.start), day_ceil(self.end))
    }
}

// ── Audit ────────────────────────────────────────────────────────

/// Who-and-when stamps carried by every entity. Soft deletion is the
/// `deleted_at`/`deleted_by` pair; deleted rows stay queryable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: Ms,
    pub created_by: Option<String>,
    pub updated_at: Ms,
    pub updated_by: Option<String>,
    pub deleted_at: Option<Ms>,
    pub deleted_by: Option<String>,
}

impl Audit {
    pub fn created(at: Ms, by: Option<String>) -> Self {
        Self {
            created_at: at,
            created_by: by.clone(),
            updated_at: at,
            updated_by: by,
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn touch(&mut self, at: Ms, by: Option<String>) {
        self.updated_at = at;
        self.updated_by = by;
    }

    pub fn soft_delete(&mut self, at: Ms, by: Option<String>) {
        self.deleted_at = Some(at);
        self.deleted_by = by.clone();
        self.touch(at, by);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ── Directory & catalog ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: Ulid,
    pub name: Option<String>,
    pub duration: Ms,
    pub prep_minutes: i64,
    pub cleanup_minutes: i64,
    pub price: Cents,
    pub deposit: Cents,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
}

// ── Availability exceptions ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    TimeOff,
    Holiday,
    /// The staff member works only inside the exception's hours on the
    /// day(s) it covers.
    CustomHours,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::TimeOff => "time_off",
            ExceptionKind::Holiday => "holiday",
            ExceptionKind::CustomHours => "custom_hours",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "time_off" | "timeoff" => Some(ExceptionKind::TimeOff),
            "holiday" => Some(ExceptionKind::Holiday),
            "custom_hours" | "customhours" => Some(ExceptionKind::CustomHours),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub business_id: String,
    pub staff_id: Ulid,
    pub kind: ExceptionKind,
    pub span: Span,
    pub full_day: bool,
    /// Calendar recurrence rule; `Some` means the exception is recurring and
    /// `span` is only the first occurrence.
    pub recurrence_rule: Option<String>,
    pub notes: Option<String>,
    pub audit: Audit,
}

impl AvailabilityException {
    pub fn is_recurring(&self) -> bool {
        self.recurrence_rule.is_some()
    }
}

/// One resolved unavailable interval on a staff member's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnavailableInterval {
    pub exception_id: Ulid,
    pub kind: ExceptionKind,
    pub span: Span,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

/// Everything a caller can ask an appointment to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Confirm,
    Start,
    Cancel,
    Reschedule,
    MarkNoShow,
    Complete,
    RecordConfirmation,
    RecordDeposit,
    VoidCompletion,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Confirm => "confirm",
            Action::Start => "start",
            Action::Cancel => "cancel",
            Action::Reschedule => "reschedule",
            Action::MarkNoShow => "mark_no_show",
            Action::Complete => "complete",
            Action::RecordConfirmation => "record_confirmation",
            Action::RecordDeposit => "record_deposit",
            Action::VoidCompletion => "void_completion",
        }
    }
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 7] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
        AppointmentStatus::Rescheduled,
    ];

    pub fn is_terminal(&self) -> bool {
        match self {
            AppointmentStatus::Scheduled
            | AppointmentStatus::Confirmed
            | AppointmentStatus::InProgress => false,
            AppointmentStatus::Completed
            | AppointmentStatus::Cancelled
            | AppointmentStatus::NoShow
            | AppointmentStatus::Rescheduled => true,
        }
    }

    /// Whether an appointment in this status still holds its staff members'
    /// time. Completed appointments did happen, so they keep occupying.
    pub fn occupies_schedule(&self) -> bool {
        match self {
            AppointmentStatus::Scheduled
            | AppointmentStatus::Confirmed
            | AppointmentStatus::InProgress
            | AppointmentStatus::Completed => true,
            AppointmentStatus::Cancelled
            | AppointmentStatus::NoShow
            | AppointmentStatus::Rescheduled => false,
        }
    }

    /// The state-machine table. `None` means the action is not legal from
    /// this status. Time and confirmation guards are checked by the caller.
    pub fn after(self, action: Action) -> Option<AppointmentStatus> {
        use AppointmentStatus::*;
        match (self, action) {
            (Scheduled, Action::Confirm) => Some(Confirmed),
            (Confirmed, Action::Start) => Some(InProgress),
            (Scheduled | Confirmed, Action::Cancel) => Some(Cancelled),
            (Scheduled | Confirmed, Action::Reschedule) => Some(Rescheduled),
            (Confirmed, Action::MarkNoShow) => Some(NoShow),
            (Confirmed | InProgress, Action::Complete) => Some(Completed),
            // Non-transitioning actions: legal while the status is kept.
            (Confirmed | InProgress, Action::RecordConfirmation) => Some(self),
            (Scheduled | Confirmed | InProgress, Action::RecordDeposit) => Some(self),
            (Confirmed | InProgress, Action::VoidCompletion) => Some(self),
            (
                Scheduled | Confirmed | InProgress | Completed | Cancelled | NoShow | Rescheduled,
                _,
            ) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Rescheduled => "rescheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-line sub-status, mirrored from the appointment's transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
    NoShow,
}

impl LineStatus {
    pub fn for_appointment(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::Scheduled | AppointmentStatus::Confirmed => LineStatus::Pending,
            AppointmentStatus::InProgress => LineStatus::InProgress,
            AppointmentStatus::Completed => LineStatus::Done,
            AppointmentStatus::Cancelled | AppointmentStatus::Rescheduled => LineStatus::Cancelled,
            AppointmentStatus::NoShow => LineStatus::NoShow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub service_id: Ulid,
    pub staff_id: Ulid,
    /// Client-visible window.
    pub span: Span,
    /// Buffer-expanded window used for conflict checks.
    pub effective: Span,
    pub price: Cents,
    pub status: LineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub business_id: String,
    pub client_id: Ulid,
    pub staff_id: Ulid,
    pub lines: Vec<ServiceLine>,
    /// Requested window covering every line, exclusive of buffers.
    pub span: Span,
    pub status: AppointmentStatus,
    /// Pre-service estimate. Never overwritten by the completion price.
    pub total_price: Cents,
    pub deposit_amount: Cents,
    pub deposit_paid: bool,
    pub cancellation_reason: Option<String>,
    pub notes: Option<String>,
    pub recurrence_rule: Option<String>,
    pub previous_appointment_id: Option<Ulid>,
    pub rescheduled_to: Option<Ulid>,
    pub confirmed_at: Option<Ms>,
    pub started_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub no_show_at: Option<Ms>,
    pub audit: Audit,
}

impl Appointment {
    /// Distinct staff members across all lines, sorted.
    pub fn staff_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.lines.iter().map(|l| l.staff_id).collect();
        ids.push(self.staff_id);
        ids.sort();
        ids.dedup();
        ids
    }

    /// Live appointments hold their staff members' effective windows.
    pub fn occupies_schedule(&self) -> bool {
        self.status.occupies_schedule() && !self.audit.is_deleted()
    }
}

// ── Completion ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Voucher,
    Other(String),
}

impl PaymentMethod {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cash" => PaymentMethod::Cash,
            "card" => PaymentMethod::Card,
            "bank_transfer" | "transfer" => PaymentMethod::BankTransfer,
            "voucher" => PaymentMethod::Voucher,
            _ => PaymentMethod::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Voucher => "voucher",
            PaymentMethod::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCompletion {
    pub id: Ulid,
    pub appointment_id: Ulid,
    /// Authoritative final price once present.
    pub price_charged: Option<Cents>,
    pub payment_method: Option<PaymentMethod>,
    pub provider_confirmed: bool,
    pub provider_confirmed_at: Option<Ms>,
    pub client_confirmed: bool,
    pub client_confirmed_at: Option<Ms>,
    pub completion_date: Option<Ms>,
    /// Set when the "completion due" signal fired; never fires twice.
    pub completion_due_sent_at: Option<Ms>,
    /// Set when the "confirmation reminder due" signal fired.
    pub reminder_sent_at: Option<Ms>,
    pub audit: Audit,
}

impl ServiceCompletion {
    pub fn new(appointment_id: Ulid, at: Ms, by: Option<String>) -> Self {
        Self {
            id: Ulid::new(),
            appointment_id,
            price_charged: None,
            payment_method: None,
            provider_confirmed: false,
            provider_confirmed_at: None,
            client_confirmed: false,
            client_confirmed_at: None,
            completion_date: None,
            completion_due_sent_at: None,
            reminder_sent_at: None,
            audit: Audit::created(at, by),
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.provider_confirmed && self.client_confirmed
    }

    pub fn any_confirmed(&self) -> bool {
        self.provider_confirmed || self.client_confirmed
    }

    /// When the first of the two confirmations landed, if exactly one has.
    pub fn lone_confirmation_at(&self) -> Option<Ms> {
        match (self.provider_confirmed, self.client_confirmed) {
            (true, false) => self.provider_confirmed_at,
            (false, true) => self.client_confirmed_at,
            _ => None,
        }
    }
}

/// Which party a reminder is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Provider,
    Client,
}

// ── WAL record format ────────────────────────────────────────────

/// Flat event types, no nesting beyond record snapshots. This is the
/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffRegistered {
        id: Ulid,
        name: Option<String>,
    },
    StaffUpdated {
        id: Ulid,
        name: Option<String>,
        active: bool,
    },
    ServiceDefined(ServiceDefinition),
    ExceptionStored(AvailabilityException),
    ExceptionDeleted {
        id: Ulid,
        staff_id: Ulid,
        at: Ms,
        by: Option<String>,
    },
    /// Inserts the appointment snapshot. Its lines occupy their staff
    /// members' schedules only if the snapshot is live.
    AppointmentStored(Appointment),
    StatusChanged {
        id: Ulid,
        status: AppointmentStatus,
        at: Ms,
        by: Option<String>,
        reason: Option<String>,
    },
    Rescheduled {
        id: Ulid,
        successor: Appointment,
        at: Ms,
        by: Option<String>,
    },
    DepositRecorded {
        id: Ulid,
        at: Ms,
        by: Option<String>,
    },
    AppointmentDeleted {
        id: Ulid,
        at: Ms,
        by: Option<String>,
    },
    /// Upsert of a completion record by its id.
    CompletionStored(ServiceCompletion),
}

// ── Signals ──────────────────────────────────────────────────────

/// Fire-and-forget notifications for the external notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    BookingCreated {
        appointment_id: Ulid,
        client_id: Ulid,
        staff_ids: Vec<Ulid>,
        start: Ms,
        end: Ms,
        previous_appointment_id: Option<Ulid>,
    },
    AppointmentCancelled {
        appointment_id: Ulid,
        client_id: Ulid,
        staff_ids: Vec<Ulid>,
        reason: String,
    },
    CompletionDue {
        appointment_id: Ulid,
        staff_ids: Vec<Ulid>,
        scheduled_end: Ms,
    },
    ConfirmationReminderDue {
        appointment_id: Ulid,
        staff_ids: Vec<Ulid>,
        awaiting: Party,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::BookingCreated { .. } => "booking_created",
            Signal::AppointmentCancelled { .. } => "appointment_cancelled",
            Signal::CompletionDue { .. } => "completion_due",
            Signal::ConfirmationReminderDue { .. } => "confirmation_reminder_due",
        }
    }

    pub fn appointment_id(&self) -> Ulid {
        match self {
            Signal::BookingCreated { appointment_id, .. }
            | Signal::AppointmentCancelled { appointment_id, .. }
            | Signal::CompletionDue { appointment_id, .. }
            | Signal::ConfirmationReminderDue { appointment_id, .. } => *appointment_id,
        }
    }

    pub fn staff_ids(&self) -> &[Ulid] {
        match self {
            Signal::BookingCreated { staff_ids, .. }
            | Signal::AppointmentCancelled { staff_ids, .. }
            | Signal::CompletionDue { staff_ids, .. }
            | Signal::ConfirmationReminderDue { staff_ids, .. } => staff_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn checked_rejects_empty_and_inverted() {
        assert!(Span::checked(100, 100).is_none());
        assert!(Span::checked(200, 100).is_none());
        assert_eq!(Span::checked(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn clamp_to_window() {
        let s = Span::new(50, 150);
        assert_eq!(s.clamp_to(&Span::new(100, 300)), Some(Span::new(100, 150)));
        assert_eq!(s.clamp_to(&Span::new(150, 300)), None);
    }

    #[test]
    fn full_days_cover_partial_days() {
        let s = Span::new(DAY + 9 * HOUR, DAY + 17 * HOUR);
        assert_eq!(s.to_full_days(), Span::new(DAY, 2 * DAY));
        let exact = Span::new(DAY, 3 * DAY);
        assert_eq!(exact.to_full_days(), exact);
    }

    #[test]
    fn day_floor_handles_negative_times() {
        assert_eq!(day_floor(-1), -DAY);
        assert_eq!(day_ceil(-1), 0);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let actions = [
            Action::Confirm,
            Action::Start,
            Action::Cancel,
            Action::Reschedule,
            Action::MarkNoShow,
            Action::Complete,
            Action::RecordConfirmation,
            Action::RecordDeposit,
            Action::VoidCompletion,
        ];
        for status in AppointmentStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for action in actions {
                assert_eq!(status.after(action), None, "{status} accepted {action:?}");
            }
        }
    }

    #[test]
    fn lifecycle_table() {
        use AppointmentStatus::*;
        assert_eq!(Scheduled.after(Action::Confirm), Some(Confirmed));
        assert_eq!(Confirmed.after(Action::Start), Some(InProgress));
        assert_eq!(Scheduled.after(Action::Start), None);
        assert_eq!(InProgress.after(Action::Cancel), None);
        assert_eq!(Scheduled.after(Action::MarkNoShow), None);
        assert_eq!(Scheduled.after(Action::Complete), None);
        assert_eq!(InProgress.after(Action::Complete), Some(Completed));
    }

    #[test]
    fn status_parse_round_trips_names() {
        for status in AppointmentStatus::ALL {
            assert_eq!(AppointmentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AppointmentStatus::parse("IN_PROGRESS"), Some(AppointmentStatus::InProgress));
        assert_eq!(AppointmentStatus::parse("pending"), None);
    }

    #[test]
    fn lone_confirmation() {
        let mut c = ServiceCompletion::new(Ulid::new(), 0, None);
        assert_eq!(c.lone_confirmation_at(), None);
        c.client_confirmed = true;
        c.client_confirmed_at = Some(42);
        assert_eq!(c.lone_confirmation_at(), Some(42));
        c.provider_confirmed = true;
        c.provider_confirmed_at = Some(50);
        assert_eq!(c.lone_confirmation_at(), None);
        assert!(c.both_confirmed());
    }

    #[test]
    fn signal_serializes_with_type_tag() {
        let id = Ulid::new();
        let signal = Signal::CompletionDue {
            appointment_id: id,
            staff_ids: vec![],
            scheduled_end: 1000,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "completion_due");
        assert_eq!(json["appointment_id"], id.to_string());
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(a0 in -1_000_000i64..1_000_000, la in 1i64..100_000,
                                b0 in -1_000_000i64..1_000_000, lb in 1i64..100_000) {
            let a = Span::new(a0, a0 + la);
            let b = Span::new(b0, b0 + lb);
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        }

        #[test]
        fn adjacent_spans_never_overlap(start in -1_000_000i64..1_000_000, l1 in 1i64..10_000, l2 in 1i64..10_000) {
            let a = Span::new(start, start + l1);
            let b = Span::new(start + l1, start + l1 + l2);
            prop_assert!(!a.overlaps(&b));
        }
    }
}
