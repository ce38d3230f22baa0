use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::resolve_unavailable;
use super::buffer;
use super::conflict::{Conflict, ConflictSource, find_conflict, validate_span};
use super::{Engine, EngineError, Entity, LockedSchedules, ValidationError};

/// One requested service line. Missing end means the service's catalog
/// duration; missing staff means the appointment's primary staff member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLine {
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: Ms,
    pub end: Option<Ms>,
    pub price: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub staff_id: Ulid,
    pub lines: Vec<NewLine>,
    /// Defaults to the sum of the services' deposits.
    pub deposit_amount: Option<Cents>,
    pub notes: Option<String>,
    pub recurrence_rule: Option<String>,
}

impl NewAppointment {
    /// A one-service booking at the catalog price.
    pub fn single(id: Ulid, client_id: Ulid, staff_id: Ulid, service_id: Ulid, span: Span) -> Self {
        Self {
            id,
            client_id,
            staff_id,
            lines: vec![NewLine {
                service_id,
                staff_id: None,
                start: span.start,
                end: Some(span.end),
                price: None,
            }],
            deposit_amount: None,
            notes: None,
            recurrence_rule: None,
        }
    }
}

pub(super) fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(ValidationError::TooLong(what).into()),
        _ => Ok(()),
    }
}

/// Money amounts are non-negative and at most [`MAX_PRICE_CENTS`].
pub(super) fn check_amount(value: Cents, what: &'static str) -> Result<(), EngineError> {
    if value < 0 {
        return Err(ValidationError::NegativeAmount(what).into());
    }
    if value > MAX_PRICE_CENTS {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

fn sum_prices(lines: &[ServiceLine]) -> Result<Cents, EngineError> {
    lines
        .iter()
        .try_fold(0 as Cents, |total, l| total.checked_add(l.price))
        .ok_or(EngineError::LimitExceeded("amount too large"))
}

pub(super) fn check_actor(actor: &Option<String>) -> Result<(), EngineError> {
    check_len(actor.as_deref(), MAX_ACTOR_LEN, "actor")
}

pub(super) fn invalid_transition(
    appointment: &Appointment,
    action: Action,
    reason: Option<&'static str>,
) -> EngineError {
    EngineError::InvalidTransition {
        id: appointment.id,
        from: appointment.status,
        action: action.as_str(),
        reason,
    }
}

/// The status `action` leads to, or `InvalidTransition`.
pub(super) fn ensure_allowed(
    appointment: &Appointment,
    action: Action,
) -> Result<AppointmentStatus, EngineError> {
    appointment
        .status
        .after(action)
        .ok_or_else(|| invalid_transition(appointment, action, None))
}

fn booking_created(appointment: &Appointment) -> Signal {
    Signal::BookingCreated {
        appointment_id: appointment.id,
        client_id: appointment.client_id,
        staff_ids: appointment.staff_ids(),
        start: appointment.span.start,
        end: appointment.span.end,
        previous_appointment_id: appointment.previous_appointment_id,
    }
}

fn covering_span(lines: &[ServiceLine]) -> Option<Span> {
    let start = lines.iter().map(|l| l.span.start).min()?;
    let end = lines.iter().map(|l| l.span.end).max()?;
    Span::checked(start, end)
}

impl Engine {
    pub(super) fn active_service(&self, id: Ulid) -> Result<ServiceDefinition, EngineError> {
        let service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Service, id))?;
        if !service.active {
            return Err(ValidationError::InactiveService(id).into());
        }
        Ok(service)
    }

    /// Resolve a requested line against the catalog. Returns the line and the
    /// service's deposit.
    pub(super) fn plan_line(
        &self,
        line: &NewLine,
        default_staff: Ulid,
    ) -> Result<(ServiceLine, Cents), EngineError> {
        let service = self.active_service(line.service_id)?;
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&line.start) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let end = match line.end {
            Some(end) => end,
            None => line
                .start
                .checked_add(service.duration)
                .ok_or(EngineError::LimitExceeded("timestamp out of range"))?,
        };
        let span = Span::checked(line.start, end).ok_or(ValidationError::EmptySpan("service line"))?;
        validate_span(&span, "service line", MAX_APPOINTMENT_DURATION_MS)?;
        let price = line.price.unwrap_or(service.price);
        check_amount(price, "price")?;
        let planned = ServiceLine {
            service_id: service.id,
            staff_id: line.staff_id.unwrap_or(default_staff),
            span,
            effective: buffer::expand(&service, span),
            price,
            status: LineStatus::Pending,
        };
        Ok((planned, service.deposit))
    }

    /// Conflict-check planned lines against the locked schedules. Lines of
    /// `exclude` are ignored, and lines of one appointment may not overlap
    /// each other on the same staff member.
    pub(super) fn check_lines(
        &self,
        locks: &LockedSchedules,
        lines: &[ServiceLine],
        appointment_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        for (idx, line) in lines.iter().enumerate() {
            let schedule = locks
                .get(line.staff_id)
                .ok_or(EngineError::NotFound(Entity::Staff, line.staff_id))?;
            if !schedule.active {
                return Err(ValidationError::InactiveStaff(line.staff_id).into());
            }
            if schedule.occupancies().len() >= MAX_LIVE_LINES_PER_STAFF {
                return Err(EngineError::LimitExceeded("too many live appointments for staff member"));
            }
            let unavailable =
                resolve_unavailable(schedule.exceptions(), line.effective, &*self.recurrence);
            let conflict = find_conflict(schedule, &unavailable, line.effective, exclude).or_else(|| {
                lines[..idx]
                    .iter()
                    .find(|o| o.staff_id == line.staff_id && o.effective.overlaps(&line.effective))
                    .map(|o| Conflict {
                        staff_id: line.staff_id,
                        candidate: line.effective,
                        with: ConflictSource::Appointment {
                            id: appointment_id,
                            window: o.effective,
                        },
                    })
            });
            if let Some(conflict) = conflict {
                metrics::counter!(observability::CONFLICTS_TOTAL, "source" => conflict.source_label())
                    .increment(1);
                return Err(conflict.into());
            }
        }
        Ok(())
    }

    /// Lock every staff member of a live appointment and re-read it under
    /// those locks.
    pub(super) async fn lock_appointment(
        &self,
        id: Ulid,
    ) -> Result<(LockedSchedules, Appointment), EngineError> {
        let staff = self
            .appointments
            .get(&id)
            .filter(|a| !a.audit.is_deleted())
            .map(|a| a.staff_ids())
            .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
        let locks = self.lock_staff(&staff).await?;
        let appointment = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .filter(|a| !a.audit.is_deleted())
            .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
        Ok((locks, appointment))
    }

    pub async fn create_appointment(
        &self,
        request: NewAppointment,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let result = self.try_create(request, actor).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_create(
        &self,
        request: NewAppointment,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        if request.lines.is_empty() {
            return Err(ValidationError::NoLines.into());
        }
        if request.lines.len() > MAX_LINES_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many service lines"));
        }
        check_len(request.notes.as_deref(), MAX_NOTES_LEN, "notes")?;
        check_len(request.recurrence_rule.as_deref(), MAX_RRULE_LEN, "recurrence_rule")?;
        check_actor(&actor)?;

        let mut lines = Vec::with_capacity(request.lines.len());
        let mut default_deposit: Cents = 0;
        for line in &request.lines {
            let (planned, deposit) = self.plan_line(line, request.staff_id)?;
            default_deposit = default_deposit
                .checked_add(deposit)
                .ok_or(EngineError::LimitExceeded("amount too large"))?;
            lines.push(planned);
        }
        let deposit_amount = request.deposit_amount.unwrap_or(default_deposit);
        check_amount(deposit_amount, "deposit")?;
        let total_price = sum_prices(&lines)?;
        let span = covering_span(&lines).ok_or(ValidationError::EmptySpan("appointment"))?;
        validate_span(&span, "appointment", MAX_APPOINTMENT_DURATION_MS)?;

        let mut staff: Vec<Ulid> = lines.iter().map(|l| l.staff_id).collect();
        staff.push(request.staff_id);
        let _claim = self.claim_id(request.id, |id| self.appointments.contains_key(id))?;
        let mut locks = self.lock_staff(&staff).await?;
        self.check_lines(&locks, &lines, request.id, None)?;

        let now = self.now();
        let appointment = Appointment {
            id: request.id,
            business_id: self.business_id().to_string(),
            client_id: request.client_id,
            staff_id: request.staff_id,
            total_price,
            lines,
            span,
            status: AppointmentStatus::Scheduled,
            deposit_amount,
            deposit_paid: false,
            cancellation_reason: None,
            notes: request.notes,
            recurrence_rule: request.recurrence_rule,
            previous_appointment_id: None,
            rescheduled_to: None,
            confirmed_at: None,
            started_at: None,
            cancelled_at: None,
            completed_at: None,
            no_show_at: None,
            audit: Audit::created(now, actor),
        };
        let signal = booking_created(&appointment);
        self.persist_and_apply(&mut locks, Event::AppointmentStored(appointment.clone()), Some(signal))
            .await?;
        info!(appointment_id = %appointment.id, staff_id = %appointment.staff_id, "appointment booked");
        Ok(appointment)
    }

    /// Move a Scheduled or Confirmed appointment to a new window, optionally
    /// with a different staff member. The original becomes `Rescheduled` and
    /// a new Scheduled appointment `new_id` takes its place. Lines keep their
    /// offsets from the appointment start; a single-line appointment takes
    /// the new window exactly.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_id: Ulid,
        new_start: Ms,
        new_end: Ms,
        new_staff: Option<Ulid>,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_actor(&actor)?;
        let window = Span::checked(new_start, new_end)
            .ok_or(ValidationError::EmptySpan("reschedule window"))?;
        validate_span(&window, "reschedule window", MAX_APPOINTMENT_DURATION_MS)?;

        let mut staff = self
            .appointments
            .get(&id)
            .filter(|a| !a.audit.is_deleted())
            .map(|a| a.staff_ids())
            .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
        staff.extend(new_staff);
        let _claim = self.claim_id(new_id, |id| self.appointments.contains_key(id))?;
        let mut locks = self.lock_staff(&staff).await?;

        let original = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .filter(|a| !a.audit.is_deleted())
            .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
        ensure_allowed(&original, Action::Reschedule)?;

        let delta = window.start - original.span.start;
        let single = original.lines.len() == 1;
        let mut lines = Vec::with_capacity(original.lines.len());
        for line in &original.lines {
            let span = if single { window } else { line.span.shifted(delta) };
            if !window.contains_span(&span) {
                return Err(ValidationError::LineOutsideWindow.into());
            }
            let service = self.active_service(line.service_id)?;
            lines.push(ServiceLine {
                service_id: line.service_id,
                staff_id: new_staff.unwrap_or(line.staff_id),
                span,
                effective: buffer::expand(&service, span),
                price: line.price,
                status: LineStatus::Pending,
            });
        }
        let total_price = sum_prices(&lines)?;
        let result = self.check_lines(&locks, &lines, new_id, Some(original.id));
        if let Err(e) = result {
            metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => e.kind()).increment(1);
            return Err(e);
        }

        let now = self.now();
        let successor = Appointment {
            id: new_id,
            business_id: original.business_id.clone(),
            client_id: original.client_id,
            staff_id: new_staff.unwrap_or(original.staff_id),
            total_price,
            lines,
            span: window,
            status: AppointmentStatus::Scheduled,
            deposit_amount: original.deposit_amount,
            deposit_paid: original.deposit_paid,
            cancellation_reason: None,
            notes: original.notes.clone(),
            recurrence_rule: original.recurrence_rule.clone(),
            previous_appointment_id: Some(original.id),
            rescheduled_to: None,
            confirmed_at: None,
            started_at: None,
            cancelled_at: None,
            completed_at: None,
            no_show_at: None,
            audit: Audit::created(now, actor.clone()),
        };
        let signal = booking_created(&successor);
        let event = Event::Rescheduled {
            id,
            successor: successor.clone(),
            at: now,
            by: actor,
        };
        self.persist_and_apply(&mut locks, event, Some(signal)).await?;
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "rescheduled").increment(1);
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => AppointmentStatus::Rescheduled.as_str())
            .increment(1);
        info!(appointment_id = %id, successor = %new_id, "appointment rescheduled");
        Ok(successor)
    }

    /// Apply a status-changing action after its time/confirmation guard.
    async fn transition(
        &self,
        id: Ulid,
        action: Action,
        actor: Option<String>,
        reason: Option<String>,
        guard: impl FnOnce(&Appointment, Ms) -> Result<(), EngineError>,
    ) -> Result<Appointment, EngineError> {
        check_actor(&actor)?;
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        let next = ensure_allowed(&appointment, action)?;
        let now = self.now();
        guard(&appointment, now)?;

        let signal = (next == AppointmentStatus::Cancelled).then(|| Signal::AppointmentCancelled {
            appointment_id: id,
            client_id: appointment.client_id,
            staff_ids: appointment.staff_ids(),
            reason: reason.clone().unwrap_or_default(),
        });
        let event = Event::StatusChanged {
            id,
            status: next,
            at: now,
            by: actor,
            reason,
        };
        self.persist_and_apply(&mut locks, event, signal).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
        info!(appointment_id = %id, from = %appointment.status, to = %next, "appointment transition");
        self.get_appointment(id)
    }

    pub async fn confirm_appointment(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Confirm, actor, None, |_, _| Ok(())).await
    }

    /// Check-in.
    pub async fn start_appointment(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Start, actor, None, |_, _| Ok(())).await
    }

    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        reason: &str,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::EmptyReason.into());
        }
        check_len(Some(reason), MAX_REASON_LEN, "cancellation reason")?;
        self.transition(id, Action::Cancel, actor, Some(reason.to_string()), |_, _| Ok(()))
            .await
    }

    pub async fn mark_no_show(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, Action::MarkNoShow, actor, None, |appointment, now| {
            if now < appointment.span.end {
                return Err(invalid_transition(
                    appointment,
                    Action::MarkNoShow,
                    Some("appointment has not ended yet"),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Explicit completion. Needs both confirmations on the live completion
    /// record, or a provider confirmation older than the auto-complete window.
    pub async fn complete_appointment(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Complete, actor, None, |appointment, now| {
            let done = self.live_completion(appointment.id).is_some_and(|c| {
                c.both_confirmed() || self.config.completion.auto_complete_due(&c, now)
            });
            if done {
                Ok(())
            } else {
                Err(invalid_transition(
                    appointment,
                    Action::Complete,
                    Some("awaiting provider and client confirmation"),
                ))
            }
        })
        .await
    }

    /// Soft-delete in any state. Releases the appointment's occupancy.
    pub async fn delete_appointment(&self, id: Ulid, actor: Option<String>) -> Result<(), EngineError> {
        check_actor(&actor)?;
        let (mut locks, _) = self.lock_appointment(id).await?;
        let event = Event::AppointmentDeleted {
            id,
            at: self.now(),
            by: actor,
        };
        self.persist_and_apply(&mut locks, event, None).await?;
        info!(appointment_id = %id, "appointment deleted");
        Ok(())
    }

    pub async fn record_deposit(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_actor(&actor)?;
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        ensure_allowed(&appointment, Action::RecordDeposit)?;
        if appointment.deposit_paid {
            return Ok(appointment);
        }
        let event = Event::DepositRecorded {
            id,
            at: self.now(),
            by: actor,
        };
        self.persist_and_apply(&mut locks, event, None).await?;
        self.get_appointment(id)
    }
}
