//! Post-service reconciliation: the dual-confirmation workflow and the
//! time-driven completion signals.
//!
//! [`assess`] is a pure function of the appointment, its live completion
//! record and the current time. [`Engine::timeout_check`] runs it under the
//! appointment's staff locks and persists the idempotency markers, so a
//! periodic sweep can call it as often as it likes.

use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::observability;

use super::lifecycle::{check_actor, check_amount, ensure_allowed, invalid_transition};
use super::{Engine, EngineError, Entity, ValidationError};

/// How long after the scheduled end an unconfirmed appointment is flagged.
pub const COMPLETION_GRACE_MS: Ms = 15 * MINUTE;

/// How long a single confirmation may wait for the other party before a
/// reminder goes out.
pub const REMINDER_AFTER_MS: Ms = 24 * HOUR;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionPolicy {
    /// Complete an appointment once the provider confirmation is this old,
    /// even without the client. `None` never auto-completes.
    pub auto_complete_after: Option<Ms>,
}

impl CompletionPolicy {
    pub fn auto_complete_due(&self, completion: &ServiceCompletion, now: Ms) -> bool {
        completion.provider_confirmed
            && !completion.client_confirmed
            && self.auto_complete_after.is_some_and(|after| {
                completion
                    .provider_confirmed_at
                    .is_some_and(|at| at.checked_add(after).is_some_and(|due| now >= due))
            })
    }
}

/// What a timeout check should do right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    pub completion_due: bool,
    pub reminder_for: Option<Party>,
    pub auto_complete: bool,
}

impl Assessment {
    pub fn is_idle(&self) -> bool {
        !self.completion_due && self.reminder_for.is_none() && !self.auto_complete
    }
}

/// Decide which time-driven actions are due. Only Confirmed and InProgress
/// appointments are ever acted on.
pub fn assess(
    appointment: &Appointment,
    completion: Option<&ServiceCompletion>,
    now: Ms,
    policy: &CompletionPolicy,
) -> Assessment {
    let mut verdict = Assessment::default();
    let open = matches!(
        appointment.status,
        AppointmentStatus::Confirmed | AppointmentStatus::InProgress
    ) && !appointment.audit.is_deleted();
    if !open {
        return verdict;
    }

    verdict.completion_due = now >= appointment.span.end + COMPLETION_GRACE_MS
        && completion.is_none_or(|c| !c.any_confirmed() && c.completion_due_sent_at.is_none());

    if let Some(c) = completion {
        if let Some(first) = c.lone_confirmation_at()
            && c.reminder_sent_at.is_none()
            && now >= first + REMINDER_AFTER_MS
        {
            verdict.reminder_for = Some(if c.provider_confirmed {
                Party::Client
            } else {
                Party::Provider
            });
        }
        verdict.auto_complete = policy.auto_complete_due(c, now);
    }
    verdict
}

impl Engine {
    /// Confirmations are accepted once the service is over (or under way).
    fn ensure_completion_eligible(&self, appointment: &Appointment, now: Ms) -> Result<(), EngineError> {
        ensure_allowed(appointment, Action::RecordConfirmation)?;
        if appointment.status == AppointmentStatus::Confirmed && now < appointment.span.end {
            return Err(invalid_transition(
                appointment,
                Action::RecordConfirmation,
                Some("service has not ended yet"),
            ));
        }
        Ok(())
    }

    /// The provider states what was charged and how it was paid. Repeating
    /// the same statement is a no-op; changing it after both parties have
    /// confirmed is refused.
    pub async fn record_provider_confirmation(
        &self,
        id: Ulid,
        price_charged: Cents,
        method: PaymentMethod,
        actor: Option<String>,
    ) -> Result<ServiceCompletion, EngineError> {
        check_actor(&actor)?;
        check_amount(price_charged, "price_charged")?;
        if let PaymentMethod::Other(name) = &method
            && (name.trim().is_empty() || name.len() > MAX_NAME_LEN)
        {
            return Err(ValidationError::Invalid {
                field: "payment_method",
                reason: "must be a non-empty name".into(),
            }
            .into());
        }

        let (mut locks, appointment) = self.lock_appointment(id).await?;
        let now = self.now();
        self.ensure_completion_eligible(&appointment, now)?;

        let mut record = match self.live_completion(id) {
            Some(live)
                if live.provider_confirmed
                    && live.price_charged == Some(price_charged)
                    && live.payment_method.as_ref() == Some(&method) =>
            {
                return Ok(live);
            }
            Some(live) if live.both_confirmed() => {
                return Err(invalid_transition(
                    &appointment,
                    Action::RecordConfirmation,
                    Some("completion already confirmed by both parties"),
                ));
            }
            Some(live) => live,
            None => ServiceCompletion::new(id, now, actor.clone()),
        };
        record.price_charged = Some(price_charged);
        record.payment_method = Some(method);
        if !record.provider_confirmed {
            record.provider_confirmed = true;
            record.provider_confirmed_at = Some(now);
        }
        record.audit.touch(now, actor);

        self.persist_and_apply(&mut locks, Event::CompletionStored(record.clone()), None)
            .await?;
        info!(appointment_id = %id, price_charged, "provider confirmed service");
        Ok(record)
    }

    pub async fn record_client_confirmation(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<ServiceCompletion, EngineError> {
        check_actor(&actor)?;
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        let now = self.now();
        self.ensure_completion_eligible(&appointment, now)?;

        let mut record = match self.live_completion(id) {
            Some(live) if live.client_confirmed => return Ok(live),
            Some(live) => live,
            None => ServiceCompletion::new(id, now, actor.clone()),
        };
        record.client_confirmed = true;
        record.client_confirmed_at = Some(now);
        record.audit.touch(now, actor);

        self.persist_and_apply(&mut locks, Event::CompletionStored(record.clone()), None)
            .await?;
        info!(appointment_id = %id, "client confirmed service");
        Ok(record)
    }

    /// Complete the appointment if both parties have confirmed; otherwise
    /// leave it as it is.
    pub async fn evaluate_completion(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_actor(&actor)?;
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        let confirmed = self
            .live_completion(id)
            .is_some_and(|c| c.both_confirmed());
        if !confirmed || appointment.status.after(Action::Complete).is_none() {
            return Ok(appointment);
        }
        self.complete_locked(&mut locks, id, actor).await?;
        self.get_appointment(id)
    }

    async fn complete_locked(
        &self,
        locks: &mut super::LockedSchedules,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<(), EngineError> {
        let event = Event::StatusChanged {
            id,
            status: AppointmentStatus::Completed,
            at: self.now(),
            by: actor,
            reason: None,
        };
        self.persist_and_apply(locks, event, None).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => AppointmentStatus::Completed.as_str())
            .increment(1);
        info!(appointment_id = %id, "appointment completed");
        Ok(())
    }

    /// Run the time-driven rules for one appointment and return the signals
    /// that fired. Safe to repeat: each signal fires at most once.
    pub async fn timeout_check(&self, id: Ulid) -> Result<Vec<Signal>, EngineError> {
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        let now = self.now();
        let live = self.live_completion(id);
        let verdict = assess(&appointment, live.as_ref(), now, &self.config.completion);

        let mut signals = Vec::new();
        if verdict.completion_due || verdict.reminder_for.is_some() {
            let mut record = live.unwrap_or_else(|| ServiceCompletion::new(id, now, None));
            let staff_ids = appointment.staff_ids();
            if verdict.completion_due {
                record.completion_due_sent_at = Some(now);
                signals.push(Signal::CompletionDue {
                    appointment_id: id,
                    staff_ids: staff_ids.clone(),
                    scheduled_end: appointment.span.end,
                });
            }
            if let Some(awaiting) = verdict.reminder_for {
                record.reminder_sent_at = Some(now);
                signals.push(Signal::ConfirmationReminderDue {
                    appointment_id: id,
                    staff_ids,
                    awaiting,
                });
            }
            record.audit.touch(now, None);
            self.persist_and_apply(&mut locks, Event::CompletionStored(record), None)
                .await?;
            for signal in &signals {
                self.publish(signal.clone());
            }
        }

        if verdict.auto_complete {
            self.complete_locked(&mut locks, id, None).await?;
        }
        Ok(signals)
    }

    /// Discard the live completion record so a corrected one can be recorded.
    /// Only before the appointment is completed.
    pub async fn void_completion(
        &self,
        id: Ulid,
        actor: Option<String>,
    ) -> Result<ServiceCompletion, EngineError> {
        check_actor(&actor)?;
        let (mut locks, appointment) = self.lock_appointment(id).await?;
        ensure_allowed(&appointment, Action::VoidCompletion)?;
        let mut record = self
            .live_completion(id)
            .ok_or(EngineError::NotFound(Entity::Completion, id))?;
        record.audit.soft_delete(self.now(), actor);
        self.persist_and_apply(&mut locks, Event::CompletionStored(record.clone()), None)
            .await?;
        info!(appointment_id = %id, "completion record voided");
        Ok(record)
    }

    /// Appointments the completion sweep has work for. Re-checked under lock
    /// by [`Engine::timeout_check`].
    pub fn sweep_candidates(&self) -> Vec<Ulid> {
        let now = self.now();
        let mut ids: Vec<Ulid> = self
            .appointments
            .iter()
            .filter(|entry| {
                let appointment = entry.value();
                let live = self.live_completion(appointment.id);
                !assess(appointment, live.as_ref(), now, &self.config.completion).is_idle()
            })
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }
}
