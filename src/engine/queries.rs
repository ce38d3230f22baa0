use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{busy_spans, free_intervals, open_slots, resolve_unavailable};
use super::conflict::{Conflict, find_conflict, validate_span};
use super::lifecycle::NewLine;
use super::{Engine, EngineError, Entity, ValidationError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub staff_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
    /// Appointments whose requested window overlaps this one.
    pub window: Option<Span>,
    pub include_deleted: bool,
}

impl AppointmentFilter {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        (self.include_deleted || !appointment.audit.is_deleted())
            && self.staff_id.is_none_or(|s| appointment.staff_ids().contains(&s))
            && self.client_id.is_none_or(|c| appointment.client_id == c)
            && self.status.is_none_or(|s| appointment.status == s)
            && self.window.is_none_or(|w| appointment.span.overlaps(&w))
    }
}

/// One row of a staff member's calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarEntry {
    Appointment {
        appointment_id: Ulid,
        line: usize,
        service_id: Ulid,
        status: AppointmentStatus,
        span: Span,
        effective: Span,
    },
    Unavailable(UnavailableInterval),
}

impl CalendarEntry {
    pub fn start(&self) -> Ms {
        match self {
            CalendarEntry::Appointment { effective, .. } => effective.start,
            CalendarEntry::Unavailable(u) => u.span.start,
        }
    }
}

fn validate_window(window: &Span) -> Result<(), EngineError> {
    validate_span(window, "query window", MAX_QUERY_WINDOW_MS)
}

impl Engine {
    /// Soft-deleted appointments are still returned.
    pub fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(Entity::Appointment, id))
    }

    /// Matching appointments ordered by start.
    pub fn list_appointments(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| (a.span.start, a.id));
        out
    }

    /// The live completion record.
    pub fn get_completion(&self, appointment_id: Ulid) -> Result<ServiceCompletion, EngineError> {
        self.live_completion(appointment_id)
            .ok_or(EngineError::NotFound(Entity::Completion, appointment_id))
    }

    /// Every completion record ever written for an appointment, voided ones
    /// included.
    pub fn completion_history(&self, appointment_id: Ulid) -> Vec<ServiceCompletion> {
        self.completions
            .get(&appointment_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub fn get_service(&self, id: Ulid) -> Result<ServiceDefinition, EngineError> {
        self.services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Service, id))
    }

    pub fn list_services(&self) -> Vec<ServiceDefinition> {
        let mut out: Vec<ServiceDefinition> = self.services.iter().map(|s| s.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn get_staff(&self, id: Ulid) -> Result<StaffInfo, EngineError> {
        Ok(self.read_staff(id).await?.info())
    }

    pub async fn list_staff(&self) -> Result<Vec<StaffInfo>, EngineError> {
        let mut ids: Vec<Ulid> = self.staff.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.read_staff(id).await?.info());
        }
        Ok(out)
    }

    pub async fn list_exceptions(
        &self,
        staff_id: Ulid,
        include_deleted: bool,
    ) -> Result<Vec<AvailabilityException>, EngineError> {
        let schedule = self.read_staff(staff_id).await?;
        Ok(schedule
            .exceptions()
            .iter()
            .filter(|e| include_deleted || !e.audit.is_deleted())
            .cloned()
            .collect())
    }

    pub async fn unavailable_intervals(
        &self,
        staff_id: Ulid,
        window: Span,
    ) -> Result<Vec<UnavailableInterval>, EngineError> {
        validate_window(&window)?;
        let schedule = self.read_staff(staff_id).await?;
        Ok(resolve_unavailable(schedule.exceptions(), window, &*self.recurrence))
    }

    /// Booked lines and unavailable intervals overlapping `window`, by start.
    pub async fn calendar(&self, staff_id: Ulid, window: Span) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_window(&window)?;
        let schedule = self.read_staff(staff_id).await?;
        let mut entries: Vec<CalendarEntry> = schedule
            .overlapping(&window)
            .filter_map(|o| {
                let appointment = self.appointments.get(&o.appointment_id)?;
                let line = appointment.lines.get(o.line)?;
                Some(CalendarEntry::Appointment {
                    appointment_id: o.appointment_id,
                    line: o.line,
                    service_id: line.service_id,
                    status: appointment.status,
                    span: o.span,
                    effective: o.effective,
                })
            })
            .collect();
        entries.extend(
            resolve_unavailable(schedule.exceptions(), window, &*self.recurrence)
                .into_iter()
                .map(CalendarEntry::Unavailable),
        );
        entries.sort_by_key(CalendarEntry::start);
        Ok(entries)
    }

    /// Time in `window` not held by a booked line or an exception.
    pub async fn free_time(&self, staff_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let schedule = self.read_staff(staff_id).await?;
        let unavailable = resolve_unavailable(schedule.exceptions(), window, &*self.recurrence);
        let busy = busy_spans(schedule.overlapping(&window).map(|o| o.effective), &unavailable);
        Ok(free_intervals(&busy, window))
    }

    /// Dry run of the booking conflict check for one line. Takes only a read
    /// lock, so the answer can be stale by the time a booking is attempted.
    pub async fn check_window(
        &self,
        staff_id: Ulid,
        service_id: Ulid,
        start: Ms,
        end: Option<Ms>,
        exclude: Option<Ulid>,
    ) -> Result<Option<Conflict>, EngineError> {
        let request = NewLine {
            service_id,
            staff_id: Some(staff_id),
            start,
            end,
            price: None,
        };
        let (line, _) = self.plan_line(&request, staff_id)?;
        let schedule = self.read_staff(staff_id).await?;
        if !schedule.active {
            return Err(ValidationError::InactiveStaff(staff_id).into());
        }
        let unavailable = resolve_unavailable(schedule.exceptions(), line.effective, &*self.recurrence);
        Ok(find_conflict(&schedule, &unavailable, line.effective, exclude))
    }

    /// Start times, every `step`, at which `service` could be booked with
    /// `staff_id` inside `window`.
    pub async fn find_open_slots(
        &self,
        staff_id: Ulid,
        service_id: Ulid,
        window: Span,
        step: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        if step < MIN_SLOT_STEP_MS {
            return Err(ValidationError::Invalid {
                field: "step",
                reason: format!("must be at least {MIN_SLOT_STEP_MS} ms"),
            }
            .into());
        }
        let service = self.active_service(service_id)?;
        let schedule = self.read_staff(staff_id).await?;
        if !schedule.active {
            return Err(ValidationError::InactiveStaff(staff_id).into());
        }
        let search = super::buffer::expand(&service, window);
        let unavailable = resolve_unavailable(schedule.exceptions(), search, &*self.recurrence);
        let busy = busy_spans(schedule.overlapping(&search).map(|o| o.effective), &unavailable);
        Ok(open_slots(
            &busy,
            window,
            service.duration,
            service.prep_minutes,
            service.cleanup_minutes,
            step,
            MAX_OPEN_SLOTS,
        ))
    }
}
