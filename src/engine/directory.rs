use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::lifecycle::{check_actor, check_amount, check_len};
use super::{Engine, EngineError, Entity, LockedSchedules, ValidationError};

/// A time off, holiday or custom-hours entry as written by the exception
/// store. Also used for updates, which replace the whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewException {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub kind: ExceptionKind,
    pub start: Ms,
    pub end: Ms,
    pub full_day: bool,
    pub recurrence_rule: Option<String>,
    pub notes: Option<String>,
}

impl Engine {
    // ── Staff directory ──────────────────────────────────

    pub async fn register_staff(&self, id: Ulid, name: Option<String>) -> Result<StaffInfo, EngineError> {
        check_len(name.as_deref(), MAX_NAME_LEN, "staff name")?;
        let _catalog = self.catalog_lock.lock().await;
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.staff.len() >= MAX_STAFF_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        let event = Event::StaffRegistered { id, name: name.clone() };
        self.persist_and_apply(&mut LockedSchedules::empty(), event, None)
            .await?;
        info!(staff_id = %id, "staff member registered");
        Ok(StaffInfo { id, name, active: true })
    }

    pub async fn update_staff(
        &self,
        id: Ulid,
        name: Option<String>,
        active: bool,
    ) -> Result<StaffInfo, EngineError> {
        check_len(name.as_deref(), MAX_NAME_LEN, "staff name")?;
        let mut locks = self.lock_staff(&[id]).await?;
        let event = Event::StaffUpdated { id, name: name.clone(), active };
        self.persist_and_apply(&mut locks, event, None).await?;
        Ok(StaffInfo { id, name, active })
    }

    /// Deactivated staff keep their booked appointments but take no new ones.
    pub async fn deactivate_staff(&self, id: Ulid) -> Result<StaffInfo, EngineError> {
        let mut locks = self.lock_staff(&[id]).await?;
        let name = locks.get(id).and_then(|s| s.name.clone());
        let event = Event::StaffUpdated { id, name: name.clone(), active: false };
        self.persist_and_apply(&mut locks, event, None).await?;
        info!(staff_id = %id, "staff member deactivated");
        Ok(StaffInfo { id, name, active: false })
    }

    // ── Service catalog ──────────────────────────────────

    /// Create or replace a catalog entry. Existing appointments keep the
    /// windows and prices they were booked with.
    pub async fn define_service(&self, service: ServiceDefinition) -> Result<ServiceDefinition, EngineError> {
        check_len(service.name.as_deref(), MAX_NAME_LEN, "service name")?;
        if service.duration <= 0 {
            return Err(ValidationError::Invalid {
                field: "duration",
                reason: "must be positive".into(),
            }
            .into());
        }
        if service.duration > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if service.prep_minutes > MAX_BUFFER_MINUTES || service.cleanup_minutes > MAX_BUFFER_MINUTES {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
        check_amount(service.price, "price")?;
        check_amount(service.deposit, "deposit")?;

        let _catalog = self.catalog_lock.lock().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.persist_and_apply(
            &mut LockedSchedules::empty(),
            Event::ServiceDefined(service.clone()),
            None,
        )
        .await?;
        info!(service_id = %service.id, "service defined");
        Ok(service)
    }

    pub async fn retire_service(&self, id: Ulid) -> Result<ServiceDefinition, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Service, id))?;
        service.active = false;
        self.persist_and_apply(
            &mut LockedSchedules::empty(),
            Event::ServiceDefined(service.clone()),
            None,
        )
        .await?;
        info!(service_id = %id, "service retired");
        Ok(service)
    }

    // ── Exception store ──────────────────────────────────

    fn build_exception(&self, req: NewException, audit: Audit) -> Result<AvailabilityException, EngineError> {
        let span = Span::checked(req.start, req.end).ok_or(ValidationError::EmptySpan("exception"))?;
        validate_span(&span, "exception", MAX_EXCEPTION_DURATION_MS)?;
        if req.kind == ExceptionKind::CustomHours && req.full_day {
            return Err(ValidationError::FullDayCustomHours.into());
        }
        if let Some(rule) = &req.recurrence_rule {
            self.recurrence
                .validate(rule, span)
                .map_err(ValidationError::from)?;
        }
        check_len(req.notes.as_deref(), MAX_NOTES_LEN, "notes")?;
        Ok(AvailabilityException {
            id: req.id,
            business_id: self.business_id().to_string(),
            staff_id: req.staff_id,
            kind: req.kind,
            span,
            full_day: req.full_day,
            recurrence_rule: req.recurrence_rule,
            notes: req.notes,
            audit,
        })
    }

    /// Exceptions only constrain new bookings; appointments already on the
    /// books are left alone.
    pub async fn create_exception(
        &self,
        req: NewException,
        actor: Option<String>,
    ) -> Result<AvailabilityException, EngineError> {
        check_actor(&actor)?;
        let exception = self.build_exception(req, Audit::created(self.now(), actor))?;
        let _claim = self.claim_id(exception.id, |id| self.exception_to_staff.contains_key(id))?;
        let mut locks = self.lock_staff(&[exception.staff_id]).await?;
        let count = locks
            .get(exception.staff_id)
            .map_or(0, |s| s.exceptions().len());
        if count >= MAX_EXCEPTIONS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many exceptions for staff member"));
        }
        self.persist_and_apply(&mut locks, Event::ExceptionStored(exception.clone()), None)
            .await?;
        info!(exception_id = %exception.id, staff_id = %exception.staff_id, kind = exception.kind.as_str(), "exception stored");
        Ok(exception)
    }

    pub async fn update_exception(
        &self,
        req: NewException,
        actor: Option<String>,
    ) -> Result<AvailabilityException, EngineError> {
        check_actor(&actor)?;
        let staff_id = self
            .exception_to_staff
            .get(&req.id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Exception, req.id))?;
        if staff_id != req.staff_id {
            return Err(ValidationError::StaffMismatch(req.id).into());
        }
        let mut locks = self.lock_staff(&[staff_id]).await?;
        let mut audit = locks
            .get(staff_id)
            .and_then(|s| s.exception(req.id))
            .filter(|e| !e.audit.is_deleted())
            .map(|e| e.audit.clone())
            .ok_or(EngineError::NotFound(Entity::Exception, req.id))?;
        audit.touch(self.now(), actor);
        let exception = self.build_exception(req, audit)?;
        self.persist_and_apply(&mut locks, Event::ExceptionStored(exception.clone()), None)
            .await?;
        Ok(exception)
    }

    pub async fn delete_exception(&self, id: Ulid, actor: Option<String>) -> Result<(), EngineError> {
        check_actor(&actor)?;
        let staff_id = self
            .exception_to_staff
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Exception, id))?;
        let mut locks = self.lock_staff(&[staff_id]).await?;
        let live = locks
            .get(staff_id)
            .and_then(|s| s.exception(id))
            .is_some_and(|e| !e.audit.is_deleted());
        if !live {
            return Err(EngineError::NotFound(Entity::Exception, id));
        }
        let event = Event::ExceptionDeleted {
            id,
            staff_id,
            at: self.now(),
            by: actor,
        };
        self.persist_and_apply(&mut locks, event, None).await?;
        info!(exception_id = %id, "exception deleted");
        Ok(())
    }
}
