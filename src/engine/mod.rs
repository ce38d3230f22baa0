mod availability;
mod buffer;
mod clock;
mod completion;
mod conflict;
mod directory;
mod error;
mod lifecycle;
mod queries;
mod schedule;

pub use availability::{
    busy_spans, free_intervals, merge_overlapping, open_slots, resolve_unavailable,
    subtract_intervals,
};
pub use buffer::expand as expand_buffers;
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{Assessment, COMPLETION_GRACE_MS, CompletionPolicy, REMINDER_AFTER_MS, assess};
pub use conflict::{Conflict, ConflictSource, find_conflict, has_conflict};
pub use directory::NewException;
pub use error::{EngineError, Entity, ValidationError};
pub use lifecycle::{NewAppointment, NewLine};
pub use queries::{AppointmentFilter, CalendarEntry};
pub use schedule::{Occupancy, StaffSchedule};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::recurrence::{RRuleEvaluator, RecurrenceEvaluator};
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<StaffSchedule>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an operation waits for a staff member's schedule lock.
    pub lock_timeout: Duration,
    pub completion: CompletionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            completion: CompletionPolicy::default(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then makes the whole batch durable with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

// ── Locked schedules ─────────────────────────────────────

/// Write guards for every staff member an operation touches, taken in ULID
/// order.
pub(crate) struct LockedSchedules {
    guards: Vec<OwnedRwLockWriteGuard<StaffSchedule>>,
}

impl LockedSchedules {
    fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub(crate) fn get(&self, staff_id: Ulid) -> Option<&StaffSchedule> {
        self.guards.iter().find(|g| g.id == staff_id).map(|g| &**g)
    }

    pub(crate) fn get_mut(&mut self, staff_id: Ulid) -> Option<&mut StaffSchedule> {
        self.guards
            .iter_mut()
            .find(|g| g.id == staff_id)
            .map(|g| &mut **g)
    }
}

/// An in-flight claim on the id of a record being created. Dropping it
/// releases the id.
pub(crate) struct IdClaim<'a> {
    claims: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

/// One tenant's scheduling state: staff schedules behind per-staff locks,
/// plus the catalog, appointment and completion records.
pub struct Engine {
    business_id: String,
    pub(super) staff: DashMap<Ulid, SharedSchedule>,
    pub(super) services: DashMap<Ulid, ServiceDefinition>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// Every completion record per appointment; the live one is the last
    /// that is not soft-deleted.
    pub(super) completions: DashMap<Ulid, Vec<ServiceCompletion>>,
    pub(super) exception_to_staff: DashMap<Ulid, Ulid>,
    /// Ids of appointments and exceptions whose creation is in flight.
    /// Creations on different staff members share no lock, so this is what
    /// keeps two of them from storing the same id.
    claimed_ids: DashSet<Ulid>,
    /// Serializes registrations against each other and against compaction.
    pub(super) catalog_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) recurrence: Arc<dyn RecurrenceEvaluator>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        business_id: impl Into<String>,
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            business_id: business_id.into(),
            staff: DashMap::new(),
            services: DashMap::new(),
            appointments: DashMap::new(),
            completions: DashMap::new(),
            exception_to_staff: DashMap::new(),
            claimed_ids: DashSet::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            notify,
            clock: Arc::new(SystemClock),
            recurrence: Arc::new(RRuleEvaluator),
            config,
        };

        // Nothing else can see these schedules yet, so try_write always
        // succeeds; blocking_write would panic inside the runtime.
        for event in &events {
            let mut locks = LockedSchedules::empty();
            for staff_id in engine.event_staff_ids(event) {
                if let Some(schedule) = engine.schedule(staff_id) {
                    let guard = schedule.try_write_owned().map_err(|_| {
                        io::Error::other(format!("schedule {staff_id} busy during replay"))
                    })?;
                    locks.guards.push(guard);
                }
            }
            engine.apply_event(event, &mut locks);
        }
        if !events.is_empty() {
            info!(
                business = %engine.business_id,
                events = events.len(),
                appointments = engine.appointments.len(),
                "replayed WAL"
            );
        }
        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_recurrence(mut self, evaluator: Arc<dyn RecurrenceEvaluator>) -> Self {
        self.recurrence = evaluator;
        self
    }

    pub fn business_id(&self) -> &str {
        &self.business_id
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub(super) fn schedule(&self, staff_id: Ulid) -> Option<SharedSchedule> {
        self.staff.get(&staff_id).map(|e| e.value().clone())
    }

    /// Claim `id` for a new record. Fails if another creation holds the claim
    /// or `exists` finds the id already stored. Hold the claim until the
    /// record is applied.
    pub(super) fn claim_id(
        &self,
        id: Ulid,
        exists: impl FnOnce(&Ulid) -> bool,
    ) -> Result<IdClaim<'_>, EngineError> {
        if !self.claimed_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let claim = IdClaim { claims: &self.claimed_ids, id };
        if exists(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(claim)
    }

    /// Write-lock the given staff members in sorted order, each bounded by the
    /// configured lock timeout.
    pub(crate) async fn lock_staff(&self, ids: &[Ulid]) -> Result<LockedSchedules, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut locks = LockedSchedules { guards: Vec::with_capacity(ids.len()) };
        for id in ids {
            let schedule = self
                .schedule(id)
                .ok_or(EngineError::NotFound(Entity::Staff, id))?;
            let started = Instant::now();
            let guard = tokio::time::timeout(self.config.lock_timeout, schedule.write_owned())
                .await
                .map_err(|_| {
                    metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                    EngineError::ConcurrencyConflict { staff_id: id }
                })?;
            metrics::histogram!(observability::LOCK_WAIT_SECONDS)
                .record(started.elapsed().as_secs_f64());
            locks.guards.push(guard);
        }
        Ok(locks)
    }

    pub(crate) async fn read_staff(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<StaffSchedule>, EngineError> {
        let schedule = self
            .schedule(id)
            .ok_or(EngineError::NotFound(Entity::Staff, id))?;
        tokio::time::timeout(self.config.lock_timeout, schedule.read_owned())
            .await
            .map_err(|_| EngineError::ConcurrencyConflict { staff_id: id })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL append, then apply, then publish. Callers hold the write locks of
    /// every staff member the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        locks: &mut LockedSchedules,
        event: Event,
        signal: Option<Signal>,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_event(&event, locks);
        if let Some(signal) = signal {
            self.publish(signal);
        }
        Ok(())
    }

    pub(super) fn publish(&self, signal: Signal) {
        metrics::counter!(observability::SIGNALS_TOTAL, "kind" => signal.kind()).increment(1);
        self.notify.send(&signal);
    }

    /// Staff schedules an event mutates.
    fn event_staff_ids(&self, event: &Event) -> Vec<Ulid> {
        let of_appointment = |id: &Ulid| {
            self.appointments
                .get(id)
                .map(|a| a.staff_ids())
                .unwrap_or_default()
        };
        match event {
            Event::StaffUpdated { id, .. } => vec![*id],
            Event::ExceptionStored(e) => vec![e.staff_id],
            Event::ExceptionDeleted { staff_id, .. } => vec![*staff_id],
            Event::AppointmentStored(a) => a.staff_ids(),
            Event::Rescheduled { id, successor, .. } => {
                let mut ids = of_appointment(id);
                ids.extend(successor.staff_ids());
                ids.sort();
                ids.dedup();
                ids
            }
            Event::StatusChanged { id, .. }
            | Event::DepositRecorded { id, .. }
            | Event::AppointmentDeleted { id, .. } => of_appointment(id),
            Event::StaffRegistered { .. }
            | Event::ServiceDefined(_)
            | Event::CompletionStored(_) => Vec::new(),
        }
    }

    /// Apply an already-durable event. Shared by replay and the live path.
    pub(crate) fn apply_event(&self, event: &Event, locks: &mut LockedSchedules) {
        match event {
            Event::StaffRegistered { id, name } => {
                let schedule = StaffSchedule::new(*id, name.clone());
                self.staff.insert(*id, Arc::new(RwLock::new(schedule)));
            }
            Event::StaffUpdated { id, name, active } => {
                if let Some(schedule) = locks.get_mut(*id) {
                    schedule.name = name.clone();
                    schedule.active = *active;
                }
            }
            Event::ServiceDefined(service) => {
                self.services.insert(service.id, service.clone());
            }
            Event::ExceptionStored(exception) => {
                if let Some(schedule) = locks.get_mut(exception.staff_id) {
                    schedule.upsert_exception(exception.clone());
                    self.exception_to_staff.insert(exception.id, exception.staff_id);
                }
            }
            Event::ExceptionDeleted { id, staff_id, at, by } => {
                if let Some(exception) = locks.get_mut(*staff_id).and_then(|s| s.exception_mut(*id)) {
                    exception.audit.soft_delete(*at, by.clone());
                }
            }
            Event::AppointmentStored(appointment) => self.store_appointment(appointment, locks),
            Event::StatusChanged { id, status, at, by, reason } => {
                let Some(mut appointment) = self.appointments.get_mut(id) else {
                    return;
                };
                appointment.status = *status;
                match status {
                    AppointmentStatus::Confirmed => appointment.confirmed_at = Some(*at),
                    AppointmentStatus::InProgress => appointment.started_at = Some(*at),
                    AppointmentStatus::Completed => appointment.completed_at = Some(*at),
                    AppointmentStatus::Cancelled => appointment.cancelled_at = Some(*at),
                    AppointmentStatus::NoShow => appointment.no_show_at = Some(*at),
                    AppointmentStatus::Scheduled | AppointmentStatus::Rescheduled => {}
                }
                if reason.is_some() {
                    appointment.cancellation_reason = reason.clone();
                }
                let line_status = LineStatus::for_appointment(*status);
                for line in &mut appointment.lines {
                    line.status = line_status;
                }
                appointment.audit.touch(*at, by.clone());
                let release = !appointment.occupies_schedule();
                drop(appointment);

                if release {
                    Self::release_lines(*id, locks);
                }
                if *status == AppointmentStatus::Completed {
                    self.stamp_completion_date(*id, *at, by);
                }
            }
            Event::Rescheduled { id, successor, at, by } => {
                if let Some(mut original) = self.appointments.get_mut(id) {
                    original.status = AppointmentStatus::Rescheduled;
                    original.rescheduled_to = Some(successor.id);
                    for line in &mut original.lines {
                        line.status = LineStatus::Cancelled;
                    }
                    original.audit.touch(*at, by.clone());
                }
                Self::release_lines(*id, locks);
                self.store_appointment(successor, locks);
            }
            Event::DepositRecorded { id, at, by } => {
                if let Some(mut appointment) = self.appointments.get_mut(id) {
                    appointment.deposit_paid = true;
                    appointment.audit.touch(*at, by.clone());
                }
            }
            Event::AppointmentDeleted { id, at, by } => {
                if let Some(mut appointment) = self.appointments.get_mut(id) {
                    appointment.audit.soft_delete(*at, by.clone());
                }
                Self::release_lines(*id, locks);
            }
            Event::CompletionStored(record) => {
                let mut history = self.completions.entry(record.appointment_id).or_default();
                match history.iter_mut().find(|c| c.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => history.push(record.clone()),
                }
            }
        }
    }

    fn store_appointment(&self, appointment: &Appointment, locks: &mut LockedSchedules) {
        if appointment.occupies_schedule() {
            for (idx, line) in appointment.lines.iter().enumerate() {
                if let Some(schedule) = locks.get_mut(line.staff_id) {
                    schedule.insert_occupancy(Occupancy {
                        appointment_id: appointment.id,
                        line: idx,
                        span: line.span,
                        effective: line.effective,
                    });
                }
            }
        }
        self.appointments.insert(appointment.id, appointment.clone());
    }

    fn release_lines(appointment_id: Ulid, locks: &mut LockedSchedules) {
        for guard in &mut locks.guards {
            guard.release(appointment_id);
        }
    }

    fn stamp_completion_date(&self, appointment_id: Ulid, at: Ms, by: &Option<String>) {
        if let Some(mut history) = self.completions.get_mut(&appointment_id)
            && let Some(live) = history.iter_mut().rev().find(|c| !c.audit.is_deleted())
            && live.completion_date.is_none()
        {
            live.completion_date = Some(at);
            live.audit.touch(at, by.clone());
        }
    }

    /// The live completion record of an appointment, if any.
    pub(super) fn live_completion(&self, appointment_id: Ulid) -> Option<ServiceCompletion> {
        self.completions.get(&appointment_id).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|c| !c.audit.is_deleted())
                .cloned()
        })
    }

    // ── Compaction ───────────────────────────────────────

    /// Events that rebuild the current state, history of soft-deleted rows
    /// included. Caller must hold the catalog lock and every staff lock.
    fn snapshot_events(&self, schedules: &[OwnedRwLockReadGuard<StaffSchedule>]) -> Vec<Event> {
        let mut events = Vec::new();
        for schedule in schedules {
            events.push(Event::StaffRegistered {
                id: schedule.id,
                name: schedule.name.clone(),
            });
            if !schedule.active {
                events.push(Event::StaffUpdated {
                    id: schedule.id,
                    name: schedule.name.clone(),
                    active: false,
                });
            }
        }
        let mut services: Vec<ServiceDefinition> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(Event::ServiceDefined));

        for schedule in schedules {
            events.extend(schedule.exceptions().iter().cloned().map(Event::ExceptionStored));
        }

        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(appointments.into_iter().map(Event::AppointmentStored));

        let mut completions: Vec<ServiceCompletion> = self
            .completions
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        completions.sort_by_key(|c| c.id);
        events.extend(completions.into_iter().map(Event::CompletionStored));
        events
    }

    /// Rewrite the WAL as a snapshot of current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut ids: Vec<Ulid> = self.staff.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            schedules.push(self.read_staff(id).await?);
        }
        let events = self.snapshot_events(&schedules);
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        metrics::counter!(observability::COMPACTIONS_TOTAL).increment(1);
        info!(business = %self.business_id, events = count, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
