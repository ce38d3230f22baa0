use ulid::Ulid;

use crate::limits::{MAX_APPOINTMENT_DURATION_MS, MAX_BUFFER_MINUTES};
use crate::model::*;

/// Longest effective window any line can have; bounds the backwards scan in
/// [`StaffSchedule::overlapping`].
const MAX_EFFECTIVE_MS: Ms = MAX_APPOINTMENT_DURATION_MS + 2 * MAX_BUFFER_MINUTES * MINUTE;

/// One appointment line holding a staff member's time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub appointment_id: Ulid,
    pub line: usize,
    pub span: Span,
    pub effective: Span,
}

/// Everything the conflict check needs for one staff member. Guarded by the
/// per-staff lock; only live appointment lines are kept here.
#[derive(Debug, Clone)]
pub struct StaffSchedule {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// Sorted by `effective.start`.
    occupancies: Vec<Occupancy>,
    /// Includes soft-deleted exceptions.
    exceptions: Vec<AvailabilityException>,
}

impl StaffSchedule {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            active: true,
            occupancies: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    pub fn info(&self) -> StaffInfo {
        StaffInfo {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
        }
    }

    pub fn occupancies(&self) -> &[Occupancy] {
        &self.occupancies
    }

    pub fn insert_occupancy(&mut self, occupancy: Occupancy) {
        let pos = self
            .occupancies
            .partition_point(|o| o.effective.start <= occupancy.effective.start);
        self.occupancies.insert(pos, occupancy);
    }

    pub fn release(&mut self, appointment_id: Ulid) {
        self.occupancies.retain(|o| o.appointment_id != appointment_id);
    }

    /// Occupancies whose effective window overlaps `query`.
    pub fn overlapping<'a>(&'a self, query: &'a Span) -> impl Iterator<Item = &'a Occupancy> + 'a {
        let from = self
            .occupancies
            .partition_point(|o| o.effective.start < query.start - MAX_EFFECTIVE_MS);
        self.occupancies[from..]
            .iter()
            .take_while(move |o| o.effective.start < query.end)
            .filter(move |o| o.effective.overlaps(query))
    }

    pub fn exceptions(&self) -> &[AvailabilityException] {
        &self.exceptions
    }

    pub fn live_exceptions(&self) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions.iter().filter(|e| !e.audit.is_deleted())
    }

    pub fn exception(&self, id: Ulid) -> Option<&AvailabilityException> {
        self.exceptions.iter().find(|e| e.id == id)
    }

    pub fn exception_mut(&mut self, id: Ulid) -> Option<&mut AvailabilityException> {
        self.exceptions.iter_mut().find(|e| e.id == id)
    }

    pub fn upsert_exception(&mut self, exception: AvailabilityException) {
        match self.exception_mut(exception.id) {
            Some(existing) => *existing = exception,
            None => self.exceptions.push(exception),
        }
    }
}
