use tracing::warn;

use crate::model::*;
use crate::recurrence::RecurrenceEvaluator;

use super::buffer;

/// Resolve a staff member's unavailable intervals inside `window`, ordered by
/// start. Soft-deleted exceptions are skipped.
pub fn resolve_unavailable<'a>(
    exceptions: impl IntoIterator<Item = &'a AvailabilityException>,
    window: Span,
    evaluator: &dyn RecurrenceEvaluator,
) -> Vec<UnavailableInterval> {
    let mut out = Vec::new();
    for exception in exceptions {
        if exception.audit.is_deleted() {
            continue;
        }
        for span in blocked_spans(exception, window, evaluator) {
            if let Some(span) = span.clamp_to(&window) {
                out.push(UnavailableInterval {
                    exception_id: exception.id,
                    kind: exception.kind,
                    span,
                });
            }
        }
    }
    out.sort_by_key(|u| (u.span.start, u.span.end));
    out
}

/// Spans an exception blocks, before clamping. May reach outside `window`.
fn blocked_spans(
    exception: &AvailabilityException,
    window: Span,
    evaluator: &dyn RecurrenceEvaluator,
) -> Vec<Span> {
    let seed = if exception.full_day {
        exception.span.to_full_days()
    } else {
        exception.span
    };
    let custom_hours = exception.kind == ExceptionKind::CustomHours;

    let occurrences = match &exception.recurrence_rule {
        None => vec![seed],
        Some(rule) => {
            // Custom hours block the rest of each covered day, so an occurrence
            // up to a day outside the window can still matter.
            let search = if custom_hours {
                Span::new(window.start - DAY, window.end + DAY)
            } else {
                window
            };
            match evaluator.occurrences(rule, seed, search) {
                Ok(occurrences) => occurrences,
                Err(e) => {
                    warn!(
                        exception_id = %exception.id,
                        "recurrence rule could not be evaluated, using stored span: {e}"
                    );
                    vec![seed]
                }
            }
        }
    };

    if !custom_hours {
        return occurrences;
    }
    occurrences
        .iter()
        .flat_map(|working| subtract_intervals(&[working.to_full_days()], &[*working]))
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `base` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut first = 0;

    for &b in base {
        let mut cursor = b.start;
        while first < to_remove.len() && to_remove[first].end <= cursor {
            first += 1;
        }
        for r in to_remove[first..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }
    result
}

/// Sorted, merged union of everything that blocks a staff member.
pub fn busy_spans(occupied: impl IntoIterator<Item = Span>, unavailable: &[UnavailableInterval]) -> Vec<Span> {
    let mut busy: Vec<Span> = occupied.into_iter().collect();
    busy.extend(unavailable.iter().map(|u| u.span));
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Free time in `window` given merged busy spans.
pub fn free_intervals(busy: &[Span], window: Span) -> Vec<Span> {
    subtract_intervals(&[window], busy)
}

/// Bookable requested windows of `duration` starting every `step` from
/// `window.start`, whose buffer-expanded window avoids every busy span.
/// Requested windows must end inside `window`; buffers may reach outside it.
pub fn open_slots(
    busy: &[Span],
    window: Span,
    duration: Ms,
    prep_minutes: i64,
    cleanup_minutes: i64,
    step: Ms,
    max: usize,
) -> Vec<Span> {
    let mut slots = Vec::new();
    if duration <= 0 || step <= 0 {
        return slots;
    }
    let mut first_busy = 0;
    let mut start = window.start;
    while slots.len() < max {
        let Some(end) = start.checked_add(duration).filter(|end| *end <= window.end) else {
            break;
        };
        let requested = Span::new(start, end);
        let effective = buffer::expand_by(requested, prep_minutes, cleanup_minutes);
        while first_busy < busy.len() && busy[first_busy].end <= effective.start {
            first_busy += 1;
        }
        let blocked = busy[first_busy..]
            .iter()
            .take_while(|b| b.start < effective.end)
            .any(|b| b.overlaps(&effective));
        if !blocked {
            slots.push(requested);
        }
        let Some(next) = start.checked_add(step) else {
            break;
        };
        start = next;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::{RRuleEvaluator, RecurrenceError};
    use ulid::Ulid;

    const D: Ms = 20_000 * DAY;

    fn exception(kind: ExceptionKind, span: Span, full_day: bool, rule: Option<&str>) -> AvailabilityException {
        AvailabilityException {
            id: Ulid::new(),
            business_id: "biz".into(),
            staff_id: Ulid::new(),
            kind,
            span,
            full_day,
            recurrence_rule: rule.map(str::to_string),
            notes: None,
            audit: Audit::default(),
        }
    }

    struct Broken;

    impl RecurrenceEvaluator for Broken {
        fn validate(&self, _: &str, _: Span) -> Result<(), RecurrenceError> {
            Ok(())
        }
        fn occurrences(&self, _: &str, _: Span, _: Span) -> Result<Vec<Span>, RecurrenceError> {
            Err(RecurrenceError::MissingFrequency)
        }
    }

    #[test]
    fn no_exceptions_means_nothing_unavailable() {
        let out = resolve_unavailable(&[], Span::new(D, D + DAY), &RRuleEvaluator);
        assert!(out.is_empty());
    }

    #[test]
    fn one_off_exception_is_clamped() {
        let ex = exception(ExceptionKind::TimeOff, Span::new(D + 8 * HOUR, D + 20 * HOUR), false, None);
        let out = resolve_unavailable([&ex], Span::new(D + 12 * HOUR, D + DAY), &RRuleEvaluator);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, Span::new(D + 12 * HOUR, D + 20 * HOUR));
        assert_eq!(out[0].exception_id, ex.id);
    }

    #[test]
    fn full_day_expands_to_whole_days() {
        let ex = exception(ExceptionKind::TimeOff, Span::new(D + 9 * HOUR, D + 10 * HOUR), true, None);
        let out = resolve_unavailable([&ex], Span::new(D - DAY, D + 2 * DAY), &RRuleEvaluator);
        assert_eq!(out[0].span, Span::new(D, D + DAY));
    }

    #[test]
    fn soft_deleted_exceptions_are_ignored() {
        let mut ex = exception(ExceptionKind::Holiday, Span::new(D, D + DAY), false, None);
        ex.audit.soft_delete(1, None);
        assert!(resolve_unavailable([&ex], Span::new(D, D + DAY), &RRuleEvaluator).is_empty());
    }

    #[test]
    fn recurring_exception_applies_outside_stored_span() {
        let ex = exception(
            ExceptionKind::TimeOff,
            Span::new(D + 12 * HOUR, D + 13 * HOUR),
            false,
            Some("FREQ=DAILY"),
        );
        let window = Span::new(D + 30 * DAY, D + 31 * DAY);
        let out = resolve_unavailable([&ex], window, &RRuleEvaluator);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, Span::new(D + 30 * DAY + 12 * HOUR, D + 30 * DAY + 13 * HOUR));
    }

    #[test]
    fn broken_rule_falls_back_to_stored_span() {
        let ex = exception(ExceptionKind::TimeOff, Span::new(D, D + HOUR), false, Some("FREQ=DAILY"));
        let out = resolve_unavailable([&ex], Span::new(D, D + 5 * DAY), &Broken);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, Span::new(D, D + HOUR));
    }

    #[test]
    fn custom_hours_block_rest_of_day() {
        let ex = exception(ExceptionKind::CustomHours, Span::new(D + 10 * HOUR, D + 14 * HOUR), false, None);
        let out = resolve_unavailable([&ex], Span::new(D - DAY, D + 2 * DAY), &RRuleEvaluator);
        let spans: Vec<Span> = out.iter().map(|u| u.span).collect();
        assert_eq!(spans, vec![Span::new(D, D + 10 * HOUR), Span::new(D + 14 * HOUR, D + DAY)]);
    }

    #[test]
    fn recurring_custom_hours_near_window_edge() {
        // Working 10:00-14:00 every day; window starts mid-afternoon.
        let ex = exception(
            ExceptionKind::CustomHours,
            Span::new(D + 10 * HOUR, D + 14 * HOUR),
            false,
            Some("FREQ=DAILY"),
        );
        let window = Span::new(D + 5 * DAY + 15 * HOUR, D + 5 * DAY + 16 * HOUR);
        let out = resolve_unavailable([&ex], window, &RRuleEvaluator);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, window);
    }

    #[test]
    fn merge_and_subtract() {
        let merged = merge_overlapping(&[Span::new(0, 10), Span::new(5, 20), Span::new(20, 25), Span::new(30, 40)]);
        assert_eq!(merged, vec![Span::new(0, 25), Span::new(30, 40)]);
        let free = subtract_intervals(&[Span::new(0, 100)], &merged);
        assert_eq!(free, vec![Span::new(25, 30), Span::new(40, 100)]);
    }

    #[test]
    fn open_slots_respect_buffers() {
        // Busy 10:00-11:10; 60-minute service with 10 minutes cleanup.
        let busy = [Span::new(10 * HOUR, 11 * HOUR + 10 * MINUTE)];
        let window = Span::new(9 * HOUR, 13 * HOUR);
        let slots = open_slots(&busy, window, HOUR, 0, 10, 15 * MINUTE, 100);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        // 9:00 ends 10:00 but cleanup runs to 10:10, so it is rejected.
        assert_eq!(
            starts,
            vec![11 * HOUR + 15 * MINUTE, 11 * HOUR + 30 * MINUTE, 11 * HOUR + 45 * MINUTE, 12 * HOUR]
        );
    }

    #[test]
    fn open_slots_cap() {
        let slots = open_slots(&[], Span::new(0, DAY), HOUR, 0, 0, MINUTE, 5);
        assert_eq!(slots.len(), 5);
    }

    #[test]
    fn open_slots_stop_at_the_end_of_time() {
        let window = Span::new(i64::MAX - DAY, i64::MAX);
        let slots = open_slots(&[], window, HOUR, 0, 0, i64::MAX, 10);
        assert_eq!(slots, vec![Span::new(i64::MAX - DAY, i64::MAX - DAY + HOUR)]);
        assert!(open_slots(&[], window, i64::MAX, 0, 0, HOUR, 10).is_empty());
    }
}
