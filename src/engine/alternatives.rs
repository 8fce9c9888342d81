use chrono::{NaiveDate, NaiveDateTime};

use super::availability::first_available_slot;
use super::conflict::{DayView, covering_end};
use super::hours::next_working_day;
use super::snapshot::EngineSnapshot;
use crate::model::*;
use crate::time::{SLOT_GRANULARITY, round_down_to_grid, round_up_to_grid};

/// Nearby bookable slots for a request that was turned down. Each probe runs
/// independently; all of them test candidates with `DayView::verdict`.
pub fn find_alternatives(
    snapshot: &EngineSnapshot,
    date: NaiveDate,
    start: Minutes,
    duration: Minutes,
    now: NaiveDateTime,
) -> Alternatives {
    let day = snapshot.day(date, now);
    let (same_day_before, same_day_after) = match day.hours {
        DayHours::Open { open, close } => (
            before(&day, open, start, duration),
            after(&day, close, start, duration),
        ),
        DayHours::Closed => (None, None),
    };

    let mut alternatives = Alternatives {
        same_day_before,
        same_day_after,
        ..Alternatives::default()
    };

    if let Some(next) = next_working_day(&snapshot.config, date) {
        let next_day = snapshot.day(next, now);
        let first_open = first_available_slot(&next_day, duration);
        alternatives.next_day_first_open = first_open.map(|s| Slot::new(next, s));
        if first_open != Some(start) && next_day.verdict(start, duration).is_bookable() {
            alternatives.next_day_same_time = Some(Slot::new(next, start));
        }
    }
    alternatives
}

/// Latest bookable start earlier than `start`, scanning down to opening.
fn before(day: &DayView<'_>, open: Minutes, start: Minutes, duration: Minutes) -> Option<Slot> {
    std::iter::successors(Some(round_down_to_grid(start - 1)), |s| {
        Some(s - SLOT_GRANULARITY)
    })
    .take_while(|s| *s >= open)
    .find(|s| day.verdict(*s, duration).is_bookable())
    .map(|s| Slot::new(day.date, s))
}

/// Earliest bookable start after `start`. Scanning begins past whatever
/// occupies `start`.
fn after(day: &DayView<'_>, close: Minutes, start: Minutes, duration: Minutes) -> Option<Slot> {
    let from = covering_end(day.ranges, start)
        .map(round_up_to_grid)
        .unwrap_or_else(|| round_up_to_grid(start + 1));
    std::iter::successors(Some(from), |s| Some(s + SLOT_GRANULARITY))
        .take_while(|s| s + duration <= close)
        .find(|s| day.verdict(*s, duration).is_bookable())
        .map(|s| Slot::new(day.date, s))
}
