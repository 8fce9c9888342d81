use chrono::NaiveDate;

use crate::model::*;
use crate::time::is_on_grid;

/// Everything needed to judge slots on one date: hours, occupied ranges and
/// the clock-derived lower bound. Built by `EngineSnapshot::day`.
#[derive(Debug, Clone)]
pub struct DayView<'a> {
    pub date: NaiveDate,
    pub today: NaiveDate,
    pub hours: DayHours,
    /// Sorted by `span.start`.
    pub ranges: &'a [OccupiedRange],
    /// Whether the snapshot loaded commitments for this date.
    pub covered: bool,
    /// Earliest start still offered on this date (grid-aligned).
    pub earliest: Minutes,
}

impl DayView<'_> {
    /// Verdict for one explicit request. Slot enumeration filters its
    /// candidates through this same function.
    pub fn verdict(&self, start: Minutes, duration: Minutes) -> Bookability {
        match self.rejection(start, duration) {
            Some(reason) => Bookability::Rejected(reason),
            None => Bookability::Bookable,
        }
    }

    fn rejection(&self, start: Minutes, duration: Minutes) -> Option<Rejection> {
        let (open, close) = match self.hours {
            DayHours::Closed => return Some(Rejection::ClosedDay),
            DayHours::Open { open, close } => (open, close),
        };
        if self.date < self.today {
            return Some(Rejection::PastDate);
        }
        if !self.covered {
            return Some(Rejection::OutsideWindow);
        }
        if start < open {
            return Some(Rejection::BeforeOpen);
        }
        if start + duration > close {
            return Some(Rejection::ExceedsClosing);
        }
        if start < self.earliest {
            return Some(Rejection::InPast);
        }
        if !is_on_grid(start) {
            return Some(Rejection::OffGrid);
        }
        first_conflict(self.ranges, Span::new(start, start + duration)).map(|r| {
            Rejection::Conflict {
                span: r.span,
                label: r.label.clone(),
            }
        })
    }
}

/// First occupied range overlapping `candidate`.
/// Uses binary search to skip ranges starting at or after `candidate.end`.
pub fn first_conflict(ranges: &[OccupiedRange], candidate: Span) -> Option<&OccupiedRange> {
    let right_bound = ranges.partition_point(|r| r.span.start < candidate.end);
    ranges[..right_bound]
        .iter()
        .find(|r| r.span.overlaps(&candidate))
}

/// Latest end among ranges that contain minute `t`.
pub fn covering_end(ranges: &[OccupiedRange], t: Minutes) -> Option<Minutes> {
    let right_bound = ranges.partition_point(|r| r.span.start <= t);
    ranges[..right_bound]
        .iter()
        .filter(|r| r.span.contains_minute(t))
        .map(|r| r.span.end)
        .max()
}
