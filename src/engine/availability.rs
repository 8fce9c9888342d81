use chrono::NaiveDate;

use super::conflict::DayView;
use crate::model::*;
use crate::time::{SLOT_GRANULARITY, round_up_to_grid};

// ── Slot enumeration ──────────────────────────────────────────────

/// Grid-aligned starts worth testing on `day`: from the later of opening
/// time and the clock bound, through `close - duration`.
fn candidates(day: &DayView<'_>, duration: Minutes) -> impl Iterator<Item = Minutes> {
    let bounds = match day.hours {
        DayHours::Open { open, close }
            if duration > 0 && day.covered && day.date >= day.today =>
        {
            Some((round_up_to_grid(open.max(day.earliest)), close - duration))
        }
        _ => None,
    };
    let (lower, last) = bounds.unwrap_or((1, 0));
    (lower..=last).step_by(SLOT_GRANULARITY as usize)
}

/// Every free start on `day` for a service of `duration` minutes, ascending.
/// Each candidate passes through the same verdict used for explicit requests.
pub fn available_slots(day: &DayView<'_>, duration: Minutes) -> Vec<Minutes> {
    candidates(day, duration)
        .filter(|&start| day.verdict(start, duration).is_bookable())
        .collect()
}

/// First free start, without materializing the list.
pub fn first_available_slot(day: &DayView<'_>, duration: Minutes) -> Option<Minutes> {
    candidates(day, duration).find(|&start| day.verdict(start, duration).is_bookable())
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Contiguous free windows covered by the slot list: the union of
/// `[slot, slot + duration)`.
pub fn free_windows(slots: &[Minutes], duration: Minutes) -> Vec<Span> {
    if duration <= 0 {
        return Vec::new();
    }
    let spans: Vec<Span> = slots
        .iter()
        .map(|&s| Span::new(s, s + duration))
        .collect();
    merge_overlapping(&spans)
}

/// Precomputed slots of one date at the tenant's default duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub hours: DayHours,
    pub duration: Minutes,
    pub slots: Vec<Minutes>,
}

impl DayAvailability {
    pub fn compute(day: &DayView<'_>, duration: Minutes) -> Self {
        Self {
            date: day.date,
            hours: day.hours,
            duration,
            slots: available_slots(day, duration),
        }
    }

    /// Open, but nothing left to offer.
    pub fn is_fully_booked(&self) -> bool {
        matches!(self.hours, DayHours::Open { .. }) && self.slots.is_empty()
    }

    pub fn free_windows(&self) -> Vec<Span> {
        free_windows(&self.slots, self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn range(start: Minutes, end: Minutes) -> OccupiedRange {
        OccupiedRange {
            date: monday(),
            span: Span::new(start, end),
            label: "busy".into(),
            source: Source::Local,
        }
    }

    fn day(ranges: &[OccupiedRange]) -> DayView<'_> {
        DayView {
            date: monday(),
            today: monday(),
            hours: DayHours::Open { open: 540, close: 1080 },
            ranges,
            covered: true,
            earliest: 0,
        }
    }

    // ── available_slots ────────────────────────────────────

    #[test]
    fn empty_day_full_grid() {
        let slots = available_slots(&day(&[]), 60);
        assert_eq!(slots.first(), Some(&540));
        assert_eq!(slots.last(), Some(&1020));
        assert_eq!(slots.len(), 49);
        assert!(slots.windows(2).all(|w| w[1] - w[0] == SLOT_GRANULARITY));
    }

    #[test]
    fn single_commitment_blocks_overlapping_starts() {
        // 10:00-11:00 booked, 60 minute service.
        let ranges = [range(600, 660)];
        let slots = available_slots(&day(&ranges), 60);
        assert!(slots.contains(&540));
        assert!(!slots.contains(&550));
        assert!(!slots.contains(&600));
        assert!(!slots.contains(&650));
        assert!(slots.contains(&660));
    }

    #[test]
    fn back_to_back_day_is_empty() {
        let ranges: Vec<_> = (0..9).map(|h| range(540 + h * 60, 600 + h * 60)).collect();
        assert!(available_slots(&day(&ranges), 60).is_empty());
        assert_eq!(first_available_slot(&day(&ranges), 60), None);
    }

    #[test]
    fn closed_or_uncovered_day_is_empty() {
        let mut v = day(&[]);
        v.hours = DayHours::Closed;
        assert!(available_slots(&v, 30).is_empty());

        let mut v = day(&[]);
        v.covered = false;
        assert!(available_slots(&v, 30).is_empty());

        let mut v = day(&[]);
        v.today = monday().succ_opt().unwrap();
        assert!(available_slots(&v, 30).is_empty());
    }

    #[test]
    fn service_longer_than_day_is_empty() {
        assert!(available_slots(&day(&[]), 600).is_empty());
        assert!(available_slots(&day(&[]), 0).is_empty());
    }

    #[test]
    fn clock_bound_raises_first_slot() {
        let mut v = day(&[]);
        v.earliest = 14 * 60 + 40;
        assert_eq!(first_available_slot(&v, 30), Some(880));
    }

    #[test]
    fn boundary_fit_at_close() {
        let slots = available_slots(&day(&[]), 30);
        assert_eq!(slots.last(), Some(&1050));
        assert!(day(&[]).verdict(1050, 30).is_bookable());
        assert!(!day(&[]).verdict(1060, 30).is_bookable());
    }

    #[test]
    fn slots_agree_with_verdict() {
        let ranges = [range(600, 630), range(700, 790), range(905, 925)];
        let v = day(&ranges);
        for duration in [10, 30, 45, 60, 90] {
            let slots = available_slots(&v, duration);
            for start in (0..1440).step_by(5) {
                assert_eq!(
                    slots.contains(&start),
                    v.verdict(start, duration).is_bookable(),
                    "start {start} duration {duration}"
                );
            }
        }
    }

    // ── merge_overlapping / free_windows ───────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    #[test]
    fn free_windows_split_around_commitment() {
        let ranges = [range(600, 660)];
        let availability = DayAvailability::compute(&day(&ranges), 60);
        assert_eq!(
            availability.free_windows(),
            vec![Span::new(540, 600), Span::new(660, 1080)]
        );
        assert!(!availability.is_fully_booked());
    }

    #[test]
    fn fully_booked_only_when_open() {
        let ranges = [range(540, 1080)];
        assert!(DayAvailability::compute(&day(&ranges), 30).is_fully_booked());

        let mut closed = day(&[]);
        closed.hours = DayHours::Closed;
        assert!(!DayAvailability::compute(&closed, 30).is_fully_booked());
    }
}
