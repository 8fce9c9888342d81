use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Days, NaiveDate, NaiveDateTime};
use tokio::time::Instant;

use super::aggregate::Aggregate;
use super::availability::DayAvailability;
use super::conflict::DayView;
use super::hours::hours_for;
use super::index::{self, OccupiedIndex};
use crate::model::*;
use crate::time::{minutes_of, round_up_to_grid};

/// Immutable view of one tenant's schedule. Replaced wholesale on refresh,
/// shared by `Arc` with every in-flight reader.
#[derive(Debug)]
pub struct EngineSnapshot {
    pub config: Arc<TenantConfig>,
    /// First date covered (the local date at build time).
    pub loaded_from: NaiveDate,
    /// Last date covered, inclusive.
    pub loaded_to: NaiveDate,
    /// Local wall-clock time the snapshot was built at.
    pub built_local: NaiveDateTime,
    pub commitments: Vec<Commitment>,
    pub occupied: OccupiedIndex,
    /// Slots at the default duration for every covered date.
    pub precomputed: BTreeMap<NaiveDate, DayAvailability>,
    pub feed_status: FeedStatus,
    pub generation: u64,
    pub built_at: Instant,
}

impl EngineSnapshot {
    pub fn build(
        config: Arc<TenantConfig>,
        aggregate: Aggregate,
        now: NaiveDateTime,
        window_days: u32,
        generation: u64,
    ) -> Self {
        let today = now.date();
        let loaded_to = today
            .checked_add_days(Days::new(u64::from(window_days)))
            .unwrap_or(today);
        let occupied = index::build(&aggregate.commitments, config.buffer_minutes);

        let mut snapshot = Self {
            config,
            loaded_from: today,
            loaded_to,
            built_local: now,
            commitments: aggregate.commitments,
            occupied,
            precomputed: BTreeMap::new(),
            feed_status: aggregate.feed_status,
            generation,
            built_at: Instant::now(),
        };

        let duration = snapshot.default_duration();
        let precomputed = snapshot
            .dates()
            .map(|date| {
                let view = snapshot.day(date, now);
                (date, DayAvailability::compute(&view, duration))
            })
            .collect();
        snapshot.precomputed = precomputed;
        snapshot
    }

    /// Covered dates, ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let to = self.loaded_to;
        self.loaded_from.iter_days().take_while(move |d| *d <= to)
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.loaded_from && date <= self.loaded_to
    }

    pub fn ranges(&self, date: NaiveDate) -> &[OccupiedRange] {
        self.occupied.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_duration(&self) -> Minutes {
        self.config.duration_mode.default_duration()
    }

    /// Everything needed to judge slots on `date` as of `now`.
    pub fn day(&self, date: NaiveDate, now: NaiveDateTime) -> DayView<'_> {
        let today = now.date();
        let earliest = if date == today {
            round_up_to_grid(minutes_of(now.time()))
        } else {
            0
        };
        DayView {
            date,
            today,
            hours: hours_for(&self.config, date),
            ranges: self.ranges(date),
            covered: self.covers(date),
            earliest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday_at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn commitment(date: NaiveDate, start: Minutes, duration: Minutes) -> Commitment {
        Commitment {
            date,
            start,
            duration,
            source: Source::Local,
            label: "Ana".into(),
        }
    }

    fn snapshot(commitments: Vec<Commitment>, now: NaiveDateTime) -> EngineSnapshot {
        EngineSnapshot::build(
            Arc::new(TenantConfig::default()),
            Aggregate {
                commitments,
                feed_status: FeedStatus::Ok,
            },
            now,
            7,
            1,
        )
    }

    #[test]
    fn covers_rolling_window() {
        let s = snapshot(vec![], monday_at(8, 0));
        assert_eq!(s.dates().count(), 8);
        assert_eq!(s.precomputed.len(), 8);
        assert!(s.covers(monday_at(0, 0).date()));
        assert!(!s.covers(NaiveDate::from_ymd_opt(2026, 10, 27).unwrap()));
    }

    #[test]
    fn today_is_bounded_by_clock() {
        let s = snapshot(vec![], monday_at(14, 33));
        let view = s.day(monday_at(0, 0).date(), monday_at(14, 33));
        assert_eq!(view.earliest, 880);
        let today = &s.precomputed[&monday_at(0, 0).date()];
        assert_eq!(today.slots.first(), Some(&880));
    }

    #[test]
    fn precomputed_reflects_commitments() {
        let date = monday_at(0, 0).date();
        let s = snapshot(vec![commitment(date, 600, 60)], monday_at(8, 0));
        let slots = &s.precomputed[&date].slots;
        assert!(!slots.contains(&600));
        assert!(slots.contains(&660));
        assert_eq!(s.ranges(date).len(), 1);
        assert!(s.ranges(date.succ_opt().unwrap()).is_empty());
    }
}
