use std::sync::Mutex;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::{MINUTES_PER_DAY, Minutes};

/// Candidate slots start on multiples of this many minutes.
pub const SLOT_GRANULARITY: Minutes = 10;

const DAY_NAMES: [&str; 7] = [
    "domingo",
    "segunda-feira",
    "terça-feira",
    "quarta-feira",
    "quinta-feira",
    "sexta-feira",
    "sábado",
];

/// Parse `HH:MM` or `HH:MM:SS` (seconds ignored) into minutes from midnight.
pub fn parse_clock(s: &str) -> Option<Minutes> {
    let mut parts = s.trim().split(':');
    let hours: Minutes = parts.next()?.trim().parse().ok()?;
    let minutes: Minutes = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => 0,
    };
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Render minutes from midnight as `HH:MM`. 1440 renders as `24:00`.
pub fn format_clock(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes.div_euclid(60), minutes.rem_euclid(60))
}

pub fn minutes_of(time: NaiveTime) -> Minutes {
    Minutes::from(time.hour()) * 60 + Minutes::from(time.minute())
}

/// Next grid boundary at or after `minutes`.
pub fn round_up_to_grid(minutes: Minutes) -> Minutes {
    let rem = minutes.rem_euclid(SLOT_GRANULARITY);
    if rem == 0 { minutes } else { minutes + SLOT_GRANULARITY - rem }
}

/// Last grid boundary at or before `minutes`.
pub fn round_down_to_grid(minutes: Minutes) -> Minutes {
    minutes - minutes.rem_euclid(SLOT_GRANULARITY)
}

pub fn is_on_grid(minutes: Minutes) -> bool {
    minutes.rem_euclid(SLOT_GRANULARITY) == 0
}

pub fn is_within_day(minutes: Minutes) -> bool {
    (0..MINUTES_PER_DAY).contains(&minutes)
}

/// Weekday index with 0 = Sunday … 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn weekday_name(index: u8) -> &'static str {
    DAY_NAMES[usize::from(index % 7)]
}

pub fn day_name(date: NaiveDate) -> &'static str {
    weekday_name(weekday_index(date))
}

// ── Clock ────────────────────────────────────────────────────────

/// Source of the current local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock pinned to an explicit time zone.
pub struct ZonedClock {
    tz: Tz,
}

impl ZonedClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for ZonedClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }
}

/// Manually driven clock for tests and benches.
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
