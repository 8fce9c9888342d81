use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::time::format_clock;

/// Minutes from local midnight. The only clock type.
pub type Minutes = i64;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Service duration used when nothing else is configured or a record omits it.
pub const DEFAULT_DURATION: Minutes = 60;

/// Half-open minute range `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    /// The single overlap test shared by slot enumeration, conflict checks
    /// and the alternative finder.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_minute(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

// ── Tenant configuration ─────────────────────────────────────────

/// Opening and closing time in whole hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourBounds {
    pub open: u32,
    pub close: u32,
}

impl HourBounds {
    pub const fn new(open: u32, close: u32) -> Self {
        Self { open, close }
    }

    pub fn open_minutes(&self) -> Minutes {
        Minutes::from(self.open) * 60
    }

    pub fn close_minutes(&self) -> Minutes {
        Minutes::from(self.close) * 60
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub duration: Minutes,
    pub price: Option<f64>,
}

/// How a tenant sizes its bookings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DurationMode {
    /// Every booking lasts the same number of minutes.
    Fixed(Minutes),
    /// Each service carries its own duration. Never empty.
    PerService(Vec<Product>),
}

impl DurationMode {
    /// Duration used for the precomputed rolling week: the fixed duration,
    /// or the shortest service.
    pub fn default_duration(&self) -> Minutes {
        match self {
            DurationMode::Fixed(minutes) => *minutes,
            DurationMode::PerService(products) => products
                .iter()
                .map(|p| p.duration)
                .min()
                .unwrap_or(DEFAULT_DURATION),
        }
    }

    /// Duration of a specific product, falling back to the default duration.
    pub fn duration_for(&self, product_id: Option<&str>) -> Minutes {
        if let (Some(id), DurationMode::PerService(products)) = (product_id, self)
            && let Some(product) = products.iter().find(|p| p.id == id)
        {
            return product.duration;
        }
        self.default_duration()
    }

    pub fn products(&self) -> &[Product] {
        match self {
            DurationMode::Fixed(_) => &[],
            DurationMode::PerService(products) => products,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub duration_mode: DurationMode,
    /// Weekday (0 = Sunday) → hours overriding `global_hours` for that weekday.
    pub weekday_hours: BTreeMap<u8, HourBounds>,
    /// Weekdays (0 = Sunday) the business opens at all.
    pub working_days: BTreeSet<u8>,
    pub global_hours: HourBounds,
    /// Minutes blocked after every commitment.
    pub buffer_minutes: Minutes,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            duration_mode: DurationMode::Fixed(DEFAULT_DURATION),
            weekday_hours: BTreeMap::new(),
            working_days: (0..7).collect(),
            global_hours: HourBounds::new(9, 18),
            buffer_minutes: 0,
        }
    }
}

// ── Commitments and derived ranges ───────────────────────────────

/// Where a commitment was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Local,
    External,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local => write!(f, "local"),
            Source::External => write!(f, "external"),
        }
    }
}

/// A time-occupying event, normalized from any source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration: Minutes,
    pub source: Source,
    pub label: String,
}

impl Commitment {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + self.duration)
    }
}

/// A commitment's footprint on its date, buffer included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupiedRange {
    pub date: NaiveDate,
    pub span: Span,
    pub label: String,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: Minutes,
}

impl Slot {
    pub fn new(date: NaiveDate, start: Minutes) -> Self {
        Self { date, start }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, format_clock(self.start))
    }
}

/// Effective business hours of one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayHours {
    Open { open: Minutes, close: Minutes },
    Closed,
}

// ── Verdicts ─────────────────────────────────────────────────────

/// Why a requested slot cannot be booked. A normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ClosedDay,
    /// The date precedes today.
    PastDate,
    /// The date lies beyond the loaded commitment window.
    OutsideWindow,
    BeforeOpen,
    ExceedsClosing,
    /// Today, earlier than the next grid slot after the current time.
    InPast,
    /// Start is not on the slot grid.
    OffGrid,
    Conflict { span: Span, label: String },
}

impl Rejection {
    /// Stable short code for wire responses and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::ClosedDay => "closed_day",
            Rejection::PastDate => "past_date",
            Rejection::OutsideWindow => "outside_window",
            Rejection::BeforeOpen => "before_open",
            Rejection::ExceedsClosing => "exceeds_closing",
            Rejection::InPast => "in_past",
            Rejection::OffGrid => "off_grid",
            Rejection::Conflict { .. } => "conflict",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ClosedDay => write!(f, "closed on that day"),
            Rejection::PastDate => write!(f, "date is in the past"),
            Rejection::OutsideWindow => write!(f, "date is beyond the booking window"),
            Rejection::BeforeOpen => write!(f, "starts before opening time"),
            Rejection::ExceedsClosing => write!(f, "ends after closing time"),
            Rejection::InPast => write!(f, "start time has already passed"),
            Rejection::OffGrid => write!(f, "start time is not on the slot grid"),
            Rejection::Conflict { span, label } => write!(f, "conflicts with {span} {label}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bookability {
    Bookable,
    Rejected(Rejection),
}

impl Bookability {
    pub fn is_bookable(&self) -> bool {
        matches!(self, Bookability::Bookable)
    }
}

/// Suggestions offered when a requested slot is rejected. Each field is an
/// independent probe; `None` means nothing viable along that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alternatives {
    pub same_day_before: Option<Slot>,
    pub same_day_after: Option<Slot>,
    pub next_day_first_open: Option<Slot>,
    pub next_day_same_time: Option<Slot>,
}

impl Alternatives {
    pub fn is_empty(&self) -> bool {
        self.same_day_before.is_none()
            && self.same_day_after.is_none()
            && self.next_day_first_open.is_none()
            && self.next_day_same_time.is_none()
    }

    /// Present suggestions labelled by axis, same-day first.
    pub fn labelled(&self) -> Vec<(&'static str, Slot)> {
        [
            ("same_day_before", self.same_day_before),
            ("same_day_after", self.same_day_after),
            ("next_day_first_open", self.next_day_first_open),
            ("next_day_same_time", self.next_day_same_time),
        ]
        .into_iter()
        .filter_map(|(kind, slot)| slot.map(|s| (kind, s)))
        .collect()
    }
}

/// Health of the external calendar feed at the time a snapshot was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Ok,
    /// The feed failed; the snapshot holds local commitments only.
    Degraded(String),
}

/// Why a cached engine must refresh before its next use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    BookingCreated,
    ConfigChanged,
}
