//! Data-source seams. One object per deployment; the tenant id travels with
//! every call. In-memory implementations back the tests and the bench.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_COMMITMENTS_PER_TENANT;
use crate::model::{Minutes, Source};
use crate::profile::TenantConfigRecord;
use crate::time::format_clock;

/// A locally stored commitment, as persisted. Times stay in their raw form
/// until the aggregator normalizes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRecord {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start_time: String,
    pub duration_minutes: Option<Minutes>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommitment {
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration: Minutes,
    pub label: String,
}

/// An event from the external calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub start: DateTime<FixedOffset>,
    pub end: Option<DateTime<FixedOffset>>,
    pub all_day: bool,
    pub title: Option<String>,
}

#[async_trait]
pub trait CommitmentStore: Send + Sync {
    /// Records dated within `[from, to]` inclusive.
    async fn list_commitments(
        &self,
        tenant: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CommitmentRecord>, EngineError>;

    async fn insert_commitment(
        &self,
        tenant: &str,
        commitment: NewCommitment,
    ) -> Result<Ulid, EngineError>;

    /// `Ok(false)` when no such commitment exists.
    async fn cancel_commitment(&self, tenant: &str, id: Ulid) -> Result<bool, EngineError>;

    /// The tenant's engine was evicted; drop whatever is held for it.
    fn release(&self, _tenant: &str) {}
}

#[async_trait]
pub trait CalendarFeed: Send + Sync {
    async fn list_events(
        &self,
        tenant: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, EngineError>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, tenant: &str) -> Result<TenantConfigRecord, EngineError>;
}

/// The three collaborators an engine reads from.
#[derive(Clone)]
pub struct Sources {
    pub commitments: Arc<dyn CommitmentStore>,
    pub calendar: Arc<dyn CalendarFeed>,
    pub config: Arc<dyn ConfigStore>,
}

// ── In-memory implementations ─────────────────────────────────────

/// Commitment store held in a map. Can be told to fail or to lag, and counts
/// list calls.
#[derive(Default)]
pub struct MemoryCommitmentStore {
    records: DashMap<String, Vec<CommitmentRecord>>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    list_calls: AtomicU64,
}

impl MemoryCommitmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw record, bypassing all checks.
    pub fn seed(&self, tenant: &str, record: CommitmentRecord) {
        self.records.entry(tenant.to_string()).or_default().push(record);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    fn check_failing(&self) -> Result<(), EngineError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::SourceUnavailable(
                Source::Local,
                "store offline".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CommitmentStore for MemoryCommitmentStore {
    async fn list_commitments(
        &self,
        tenant: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CommitmentRecord>, EngineError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_failing()?;
        Ok(self
            .records
            .get(tenant)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.date >= from && r.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_commitment(
        &self,
        tenant: &str,
        commitment: NewCommitment,
    ) -> Result<Ulid, EngineError> {
        self.check_failing()?;
        let mut records = self.records.entry(tenant.to_string()).or_default();
        if records.len() >= MAX_COMMITMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many commitments"));
        }
        let id = Ulid::new();
        records.push(CommitmentRecord {
            id,
            date: commitment.date,
            start_time: format_clock(commitment.start),
            duration_minutes: Some(commitment.duration),
            label: commitment.label,
        });
        Ok(id)
    }

    async fn cancel_commitment(&self, tenant: &str, id: Ulid) -> Result<bool, EngineError> {
        self.check_failing()?;
        let Some(mut records) = self.records.get_mut(tenant) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }
}

/// Calendar feed serving canned events per tenant.
#[derive(Default)]
pub struct StaticCalendarFeed {
    events: DashMap<String, Vec<ExternalEvent>>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
}

impl StaticCalendarFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tenant: &str, event: ExternalEvent) {
        self.events.entry(tenant.to_string()).or_default().push(event);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl CalendarFeed for StaticCalendarFeed {
    async fn list_events(
        &self,
        tenant: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, EngineError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::SourceUnavailable(
                Source::External,
                "calendar offline".into(),
            ));
        }
        Ok(self
            .events
            .get(tenant)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.start >= time_min && e.start < time_max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Feed used when no external calendar is configured.
pub struct NoCalendarFeed;

#[async_trait]
impl CalendarFeed for NoCalendarFeed {
    async fn list_events(
        &self,
        _tenant: &str,
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, EngineError> {
        Ok(Vec::new())
    }
}

/// Config store holding raw records per tenant. Unknown tenants get an empty
/// record, which normalizes to defaults.
#[derive(Default)]
pub struct MemoryConfigStore {
    records: DashMap<String, TenantConfigRecord>,
    failing: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tenant: &str, record: TenantConfigRecord) {
        self.records.insert(tenant.to_string(), record);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_config(&self, tenant: &str) -> Result<TenantConfigRecord, EngineError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::ConfigUnavailable("config store offline".into()));
        }
        Ok(self
            .records
            .get(tenant)
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}
