mod aggregate;
mod alternatives;
mod availability;
mod conflict;
mod context;
mod error;
mod hours;
mod index;
mod mutations;
mod queries;
mod snapshot;

pub use aggregate::{Aggregate, local_midnight_utc};
pub use alternatives::find_alternatives;
pub use availability::{
    DayAvailability, available_slots, first_available_slot, free_windows, merge_overlapping,
};
pub use conflict::{DayView, first_conflict};
pub use context::{CLOSED, FULLY_BOOKED, render};
pub use error::EngineError;
pub use hours::{hours_for, next_working_day};
pub use mutations::{BookingOutcome, BookingRequest};
pub use snapshot::EngineSnapshot;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::profile::normalize;
use crate::source::Sources;
use crate::time::Clock;

/// Knobs shared by every engine of a deployment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Days after today covered by a snapshot (today included on top).
    pub window_days: u32,
    pub timezone: Tz,
    pub external_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_days: 7,
            timezone: chrono_tz::Europe::Lisbon,
            external_timeout: Duration::from_secs(3),
        }
    }
}

/// One tenant's availability engine: owns the current snapshot and the
/// machinery to rebuild it.
pub struct Engine {
    tenant: String,
    sources: Sources,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    snapshot: RwLock<Arc<EngineSnapshot>>,
    /// Held for the whole of a rebuild; waiters reuse its result.
    refresh_gate: Mutex<()>,
    /// Tickets handed to refresh callers.
    refresh_requested: AtomicU64,
    /// Highest ticket whose request is reflected in the current snapshot.
    refresh_served: AtomicU64,
    generation: AtomicU64,
    stale: AtomicBool,
    config_stale: AtomicBool,
    /// Serializes check-then-insert for bookings.
    booking_gate: Mutex<()>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last use.
    last_used_ms: AtomicU64,
}

impl Engine {
    /// Load configuration and commitments concurrently and build the first
    /// snapshot. A missing or broken configuration falls back to defaults.
    pub async fn initialize(
        tenant: &str,
        sources: Sources,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let now = clock.now();
        let (config, aggregate) = tokio::join!(
            sources.config.get_config(tenant),
            aggregate::load(
                &sources,
                tenant,
                now.date(),
                settings.window_days,
                settings.timezone,
                settings.external_timeout,
            ),
        );
        let config = match config {
            Ok(record) => normalize(&record),
            Err(e) => {
                warn!(tenant, error = %e, "tenant configuration unavailable, using defaults");
                TenantConfig::default()
            }
        };
        let aggregate = aggregate?;

        let snapshot = EngineSnapshot::build(
            Arc::new(config),
            aggregate,
            now,
            settings.window_days,
            1,
        );
        info!(
            tenant,
            commitments = snapshot.commitments.len(),
            degraded = matches!(snapshot.feed_status, FeedStatus::Degraded(_)),
            "engine initialized"
        );

        Ok(Self {
            tenant: tenant.to_string(),
            sources,
            clock,
            settings,
            snapshot: RwLock::new(Arc::new(snapshot)),
            refresh_gate: Mutex::new(()),
            refresh_requested: AtomicU64::new(0),
            refresh_served: AtomicU64::new(0),
            generation: AtomicU64::new(1),
            stale: AtomicBool::new(false),
            config_stale: AtomicBool::new(false),
            booking_gate: Mutex::new(()),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Current snapshot. Readers keep theirs even if a refresh swaps it.
    pub async fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Rebuild the snapshot from the sources.
    ///
    /// Single-flight: callers arriving while a rebuild runs wait for it and
    /// then reuse the result if that rebuild started after they asked. On
    /// failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<EngineSnapshot>, EngineError> {
        let ticket = self.refresh_requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _gate = self.refresh_gate.lock().await;
        if self.refresh_served.load(Ordering::SeqCst) >= ticket {
            metrics::counter!(crate::observability::REFRESHES_TOTAL, "outcome" => "coalesced")
                .increment(1);
            return Ok(self.snapshot().await);
        }
        let covered = self.refresh_requested.load(Ordering::SeqCst);
        let snapshot = self.rebuild().await?;
        self.refresh_served.store(covered, Ordering::SeqCst);
        Ok(snapshot)
    }

    async fn rebuild(&self) -> Result<Arc<EngineSnapshot>, EngineError> {
        let start = std::time::Instant::now();
        let reload_config = self.config_stale.swap(false, Ordering::SeqCst);
        let was_stale = self.stale.swap(false, Ordering::SeqCst);
        let now = self.clock.now();

        let (config, aggregate) = tokio::join!(
            async {
                if reload_config {
                    Some(self.sources.config.get_config(&self.tenant).await)
                } else {
                    None
                }
            },
            aggregate::load(
                &self.sources,
                &self.tenant,
                now.date(),
                self.settings.window_days,
                self.settings.timezone,
                self.settings.external_timeout,
            ),
        );

        let aggregate = match aggregate {
            Ok(aggregate) => aggregate,
            Err(e) => {
                self.stale.fetch_or(was_stale, Ordering::SeqCst);
                self.config_stale.fetch_or(reload_config, Ordering::SeqCst);
                metrics::counter!(crate::observability::REFRESHES_TOTAL, "outcome" => "failed")
                    .increment(1);
                warn!(tenant = %self.tenant, error = %e, "refresh failed, keeping previous snapshot");
                return Err(e);
            }
        };

        let current = self.snapshot().await;
        let config = match config {
            None => current.config.clone(),
            Some(Ok(record)) => Arc::new(normalize(&record)),
            Some(Err(e)) => {
                self.config_stale.store(true, Ordering::SeqCst);
                warn!(tenant = %self.tenant, error = %e, "configuration reload failed, keeping previous");
                current.config.clone()
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(EngineSnapshot::build(
            config,
            aggregate,
            now,
            self.settings.window_days,
            generation,
        ));
        *self.snapshot.write().await = snapshot.clone();

        metrics::counter!(crate::observability::REFRESHES_TOTAL, "outcome" => "ok").increment(1);
        metrics::histogram!(crate::observability::REFRESH_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        debug!(
            tenant = %self.tenant,
            generation,
            commitments = snapshot.commitments.len(),
            "snapshot rebuilt"
        );
        Ok(snapshot)
    }

    /// Force the next access to refresh regardless of age.
    pub fn invalidate(&self, reason: Invalidation) {
        self.stale.store(true, Ordering::SeqCst);
        if reason == Invalidation::ConfigChanged {
            self.config_stale.store(true, Ordering::SeqCst);
        }
        debug!(tenant = %self.tenant, ?reason, "engine invalidated");
    }

    /// Not invalidated and younger than `ttl`.
    pub async fn is_fresh(&self, ttl: Duration) -> bool {
        if self.stale.load(Ordering::SeqCst) || self.config_stale.load(Ordering::SeqCst) {
            return false;
        }
        self.snapshot().await.built_at.elapsed() < ttl
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }
}
