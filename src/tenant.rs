use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError, EngineSettings};
use crate::limits::*;
use crate::model::Invalidation;
use crate::source::Sources;
use crate::time::Clock;

/// Keyed cache of per-tenant engines. Tenant = database name from the pgwire
/// connection.
///
/// Creation is single-flight per tenant: concurrent first requests share one
/// `Engine::initialize`. Entries older than `ttl` are refreshed in place on
/// access, never rebuilt.
pub struct TenantManager {
    engines: DashMap<String, Arc<OnceCell<Arc<Engine>>>>,
    sources: Sources,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    ttl: Duration,
}

/// Keep only characters that are safe in file names.
fn sanitize(tenant: &str) -> Result<String, EngineError> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(EngineError::LimitExceeded("tenant name too long"));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(EngineError::InvalidRequest("empty tenant name"));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(
        sources: Sources,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        ttl: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            sources,
            clock,
            settings,
            ttl,
        }
    }

    /// Get the tenant's engine, creating it on first use and refreshing it
    /// when its snapshot has expired or was invalidated.
    pub async fn get_or_create(&self, tenant: &str) -> Result<Arc<Engine>, EngineError> {
        let name = sanitize(tenant)?;

        let existing = self.engines.get(&name).map(|cell| cell.value().clone());
        let cell = match existing {
            Some(cell) => cell,
            None => {
                if self.engines.len() >= MAX_TENANTS {
                    return Err(EngineError::LimitExceeded("too many tenants"));
                }
                self.engines.entry(name.clone()).or_default().clone()
            }
        };

        if let Some(engine) = cell.get() {
            if !engine.is_fresh(self.ttl).await
                && let Err(e) = engine.refresh().await
            {
                warn!(tenant = %name, error = %e, "refresh failed, serving stale snapshot");
            }
            engine.touch();
            return Ok(engine.clone());
        }

        let (sources, clock, settings) =
            (self.sources.clone(), self.clock.clone(), self.settings.clone());
        let tenant_name = name.as_str();
        let result = cell
            .get_or_try_init(|| async move {
                Engine::initialize(tenant_name, sources, clock, settings)
                    .await
                    .map(Arc::new)
            })
            .await;
        let engine = match result {
            Ok(engine) => engine.clone(),
            Err(e) => {
                // Drop the empty cell so the tenant doesn't count against the limit.
                self.engines.remove_if(&name, |_, cell| cell.get().is_none());
                return Err(e);
            }
        };
        info!(tenant = %name, "tenant engine ready");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        engine.touch();
        Ok(engine)
    }

    /// Force the tenant's next access to refresh. No-op for unknown tenants.
    pub fn invalidate(&self, tenant: &str, reason: Invalidation) {
        let Ok(name) = sanitize(tenant) else {
            return;
        };
        if let Some(engine) = self.engines.get(&name).and_then(|c| c.get().cloned()) {
            engine.invalidate(reason);
        }
    }

    /// Drop engines unused for longer than `idle`. Returns how many went.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut evicted = Vec::new();
        self.engines.retain(|tenant, cell| match cell.get() {
            Some(engine) if engine.idle_for() >= idle => {
                debug!(tenant, idle_secs = engine.idle_for().as_secs(), "evicting idle tenant");
                evicted.push(tenant.clone());
                false
            }
            _ => true,
        });
        for tenant in &evicted {
            self.sources.commitments.release(tenant);
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        evicted.len()
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Minutes;
    use crate::source::*;
    use crate::time::FixedClock;
    use chrono::NaiveDate;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<MemoryCommitmentStore>,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let now = NaiveDate::from_ymd_opt(2026, 10, 19)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap();
            Self {
                store: Arc::new(MemoryCommitmentStore::new()),
                clock: Arc::new(FixedClock::new(now)),
            }
        }

        fn manager(&self, ttl: Duration) -> TenantManager {
            let sources = Sources {
                commitments: self.store.clone(),
                calendar: Arc::new(NoCalendarFeed),
                config: Arc::new(MemoryConfigStore::new()),
            };
            TenantManager::new(sources, self.clock.clone(), EngineSettings::default(), ttl)
        }

        fn seed(&self, tenant: &str, start: &str) {
            self.store.seed(
                tenant,
                CommitmentRecord {
                    id: Ulid::new(),
                    date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                    start_time: start.into(),
                    duration_minutes: Some(60),
                    label: "Ana".into(),
                },
            );
        }
    }

    fn first_starts(ranges: &[crate::model::OccupiedRange]) -> Vec<Minutes> {
        ranges.iter().map(|r| r.span.start).collect()
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(60));
        let a = tm.get_or_create("salon").await.unwrap();
        let b = tm.get_or_create("salon").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_access_initializes_once() {
        let fx = Fixture::new();
        let tm = Arc::new(fx.manager(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("salon").await.unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(fx.store.list_calls(), 1);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let fx = Fixture::new();
        fx.seed("tenant_a", "10:00");
        let tm = fx.manager(Duration::from_secs(60));

        let a = tm.get_or_create("tenant_a").await.unwrap();
        let b = tm.get_or_create("tenant_b").await.unwrap();
        assert_eq!(first_starts(&a.occupied(None).await), vec![600]);
        assert!(b.occupied(None).await.is_empty());
    }

    #[tokio::test]
    async fn invalidation_triggers_refresh_on_next_access() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(3600));
        let engine = tm.get_or_create("salon").await.unwrap();
        assert!(engine.occupied(None).await.is_empty());

        fx.seed("salon", "11:00");
        let engine = tm.get_or_create("salon").await.unwrap();
        assert!(engine.occupied(None).await.is_empty(), "still within ttl");

        tm.invalidate("salon", Invalidation::BookingCreated);
        let engine = tm.get_or_create("salon").await.unwrap();
        assert_eq!(first_starts(&engine.occupied(None).await), vec![660]);
    }

    #[tokio::test]
    async fn expired_entry_refreshes_in_place() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::ZERO);
        let first = tm.get_or_create("salon").await.unwrap();
        fx.seed("salon", "12:00");
        let second = tm.get_or_create("salon").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first_starts(&second.occupied(None).await), vec![720]);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_snapshot() {
        let fx = Fixture::new();
        fx.seed("salon", "10:00");
        let tm = fx.manager(Duration::ZERO);
        tm.get_or_create("salon").await.unwrap();

        fx.store.set_failing(true);
        let engine = tm.get_or_create("salon").await.unwrap();
        assert_eq!(first_starts(&engine.occupied(None).await), vec![600]);
    }

    #[tokio::test]
    async fn failed_creation_is_retried() {
        let fx = Fixture::new();
        fx.store.set_failing(true);
        let tm = fx.manager(Duration::from_secs(60));
        assert!(tm.get_or_create("salon").await.is_err());
        assert_eq!(tm.tenant_count(), 0);

        fx.store.set_failing(false);
        assert!(tm.get_or_create("salon").await.is_ok());
    }

    #[tokio::test]
    async fn evicts_only_idle_engines() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(60));
        tm.get_or_create("salon").await.unwrap();
        assert_eq!(tm.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(tm.evict_idle(Duration::ZERO), 1);
        assert_eq!(tm.tenant_count(), 0);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(60));
        let a = tm.get_or_create("../salon").await.unwrap();
        let b = tm.get_or_create("salon").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            tm.get_or_create("../..").await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(60));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).await.err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let fx = Fixture::new();
        let tm = fx.manager(Duration::from_secs(60));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).await.unwrap();
        }
        let err = tm.get_or_create("one_more").await.err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
