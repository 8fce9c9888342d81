use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotwise::calendar::HttpCalendarFeed;
use slotwise::engine::EngineSettings;
use slotwise::ledger::WalCommitmentStore;
use slotwise::profile::JsonConfigStore;
use slotwise::source::{CalendarFeed, NoCalendarFeed, Sources};
use slotwise::tenant::TenantManager;
use slotwise::time::ZonedClock;
use slotwise::{reaper, wire};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTWISE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotwise::observability::init(metrics_port)?;

    let port = std::env::var("SLOTWISE_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("SLOTWISE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = PathBuf::from(
        std::env::var("SLOTWISE_DATA_DIR").unwrap_or_else(|_| "./data".into()),
    );
    let password = std::env::var("SLOTWISE_PASSWORD").unwrap_or_else(|_| "slotwise".into());
    let max_connections: usize = env_or("SLOTWISE_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("SLOTWISE_COMPACT_THRESHOLD", 1000);
    let cache_ttl = Duration::from_secs(env_or("SLOTWISE_CACHE_TTL_SECS", 60));
    let idle_limit = Duration::from_secs(env_or("SLOTWISE_IDLE_SECS", 1800));
    let timezone_name =
        std::env::var("SLOTWISE_TIMEZONE").unwrap_or_else(|_| "Europe/Lisbon".into());
    let timezone = Tz::from_str(&timezone_name)
        .map_err(|e| format!("bad SLOTWISE_TIMEZONE '{timezone_name}': {e}"))?;
    let settings = EngineSettings {
        window_days: env_or("SLOTWISE_WINDOW_DAYS", 7u32).min(slotwise::limits::MAX_WINDOW_DAYS),
        timezone,
        external_timeout: Duration::from_millis(env_or("SLOTWISE_CALENDAR_TIMEOUT_MS", 3000)),
    };

    let tls_cert = std::env::var("SLOTWISE_TLS_CERT").ok();
    let tls_key = std::env::var("SLOTWISE_TLS_KEY").ok();
    let tls_acceptor =
        slotwise::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let ledger = Arc::new(WalCommitmentStore::new(data_dir.clone())?);
    let calendar: Arc<dyn CalendarFeed> = match std::env::var("SLOTWISE_CALENDAR_URL") {
        Ok(url) if !url.is_empty() => {
            info!("  calendar feed: {url}");
            Arc::new(HttpCalendarFeed::new(url, settings.external_timeout)?)
        }
        _ => Arc::new(NoCalendarFeed),
    };
    let sources = Sources {
        commitments: ledger.clone(),
        calendar,
        config: Arc::new(JsonConfigStore::new(data_dir.join("tenants"))),
    };
    let clock = Arc::new(ZonedClock::new(timezone));
    let tenant_manager = Arc::new(TenantManager::new(sources, clock, settings, cache_ttl));

    tokio::spawn(reaper::run_reaper(
        tenant_manager.clone(),
        idle_limit,
        Duration::from_secs(30),
    ));
    tokio::spawn(reaper::run_compactor(
        ledger,
        compact_threshold,
        Duration::from_secs(60),
    ));

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise listening on {addr}");
    info!("  data_dir: {}", data_dir.display());
    info!("  timezone: {timezone}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotwise::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotwise::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotwise::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotwise::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotwise stopped");
    Ok(())
}
