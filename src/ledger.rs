use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OnceCell, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_COMMITMENTS_PER_TENANT;
use crate::source::{CommitmentRecord, CommitmentStore, NewCommitment};
use crate::wal::{CommitmentLog, LedgerEvent, LiveCommitments, apply};

// ── Group-commit channel ─────────────────────────────────

enum WalCommand {
    Append {
        event: LedgerEvent,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(Control),
}

enum Control {
    Compact {
        live: LiveCommitments,
        response: oneshot::Sender<io::Result<()>>,
    },
    StaleEntries {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (LedgerEvent, oneshot::Sender<io::Result<()>>);

/// Background task that owns the log and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. One sync for the whole batch.
/// 5. Respond to all senders.
///
/// Exits once every sender is dropped.
async fn wal_writer_loop(mut log: CommitmentLog, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(WalCommand::Control(control)) => {
                            deferred = Some(control);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut log, &mut batch);
                if let Some(control) = deferred {
                    handle_control(&mut log, control);
                }
            }
            WalCommand::Control(control) => handle_control(&mut log, control),
        }
    }
}

fn commit_batch(log: &mut CommitmentLog, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(log, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(log: &mut CommitmentLog, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = log.append(event) {
            append_err = Some(e);
            break;
        }
    }
    // Sync even after an append error so buffered bytes don't leak into
    // the next batch.
    let sync_err = log.sync().err();
    match (append_err, sync_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(log: &mut CommitmentLog, control: Control) {
    match control {
        Control::Compact { live, response } => {
            let _ = response.send(log.rewrite(&live));
        }
        Control::StaleEntries { response } => {
            let _ = response.send(log.stale_entries());
        }
    }
}

// ── Per-tenant ledger ────────────────────────────────────

struct TenantLedger {
    records: RwLock<LiveCommitments>,
    wal_tx: mpsc::Sender<WalCommand>,
}

fn wal_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::WalError(e.to_string())
}

impl TenantLedger {
    fn open(path: &Path) -> io::Result<Self> {
        let (log, records) = CommitmentLog::open(path)?;
        debug!(
            path = %path.display(),
            live = records.len(),
            stale = log.stale_entries(),
            "ledger replayed"
        );
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(log, wal_rx));
        Ok(Self {
            records: RwLock::new(records),
            wal_tx,
        })
    }

    async fn send(&self, command: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(command)
            .await
            .map_err(|_| wal_err("log writer shut down"))
    }

    async fn append(&self, event: LedgerEvent) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(WalCommand::Append {
            event,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| wal_err("log writer dropped response"))?
            .map_err(wal_err)
    }

    async fn stale_entries(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(WalCommand::Control(Control::StaleEntries { response: tx }))
            .await?;
        rx.await.map_err(|_| wal_err("log writer dropped response"))
    }

    /// Rewrite the log as one entry per live commitment.
    async fn compact(&self) -> Result<(), EngineError> {
        // Write lock held until the rewrite is acknowledged: no append may
        // land between the copy and the swap.
        let records = self.records.write().await;
        let (tx, rx) = oneshot::channel();
        self.send(WalCommand::Control(Control::Compact {
            live: records.clone(),
            response: tx,
        }))
        .await?;
        rx.await
            .map_err(|_| wal_err("log writer dropped response"))?
            .map_err(wal_err)
    }
}

/// Durable local commitment store: one append-only log per tenant under
/// `dir`, replayed into memory on first use.
pub struct WalCommitmentStore {
    dir: PathBuf,
    ledgers: DashMap<String, Arc<OnceCell<Arc<TenantLedger>>>>,
}

impl WalCommitmentStore {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ledgers: DashMap::new(),
        })
    }

    async fn ledger(&self, tenant: &str) -> Result<Arc<TenantLedger>, EngineError> {
        if tenant.is_empty() || tenant.contains(['/', '\\']) || tenant.starts_with('.') {
            return Err(EngineError::InvalidRequest("bad tenant name"));
        }
        let cell = self
            .ledgers
            .entry(tenant.to_string())
            .or_default()
            .clone();
        let path = self.dir.join(format!("{tenant}.wal"));
        cell.get_or_try_init(|| async move { TenantLedger::open(&path).map(Arc::new) })
            .await
            .cloned()
            .map_err(wal_err)
    }

    /// Drop the in-memory ledger of `tenant`, which stops its writer task.
    /// Skipped while a request still holds the ledger. The next access
    /// replays the log again. Returns whether the ledger was closed.
    pub fn close(&self, tenant: &str) -> bool {
        let closed = self
            .ledgers
            .remove_if(tenant, |_, cell| {
                Arc::strong_count(cell) == 1
                    && cell.get().is_none_or(|ledger| Arc::strong_count(ledger) == 1)
            })
            .is_some();
        if closed {
            debug!(tenant, "ledger closed");
        }
        closed
    }

    pub fn open_ledgers(&self) -> usize {
        self.ledgers.len()
    }

    /// Compact every open ledger holding at least `threshold` entries that no
    /// longer describe a live commitment. Returns how many were compacted.
    pub async fn compact_if_needed(&self, threshold: u64) -> usize {
        let ledgers: Vec<(String, Arc<TenantLedger>)> = self
            .ledgers
            .iter()
            .filter_map(|e| e.value().get().map(|l| (e.key().clone(), l.clone())))
            .collect();

        let mut compacted = 0;
        for (tenant, ledger) in ledgers {
            match ledger.stale_entries().await {
                Ok(n) if n >= threshold => match ledger.compact().await {
                    Ok(()) => {
                        info!(tenant, stale = n, "ledger compacted");
                        compacted += 1;
                    }
                    Err(e) => warn!(tenant, error = %e, "ledger compaction failed"),
                },
                Ok(_) => {}
                Err(e) => warn!(tenant, error = %e, "ledger unavailable for compaction"),
            }
        }
        compacted
    }
}

#[async_trait]
impl CommitmentStore for WalCommitmentStore {
    async fn list_commitments(
        &self,
        tenant: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CommitmentRecord>, EngineError> {
        let ledger = self.ledger(tenant).await?;
        let records = ledger.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.date >= from && r.date <= to)
            .cloned()
            .collect())
    }

    async fn insert_commitment(
        &self,
        tenant: &str,
        commitment: NewCommitment,
    ) -> Result<Ulid, EngineError> {
        let ledger = self.ledger(tenant).await?;
        let mut records = ledger.records.write().await;
        if records.len() >= MAX_COMMITMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many commitments"));
        }
        let id = Ulid::new();
        let event = LedgerEvent::CommitmentRecorded {
            id,
            date: commitment.date,
            start: commitment.start,
            duration: commitment.duration,
            label: commitment.label,
        };
        ledger.append(event.clone()).await?;
        apply(&mut records, &event);
        Ok(id)
    }

    async fn cancel_commitment(&self, tenant: &str, id: Ulid) -> Result<bool, EngineError> {
        let ledger = self.ledger(tenant).await?;
        let mut records = ledger.records.write().await;
        if !records.contains_key(&id) {
            return Ok(false);
        }
        let event = LedgerEvent::CommitmentCancelled { id };
        ledger.append(event.clone()).await?;
        apply(&mut records, &event);
        Ok(true)
    }

    fn release(&self, tenant: &str) {
        self.close(tenant);
    }
}
