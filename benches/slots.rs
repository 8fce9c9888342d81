use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use slotwise::engine::{BookingOutcome, BookingRequest, Engine, EngineSettings};
use slotwise::source::{
    CommitmentRecord, MemoryCommitmentStore, MemoryConfigStore, Sources, StaticCalendarFeed,
};
use slotwise::time::FixedClock;

const TENANT: &str = "bench";

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap() + chrono::Days::new(offset)
}

fn now() -> NaiveDateTime {
    day(0).and_hms_opt(8, 0, 0).unwrap()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let max = latencies[latencies.len() - 1];
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        max.as_secs_f64() * 1000.0,
    );
}

/// A busy week: a 30-minute commitment every 90 minutes, every day.
fn seeded_store() -> Arc<MemoryCommitmentStore> {
    let store = Arc::new(MemoryCommitmentStore::new());
    for offset in 0..8 {
        for start in (540..1080).step_by(90) {
            store.seed(
                TENANT,
                CommitmentRecord {
                    id: Ulid::new(),
                    date: day(offset),
                    start_time: format!("{:02}:{:02}", start / 60, start % 60),
                    duration_minutes: Some(30),
                    label: "cliente".into(),
                },
            );
        }
    }
    store
}

async fn engine(store: Arc<MemoryCommitmentStore>) -> Engine {
    let sources = Sources {
        commitments: store,
        calendar: Arc::new(StaticCalendarFeed::new()),
        config: Arc::new(MemoryConfigStore::new()),
    };
    Engine::initialize(
        TENANT,
        sources,
        Arc::new(FixedClock::new(now())),
        EngineSettings::default(),
    )
    .await
    .expect("engine init")
}

async fn phase_queries(engine: &Engine) {
    println!("phase 1: read queries against the cached snapshot");
    let n = 5000;
    let mut slots = Vec::with_capacity(n);
    let mut verdicts = Vec::with_capacity(n);
    let mut alternatives = Vec::with_capacity(n);
    for i in 0..n {
        let date = day((i % 7) as u64 + 1);
        let start = 540 + ((i as i64 * 10) % 480);

        let t = Instant::now();
        let _ = engine.available_slots(date, 60).await;
        slots.push(t.elapsed());

        let t = Instant::now();
        let _ = engine.is_bookable(date, start, 60).await;
        verdicts.push(t.elapsed());

        let t = Instant::now();
        let _ = engine.find_alternatives(date, start, 60).await;
        alternatives.push(t.elapsed());
    }
    print_latency("available_slots", &mut slots);
    print_latency("is_bookable", &mut verdicts);
    print_latency("find_alternatives", &mut alternatives);

    let mut contexts = Vec::with_capacity(500);
    for _ in 0..500 {
        let t = Instant::now();
        let _ = engine.render_context().await;
        contexts.push(t.elapsed());
    }
    print_latency("render_context", &mut contexts);
}

async fn phase_refresh(engine: &Engine) {
    println!("phase 2: full refresh");
    let mut latencies = Vec::with_capacity(500);
    for _ in 0..500 {
        engine.invalidate(slotwise::model::Invalidation::BookingCreated);
        let t = Instant::now();
        engine.refresh().await.expect("refresh");
        latencies.push(t.elapsed());
    }
    print_latency("refresh", &mut latencies);
}

async fn phase_contended_bookings(engine: Arc<Engine>) {
    println!("phase 3: 32 concurrent clients booking the same afternoon");
    let started = Instant::now();
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let t = Instant::now();
                let outcome = engine
                    .book(BookingRequest {
                        date: day(1),
                        start: 600 + (i % 4) * 10,
                        duration: 60,
                        label: format!("client {i}"),
                    })
                    .await;
                (t.elapsed(), matches!(outcome, Ok(BookingOutcome::Confirmed { .. })))
            })
        })
        .collect();

    let mut latencies = Vec::new();
    let mut confirmed = 0;
    for task in tasks {
        let (elapsed, ok) = task.await.expect("task");
        latencies.push(elapsed);
        confirmed += usize::from(ok);
    }
    println!(
        "  {confirmed} confirmed of 32 in {:.1}ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    print_latency("book", &mut latencies);
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let engine = Arc::new(engine(seeded_store()).await);
        phase_queries(&engine).await;
        phase_refresh(&engine).await;
        phase_contended_bookings(engine).await;
    });
}
