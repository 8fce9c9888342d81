use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use super::EngineError;
use crate::limits::MAX_DURATION_MINUTES;
use crate::model::*;
use crate::source::{CommitmentRecord, ExternalEvent, Sources};
use crate::time::{minutes_of, parse_clock};

const EXTERNAL_LABEL: &str = "ocupado";

/// Normalized commitments of one refresh plus the health of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub commitments: Vec<Commitment>,
    pub feed_status: FeedStatus,
}

/// Load `[today, today + window_days]` from both sources concurrently.
/// External failure or timeout degrades to local-only; local failure aborts.
pub async fn load(
    sources: &Sources,
    tenant: &str,
    today: NaiveDate,
    window_days: u32,
    tz: Tz,
    external_timeout: Duration,
) -> Result<Aggregate, EngineError> {
    let to = today
        .checked_add_days(Days::new(u64::from(window_days)))
        .ok_or(EngineError::InvalidRequest("window out of range"))?;
    let time_min = local_midnight_utc(tz, today);
    let time_max = local_midnight_utc(tz, to.succ_opt().unwrap_or(to));

    let (local, external) = tokio::join!(
        sources.commitments.list_commitments(tenant, today, to),
        tokio::time::timeout(
            external_timeout,
            sources.calendar.list_events(tenant, time_min, time_max)
        ),
    );

    let records = local.map_err(|e| match e {
        EngineError::SourceUnavailable(..) => e,
        other => EngineError::SourceUnavailable(Source::Local, other.to_string()),
    })?;
    let local = from_local(&records);
    let (external, feed_status) = match external {
        Ok(Ok(events)) => (from_external(&events, tz, today, to), FeedStatus::Ok),
        Ok(Err(e)) => degraded(tenant, e.to_string()),
        Err(_) => degraded(
            tenant,
            format!("timed out after {}ms", external_timeout.as_millis()),
        ),
    };

    Ok(Aggregate {
        commitments: merge(local, external),
        feed_status,
    })
}

fn degraded(tenant: &str, reason: String) -> (Vec<Commitment>, FeedStatus) {
    warn!(tenant, reason = %reason, "external calendar unavailable, using local commitments only");
    metrics::counter!(crate::observability::FEED_DEGRADED_TOTAL).increment(1);
    (Vec::new(), FeedStatus::Degraded(reason))
}

/// UTC instant of local midnight starting `date`. Falls back to UTC
/// midnight when the zone skips that instant.
pub fn local_midnight_utc(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

fn sane_duration(minutes: Option<Minutes>) -> Minutes {
    minutes
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_DURATION)
        .min(MAX_DURATION_MINUTES)
}

pub fn from_local(records: &[CommitmentRecord]) -> Vec<Commitment> {
    records
        .iter()
        .filter_map(|r| {
            let Some(start) = parse_clock(&r.start_time) else {
                warn!(id = %r.id, start_time = %r.start_time, "skipping commitment with unparseable start time");
                return None;
            };
            Some(Commitment {
                date: r.date,
                start,
                duration: sane_duration(r.duration_minutes),
                source: Source::Local,
                label: r.label.clone(),
            })
        })
        .collect()
}

/// Timed events dated within `[from, to]` in `tz`.
pub fn from_external(
    events: &[ExternalEvent],
    tz: Tz,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<Commitment> {
    events
        .iter()
        .filter(|e| !e.all_day)
        .filter_map(|e| {
            let local = e.start.with_timezone(&tz).naive_local();
            let date = local.date();
            if date < from || date > to {
                return None;
            }
            let minutes = e
                .end
                .map(|end| (end - e.start).num_seconds())
                .filter(|secs| *secs > 0)
                .map(|secs| (secs + 30) / 60);
            Some(Commitment {
                date,
                start: minutes_of(local.time()),
                duration: sane_duration(minutes),
                source: Source::External,
                label: e.title.clone().unwrap_or_else(|| EXTERNAL_LABEL.to_string()),
            })
        })
        .collect()
}

/// Local commitments win over external ones at the same `(date, start)`;
/// external duplicates collapse to the first.
pub fn merge(local: Vec<Commitment>, external: Vec<Commitment>) -> Vec<Commitment> {
    let mut seen: HashSet<(NaiveDate, Minutes)> = local.iter().map(|c| (c.date, c.start)).collect();
    let mut merged = local;
    merged.extend(
        external
            .into_iter()
            .filter(|c| seen.insert((c.date, c.start))),
    );
    merged
}
