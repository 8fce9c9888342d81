use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::EngineError;
use crate::model::Source;
use crate::source::{CalendarFeed, ExternalEvent};

/// External calendar reached over HTTP:
/// `GET {base}/events/{tenant}?timeMin=..&timeMax=..`.
pub struct HttpCalendarFeed {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    all_day: bool,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

fn unavailable(e: impl std::fmt::Display) -> EngineError {
    EngineError::SourceUnavailable(Source::External, e.to_string())
}

fn parse_instant(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s.trim()).ok()
}

impl HttpCalendarFeed {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(unavailable)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn convert(raw: RawEvent) -> Option<ExternalEvent> {
        let start_text = raw.start?;
        let Some(start) = parse_instant(&start_text) else {
            // All-day events carry bare dates and never block slots.
            if !raw.all_day {
                warn!(start = %start_text, "skipping calendar event with unparseable start");
            }
            return None;
        };
        Some(ExternalEvent {
            start,
            end: raw.end.as_deref().and_then(parse_instant),
            all_day: raw.all_day,
            title: raw.summary.or(raw.title),
        })
    }
}

#[async_trait]
impl CalendarFeed for HttpCalendarFeed {
    async fn list_events(
        &self,
        tenant: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, EngineError> {
        let url = format!("{}/events/{tenant}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("timeMin", time_min.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("timeMax", time_max.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ])
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {status}")));
        }
        let body: EventsResponse = response.json().await.map_err(unavailable)?;
        if let Some(error) = body.error {
            return Err(unavailable(error));
        }

        let total = body.events.len();
        let events: Vec<ExternalEvent> = body
            .events
            .into_iter()
            .filter_map(Self::convert)
            .collect();
        debug!(tenant, total, kept = events.len(), "calendar events fetched");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn converts_timed_event() {
        let event = HttpCalendarFeed::convert(raw(
            r#"{"start": "2026-10-19T10:00:00+01:00", "end": "2026-10-19T10:45:00+01:00", "summary": "Dentista"}"#,
        ))
        .unwrap();
        assert_eq!(event.title.as_deref(), Some("Dentista"));
        assert_eq!((event.end.unwrap() - event.start).num_minutes(), 45);
        assert!(!event.all_day);
    }

    #[test]
    fn title_used_when_summary_missing() {
        let event = HttpCalendarFeed::convert(raw(
            r#"{"start": "2026-10-19T10:00:00Z", "title": "Reunião"}"#,
        ))
        .unwrap();
        assert_eq!(event.title.as_deref(), Some("Reunião"));
        assert_eq!(event.end, None);
    }

    #[test]
    fn unparseable_or_missing_start_is_dropped() {
        assert!(HttpCalendarFeed::convert(raw(r#"{"start": "tomorrow"}"#)).is_none());
        assert!(HttpCalendarFeed::convert(raw(r#"{"end": "2026-10-19T10:00:00Z"}"#)).is_none());
        assert!(
            HttpCalendarFeed::convert(raw(r#"{"start": "2026-10-19", "allDay": true}"#)).is_none()
        );
    }

    #[test]
    fn response_with_error_field_parses() {
        let body: EventsResponse =
            serde_json::from_str(r#"{"error": "token expired"}"#).unwrap();
        assert!(body.events.is_empty());
        assert_eq!(body.error.as_deref(), Some("token expired"));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let feed = HttpCalendarFeed::new("http://calendar.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(feed.base_url, "http://calendar.local");
    }
}
