use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::time::is_within_day;

use super::{Engine, EngineError, alternatives, availability, context};

/// Reject durations and start times no schedule can hold.
pub(super) fn validate_request(
    start: Option<Minutes>,
    duration: Minutes,
) -> Result<(), EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidRequest("duration must be positive"));
    }
    if duration > MAX_DURATION_MINUTES {
        return Err(EngineError::InvalidRequest("duration longer than a day"));
    }
    if let Some(start) = start
        && !is_within_day(start)
    {
        return Err(EngineError::InvalidRequest("start time outside the day"));
    }
    Ok(())
}

impl Engine {
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        duration: Minutes,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_request(None, duration)?;
        let snapshot = self.snapshot().await;
        let day = snapshot.day(date, self.clock.now());
        Ok(availability::available_slots(&day, duration)
            .into_iter()
            .map(|start| Slot::new(date, start))
            .collect())
    }

    pub async fn first_available_slot(
        &self,
        date: NaiveDate,
        duration: Minutes,
    ) -> Result<Option<Slot>, EngineError> {
        validate_request(None, duration)?;
        let snapshot = self.snapshot().await;
        let day = snapshot.day(date, self.clock.now());
        Ok(availability::first_available_slot(&day, duration).map(|start| Slot::new(date, start)))
    }

    /// Strict verdict for one request. Agrees with `available_slots`.
    pub async fn is_bookable(
        &self,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
    ) -> Result<Bookability, EngineError> {
        validate_request(Some(start), duration)?;
        let snapshot = self.snapshot().await;
        Ok(snapshot.day(date, self.clock.now()).verdict(start, duration))
    }

    pub async fn find_alternatives(
        &self,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
    ) -> Result<Alternatives, EngineError> {
        validate_request(Some(start), duration)?;
        let snapshot = self.snapshot().await;
        let found =
            alternatives::find_alternatives(&snapshot, date, start, duration, self.clock.now());
        if found.is_empty() {
            return Err(EngineError::NoAlternativeFound { date, start });
        }
        Ok(found)
    }

    pub async fn render_context(&self) -> String {
        let snapshot = self.snapshot().await;
        context::render(&snapshot)
    }

    /// Occupied ranges of one date, or of the whole window.
    pub async fn occupied(&self, date: Option<NaiveDate>) -> Vec<OccupiedRange> {
        let snapshot = self.snapshot().await;
        match date {
            Some(date) => snapshot.ranges(date).to_vec(),
            None => snapshot.occupied.values().flatten().cloned().collect(),
        }
    }

    /// Duration of `product_id`, or the default duration.
    pub async fn duration_for(&self, product_id: Option<&str>) -> Minutes {
        self.snapshot()
            .await
            .config
            .duration_mode
            .duration_for(product_id)
    }

    pub async fn feed_status(&self) -> FeedStatus {
        self.snapshot().await.feed_status.clone()
    }
}
