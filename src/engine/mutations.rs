use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::source::NewCommitment;

use super::queries::validate_request;
use super::{Engine, EngineError, alternatives};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration: Minutes,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Confirmed { id: Ulid, slot: Slot },
    Rejected {
        reason: Rejection,
        alternatives: Alternatives,
    },
}

impl Engine {
    /// Check a request against freshly loaded data and persist it when it
    /// fits. Bookings for this tenant run one at a time.
    pub async fn book(&self, request: BookingRequest) -> Result<BookingOutcome, EngineError> {
        validate_request(Some(request.start), request.duration)?;
        if request.label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("label too long"));
        }

        let _booking = self.booking_gate.lock().await;
        let snapshot = self.refresh().await?;
        let now = self.clock.now();
        let verdict = snapshot
            .day(request.date, now)
            .verdict(request.start, request.duration);

        if let Bookability::Rejected(reason) = verdict {
            metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => reason.code())
                .increment(1);
            let alternatives = alternatives::find_alternatives(
                &snapshot,
                request.date,
                request.start,
                request.duration,
                now,
            );
            return Ok(BookingOutcome::Rejected {
                reason,
                alternatives,
            });
        }

        let slot = Slot::new(request.date, request.start);
        let id = self
            .sources
            .commitments
            .insert_commitment(
                &self.tenant,
                NewCommitment {
                    date: request.date,
                    start: request.start,
                    duration: request.duration,
                    label: request.label,
                },
            )
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "confirmed")
            .increment(1);
        info!(tenant = %self.tenant, %id, %slot, "booking confirmed");

        self.invalidate(Invalidation::BookingCreated);
        if let Err(e) = self.refresh().await {
            warn!(tenant = %self.tenant, error = %e, "refresh after booking failed");
        }
        Ok(BookingOutcome::Confirmed { id, slot })
    }

    pub async fn cancel(&self, id: Ulid) -> Result<(), EngineError> {
        let _booking = self.booking_gate.lock().await;
        if !self
            .sources
            .commitments
            .cancel_commitment(&self.tenant, id)
            .await?
        {
            return Err(EngineError::NotFound(id));
        }
        info!(tenant = %self.tenant, %id, "booking cancelled");
        self.invalidate(Invalidation::BookingCreated);
        if let Err(e) = self.refresh().await {
            warn!(tenant = %self.tenant, error = %e, "refresh after cancellation failed");
        }
        Ok(())
    }
}
