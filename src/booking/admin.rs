//! Operator actions on a single booking.

use serde::Serialize;

use crate::engine::{EngineError, GuardFailure};
use crate::model::*;

use super::BookingService;
use super::release::CancelOutcome;

/// What happened on the platform side of an admin action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformAction {
    NotNeeded,
    Done,
    /// The call failed and the booking carries a note for manual follow-up.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCancelOutcome {
    Cancelled {
        previous: BookingStatus,
        order: PlatformAction,
    },
    NotCancellable(BookingStatus),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Fulfilled { order_id: i64 },
    AlreadyFulfilled,
    NotConfirmed(BookingStatus),
    FulfillmentFailed(String),
    NotFound,
}

impl BookingService {
    async fn shop_booking(&self, shop: &str, token: &str) -> Option<Booking> {
        self.engine
            .booking_by_token(token)
            .await
            .filter(|booking| booking.shop == shop)
    }

    async fn flag(&self, booking: &Booking, note: &str) {
        if let Err(e) = self.engine.append_note(booking.id, note, self.now()).await {
            tracing::error!("could not flag booking {} for review: {e}", booking.id);
        }
    }

    /// Cancel a booking from the admin, cancelling its order too when it had
    /// already been confirmed by one.
    pub async fn admin_cancel(&self, shop: &str, token: &str) -> Result<AdminCancelOutcome, EngineError> {
        let Some(booking) = self.shop_booking(shop, token).await else {
            return Ok(AdminCancelOutcome::NotFound);
        };
        let (previous, order_id) = match self.cancel_booking(booking.id).await? {
            CancelOutcome::Cancelled { previous, order_id } => (previous, order_id),
            CancelOutcome::NotCancellable(status) => return Ok(AdminCancelOutcome::NotCancellable(status)),
            CancelOutcome::NotFound => return Ok(AdminCancelOutcome::NotFound),
        };

        let order = match order_id {
            Some(order_id) if previous == BookingStatus::Confirmed => {
                match self.gateway.cancel_order(shop, order_id, "rental booking cancelled").await {
                    Ok(()) => PlatformAction::Done,
                    Err(e) => {
                        tracing::warn!("cancelling order {order_id} for booking {} failed: {e}", booking.id);
                        let note = format!("booking cancelled but order {order_id} cancellation failed ({e}); needs manual review");
                        self.flag(&booking, &note).await;
                        PlatformAction::Failed
                    }
                }
            }
            _ => PlatformAction::NotNeeded,
        };
        Ok(AdminCancelOutcome::Cancelled { previous, order })
    }

    /// Fulfil a confirmed booking's order on the platform and stamp it.
    pub async fn complete_booking(&self, shop: &str, token: &str) -> Result<CompleteOutcome, EngineError> {
        let Some(booking) = self.shop_booking(shop, token).await else {
            return Ok(CompleteOutcome::NotFound);
        };
        let order_id = match (booking.status, booking.order_id) {
            (BookingStatus::Confirmed, Some(order_id)) => order_id,
            (status, _) => return Ok(CompleteOutcome::NotConfirmed(status)),
        };
        if booking.fulfilled_at.is_some() {
            return Ok(CompleteOutcome::AlreadyFulfilled);
        }

        if let Err(e) = self.gateway.fulfill_order(shop, order_id).await {
            tracing::warn!("fulfilling order {order_id} for booking {} failed: {e}", booking.id);
            self.flag(&booking, &format!("order {order_id} fulfillment failed ({e}); needs manual review"))
                .await;
            return Ok(CompleteOutcome::FulfillmentFailed(e.to_string()));
        }

        let stamp = Statement::MarkFulfilled {
            booking_id: booking.id,
            at: self.now(),
        };
        match self.engine.execute(vec![stamp]).await {
            Ok(()) => {
                tracing::info!("booking {} fulfilled (order {order_id})", booking.id);
                Ok(CompleteOutcome::Fulfilled { order_id })
            }
            Err(EngineError::Guard(GuardFailure::StatusMismatch { actual, .. })) => {
                Ok(CompleteOutcome::NotConfirmed(actual))
            }
            Err(e) => Err(e),
        }
    }
}
