use serde::Serialize;
use ulid::Ulid;

use crate::engine::{EngineError, GuardFailure};
use crate::model::*;

use super::BookingService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The hold was released and its capacity returned.
    Released(BookingStatus),
    /// The booking was not a hold; nothing changed.
    Unchanged(BookingStatus),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled {
        previous: BookingStatus,
        order_id: Option<i64>,
    },
    NotCancellable(BookingStatus),
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One guarded decrement per day allocation the booking made.
pub(super) fn unreserve_all(shop: &str, days: &[BookingDay]) -> impl Iterator<Item = Statement> {
    days.iter().map(|day| Statement::Unreserve {
        shop: shop.to_string(),
        product_id: day.product_id,
        date: day.date,
        qty: day.qty,
    })
}

const CANCEL_ATTEMPTS: usize = 3;

impl BookingService {
    /// Release a hold, returning its capacity. `target` is `Released` for an
    /// explicit release and `Expired` for the sweep. Anything that is not a hold
    /// is left alone, so repeating the call is harmless.
    pub async fn release_booking(&self, id: Ulid, target: BookingStatus) -> Result<ReleaseOutcome, EngineError> {
        if !matches!(target, BookingStatus::Released | BookingStatus::Expired) {
            return Err(EngineError::Invalid("release target must be RELEASED or EXPIRED"));
        }
        let Some(booking) = self.engine.booking(id).await else {
            return Ok(ReleaseOutcome::NotFound);
        };
        if booking.status != BookingStatus::Hold {
            tracing::debug!("release {id}: already {}", booking.status);
            return Ok(ReleaseOutcome::Unchanged(booking.status));
        }

        let days = self.engine.booking_days(id).await;
        let mut batch = vec![Statement::TransitionStatus {
            booking_id: id,
            from: vec![BookingStatus::Hold],
            to: target,
            reason: None,
            at: self.now(),
        }];
        batch.extend(unreserve_all(&booking.shop, &days));

        match self.engine.execute(batch).await {
            Ok(()) => {
                tracing::info!("booking {id} {target}, returned {} day allocations", days.len());
                metrics::counter!(crate::observability::RELEASES_TOTAL, "status" => target.as_str()).increment(1);
                Ok(ReleaseOutcome::Released(target))
            }
            Err(EngineError::Guard(GuardFailure::StatusMismatch { actual, .. })) => {
                tracing::debug!("release {id}: raced to {actual}");
                Ok(ReleaseOutcome::Unchanged(actual))
            }
            Err(e @ EngineError::Guard(GuardFailure::ReservedUnderflow { .. })) => {
                tracing::error!("ledger corruption releasing booking {id}: {e}");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Public release by token, scoped to the calling shop.
    pub async fn release_by_token(&self, shop: &str, token: &str) -> Result<ReleaseOutcome, EngineError> {
        match self.engine.booking_by_token(token).await {
            Some(booking) if booking.shop == shop => {
                self.release_booking(booking.id, BookingStatus::Released).await
            }
            _ => Ok(ReleaseOutcome::NotFound),
        }
    }

    /// Cancel a hold or a confirmed booking and return its capacity. Reports the
    /// status it was in so the caller can decide whether the order needs
    /// cancelling too.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<CancelOutcome, EngineError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let Some(booking) = self.engine.booking(id).await else {
                return Ok(CancelOutcome::NotFound);
            };
            let previous = booking.status;
            if !matches!(previous, BookingStatus::Hold | BookingStatus::Confirmed) {
                return Ok(CancelOutcome::NotCancellable(previous));
            }

            let days = self.engine.booking_days(id).await;
            let mut batch = vec![Statement::TransitionStatus {
                booking_id: id,
                from: vec![previous],
                to: BookingStatus::Cancelled,
                reason: None,
                at: self.now(),
            }];
            batch.extend(unreserve_all(&booking.shop, &days));

            match self.engine.execute(batch).await {
                Ok(()) => {
                    tracing::info!("booking {id} cancelled (was {previous})");
                    metrics::counter!(crate::observability::RELEASES_TOTAL, "status" => "CANCELLED").increment(1);
                    return Ok(CancelOutcome::Cancelled {
                        previous,
                        order_id: booking.order_id,
                    });
                }
                // Status moved between read and write; look again.
                Err(EngineError::Guard(GuardFailure::StatusMismatch { .. })) => continue,
                Err(e @ EngineError::Guard(GuardFailure::ReservedUnderflow { .. })) => {
                    tracing::error!("ledger corruption cancelling booking {id}: {e}");
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        let status = self
            .engine
            .booking(id)
            .await
            .map_or(BookingStatus::Cancelled, |b| b.status);
        Ok(CancelOutcome::NotCancellable(status))
    }

    /// Expire every hold whose expiry has passed. Each booking is released on its
    /// own; one failure is logged and the sweep moves on.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();
        for id in self.engine.expired_holds(now).await {
            match self.release_booking(id, BookingStatus::Expired).await {
                Ok(ReleaseOutcome::Released(_)) => report.expired += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    tracing::error!("sweep: failed to expire booking {id}: {e}");
                    report.failed += 1;
                }
            }
        }
        metrics::counter!(crate::observability::SWEEP_RUNS_TOTAL).increment(1);
        metrics::counter!(crate::observability::SWEEP_EXPIRED_TOTAL).increment(report.expired as u64);
        if report.expired > 0 || report.failed > 0 {
            tracing::info!(
                "sweep: expired {}, skipped {}, failed {}",
                report.expired, report.skipped, report.failed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::*;

    const MINUTE: Ms = 60_000;

    #[tokio::test]
    async fn release_returns_capacity_once() {
        let kit = kit("release_once.wal").await;
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 2)]).await;
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 2);

        let first = kit.service.release_booking(receipt.booking_id, BookingStatus::Released).await.unwrap();
        assert_eq!(first, ReleaseOutcome::Released(BookingStatus::Released));
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 0);
        assert_eq!(reserved(&kit, 1, "2025-06-06").await, 0);

        let second = kit.service.release_booking(receipt.booking_id, BookingStatus::Expired).await.unwrap();
        assert_eq!(second, ReleaseOutcome::Unchanged(BookingStatus::Released));
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 0);

        let booking = kit.engine().booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Released);
    }

    #[tokio::test]
    async fn release_surfaces_ledger_corruption() {
        let kit = kit("release_corrupt.wal").await;
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;
        let date = crate::dates::parse_date("2025-06-05").unwrap();
        let unreserve = Statement::Unreserve {
            shop: SHOP.into(),
            product_id: 1,
            date,
            qty: 1,
        };
        kit.engine().execute(vec![unreserve]).await.unwrap();

        let result = kit.service.release_booking(receipt.booking_id, BookingStatus::Released).await;
        match result {
            Err(EngineError::Guard(failure)) => {
                assert_eq!(failure, GuardFailure::ReservedUnderflow { product_id: 1, date });
            }
            other => panic!("expected underflow, got {other:?}"),
        }
        let booking = kit.engine().booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Hold);
        assert_eq!(reserved(&kit, 1, "2025-06-06").await, 1);
    }

    #[tokio::test]
    async fn release_rejects_other_targets() {
        let kit = kit("release_target.wal").await;
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;
        let result = kit.service.release_booking(receipt.booking_id, BookingStatus::Confirmed).await;
        assert!(matches!(result, Err(EngineError::Invalid(_))));
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 1);
    }

    #[tokio::test]
    async fn release_by_token_is_shop_scoped() {
        let kit = kit("release_scoped.wal").await;
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;
        let other = kit.service.release_by_token("other.myshopify.com", &receipt.booking_token).await.unwrap();
        assert_eq!(other, ReleaseOutcome::NotFound);
        let missing = kit.service.release_by_token(SHOP, "no-such-token").await.unwrap();
        assert_eq!(missing, ReleaseOutcome::NotFound);

        let mine = kit.service.release_by_token(SHOP, &receipt.booking_token).await.unwrap();
        assert_eq!(mine, ReleaseOutcome::Released(BookingStatus::Released));
    }

    #[tokio::test]
    async fn concurrent_releases_decrement_once() {
        let kit = std::sync::Arc::new(kit("release_concurrent.wal").await);
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 2)]).await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let kit = kit.clone();
            let id = receipt.booking_id;
            tasks.push(tokio::spawn(async move {
                kit.service.release_booking(id, BookingStatus::Released).await.unwrap()
            }));
        }
        let mut released = 0;
        for task in tasks {
            if let ReleaseOutcome::Released(_) = task.await.unwrap() {
                released += 1;
            }
        }
        assert_eq!(released, 1);
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 0);
    }

    #[tokio::test]
    async fn cancel_hold_and_reject_terminal_states() {
        let kit = kit("cancel_hold.wal").await;
        let receipt = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;

        let outcome = kit.service.cancel_booking(receipt.booking_id).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Cancelled { previous: BookingStatus::Hold, order_id: None }
        );
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 0);

        let again = kit.service.cancel_booking(receipt.booking_id).await.unwrap();
        assert_eq!(again, CancelOutcome::NotCancellable(BookingStatus::Cancelled));
        assert_eq!(kit.service.cancel_booking(Ulid::new()).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn sweep_expires_only_past_holds() {
        let kit = kit("sweep.wal").await;
        let old = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;
        kit.clock.advance(10 * MINUTE);
        let fresh = held(&kit, "2025-06-05", "2025-06-06", &[(1, None, 1)]).await;
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 2);

        kit.clock.advance(11 * MINUTE);
        let report = kit.service.sweep_expired().await;
        assert_eq!(report, SweepReport { expired: 1, skipped: 0, failed: 0 });

        let old_booking = kit.engine().booking(old.booking_id).await.unwrap();
        assert_eq!(old_booking.status, BookingStatus::Expired);
        let fresh_booking = kit.engine().booking(fresh.booking_id).await.unwrap();
        assert_eq!(fresh_booking.status, BookingStatus::Hold);
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 1);

        // Overlapping sweeps are harmless.
        kit.clock.advance(30 * MINUTE);
        let (a, b) = tokio::join!(kit.service.sweep_expired(), kit.service.sweep_expired());
        assert_eq!(a.expired + b.expired, 1);
        assert_eq!(reserved(&kit, 1, "2025-06-05").await, 0);
        assert_eq!(reserved(&kit, 1, "2025-06-06").await, 0);
    }
}
