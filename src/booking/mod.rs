//! The reservation protocols: hold, release/expire/cancel, and order confirmation.

mod admin;
mod confirm;
mod hold;
pub mod order;
mod release;

pub use admin::{AdminCancelOutcome, CompleteOutcome, PlatformAction};
pub use confirm::{ConfirmOutcome, ConfirmSummary, ORDERS_CREATE, TokenOutcome, TokenResult};
pub use hold::{HoldError, HoldItem, HoldOutcome, HoldReceipt, HoldRequest};
pub use release::{CancelOutcome, ReleaseOutcome, SweepReport};

use std::sync::Arc;

use crate::clock::Clock;
use crate::engine::Engine;
use crate::gateway::OrderGateway;
use crate::model::Ms;

/// Tunables for new holds.
#[derive(Debug, Clone, Copy)]
pub struct HoldSettings {
    /// How long a hold lives before the sweep expires it.
    pub ttl_ms: Ms,
    /// Total units across all items of one hold.
    pub max_units: i64,
    /// Widest inclusive date range one hold may span.
    pub max_days: i64,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 20 * 60 * 1000,
            max_units: 50,
            max_days: 90,
        }
    }
}

pub struct BookingService {
    engine: Arc<Engine>,
    gateway: Arc<dyn OrderGateway>,
    clock: Arc<dyn Clock>,
    settings: HoldSettings,
}

impl BookingService {
    pub fn new(
        engine: Arc<Engine>,
        gateway: Arc<dyn OrderGateway>,
        clock: Arc<dyn Clock>,
        settings: HoldSettings,
    ) -> Self {
        Self {
            engine,
            gateway,
            clock,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Today in the shop's configured zone (UTC when the shop is unknown).
    async fn shop_today(&self, shop: &str, now: Ms) -> jiff::civil::Date {
        let tz = self
            .engine
            .shop(shop)
            .await
            .map_or_else(|| "UTC".to_string(), |s| s.timezone);
        crate::dates::today_or_utc(&tz, now)
    }
}
