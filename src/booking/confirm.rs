//! Order confirmation: turns the holds an order refers to into confirmed
//! bookings, or invalidates them and asks the platform to cancel the order.

use std::collections::BTreeMap;

use jiff::civil::Date;
use serde::Serialize;
use ulid::Ulid;

use crate::dates::{day_index, duration_days, parse_date};
use crate::engine::{EngineError, GuardFailure};
use crate::model::*;

use super::BookingService;
use super::order::{self, LineItem, OrderPayload};
use super::release::unreserve_all;

pub const ORDERS_CREATE: &str = "orders/create";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcome {
    Confirmed,
    /// Already confirmed by this same order; a redelivery.
    AlreadyConfirmed,
    Invalid,
    /// The booking changed underneath the confirmation.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenResult {
    pub token: String,
    pub outcome: TokenOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TokenResult {
    fn new(token: &str, outcome: TokenOutcome, reason: Option<String>) -> Self {
        Self {
            token: token.to_string(),
            outcome,
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfirmSummary {
    /// `processed`, `duplicate`, `ignored`, `malformed`, `no_bookings`,
    /// `missing_event_id` or `error`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    pub confirmed: usize,
    pub invalid: usize,
    pub failed: usize,
    pub tokens: Vec<TokenResult>,
}

impl ConfirmSummary {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn record(&mut self, result: TokenResult) {
        match result.outcome {
            TokenOutcome::Confirmed | TokenOutcome::AlreadyConfirmed => self.confirmed += 1,
            TokenOutcome::Invalid => self.invalid += 1,
            TokenOutcome::Failed => self.failed += 1,
        }
        self.tokens.push(result);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmOutcome {
    pub http_status: u16,
    pub summary: ConfirmSummary,
}

impl ConfirmOutcome {
    fn ok(summary: ConfirmSummary) -> Self {
        Self {
            http_status: 200,
            summary,
        }
    }
}

enum Verdict {
    Confirm {
        booking_id: Ulid,
        confirmation: Confirmation,
    },
    AlreadyConfirmed,
    Invalid(String),
}

fn single_value(props: &[BTreeMap<String, String>], key: &str) -> Result<Option<String>, String> {
    let mut found: Option<&String> = None;
    for value in props.iter().filter_map(|p| p.get(key)) {
        match found {
            Some(prev) if prev != value => return Err(format!("inconsistent {key} across line items")),
            _ => found = Some(value),
        }
    }
    Ok(found.cloned())
}

fn required(props: &[BTreeMap<String, String>], key: &str) -> Result<String, String> {
    single_value(props, key)?.ok_or_else(|| format!("missing {key} on order line items"))
}

fn required_date(props: &[BTreeMap<String, String>], key: &str) -> Result<Date, String> {
    let raw = required(props, key)?;
    parse_date(&raw).ok_or_else(|| format!("invalid {key} {raw:?} on order line items"))
}

fn first_value(props: &[BTreeMap<String, String>], key: &str) -> Option<String> {
    props.iter().find_map(|p| p.get(key).cloned())
}

/// Deposit units on the order for `variant`, counting lines that carry this
/// token or no token at all.
fn deposit_quantity(order: &OrderPayload, variant: i64, token: &str) -> i64 {
    order
        .line_items
        .iter()
        .filter(|line| line.variant_id == Some(variant))
        .filter(|line| line.booking_token().is_none_or(|t| t == token))
        .fold(0i64, |total, line| total.saturating_add(line.quantity))
}

/// Sum of price × quantity, rounded to cents.
fn revenue(lines: &[&LineItem]) -> f64 {
    let total: f64 = lines
        .iter()
        .map(|line| line.unit_price().unwrap_or(0.0) * line.quantity as f64)
        .sum();
    (total * 100.0).round() / 100.0
}

impl BookingService {
    /// Process one order-created delivery. Every outcome the protocol resolves,
    /// including invalidations, is a 200; only unexpected failures return 500,
    /// after un-recording the event so the platform's retry is processed.
    pub async fn confirm_from_order(&self, shop: &str, event_id: &str, topic: &str, raw: &str) -> ConfirmOutcome {
        if topic != ORDERS_CREATE {
            tracing::debug!("webhook {event_id} on {shop}: ignoring topic {topic}");
            return ConfirmOutcome::ok(ConfirmSummary::status("ignored"));
        }
        let event_id = event_id.trim();
        if event_id.is_empty() {
            return ConfirmOutcome {
                http_status: 400,
                summary: ConfirmSummary::status("missing_event_id"),
            };
        }

        let now = self.now();
        let event = WebhookEvent {
            shop: shop.to_string(),
            event_id: event_id.to_string(),
            topic: topic.to_string(),
            received_at: now,
        };
        match self.engine.execute(vec![Statement::InsertWebhookEvent(event)]).await {
            Ok(()) => {}
            Err(EngineError::Guard(GuardFailure::DuplicateWebhookEvent { .. })) => {
                tracing::debug!("webhook {event_id} on {shop} already processed");
                metrics::counter!(crate::observability::WEBHOOK_DUPLICATES_TOTAL).increment(1);
                return ConfirmOutcome::ok(ConfirmSummary::status("duplicate"));
            }
            Err(e) => {
                tracing::error!("webhook {event_id} on {shop}: recording event failed: {e}");
                return ConfirmOutcome {
                    http_status: 500,
                    summary: ConfirmSummary::status("error"),
                };
            }
        }

        match self.process_order(shop, raw, now).await {
            Ok(summary) => ConfirmOutcome::ok(summary),
            Err(e) => {
                tracing::error!("webhook {event_id} on {shop}: {e}");
                let forget = Statement::DeleteWebhookEvent {
                    shop: shop.to_string(),
                    event_id: event_id.to_string(),
                };
                if let Err(e) = self.engine.execute(vec![forget]).await {
                    tracing::error!("webhook {event_id} on {shop}: could not un-record event: {e}");
                }
                ConfirmOutcome {
                    http_status: 500,
                    summary: ConfirmSummary::status("error"),
                }
            }
        }
    }

    async fn process_order(&self, shop: &str, raw: &str, now: Ms) -> Result<ConfirmSummary, EngineError> {
        let order = match OrderPayload::parse(raw) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("malformed order payload from {shop}: {e}");
                return Ok(ConfirmSummary::status("malformed"));
            }
        };
        let mut summary = ConfirmSummary {
            status: "processed",
            order_id: Some(order.id),
            ..ConfirmSummary::default()
        };
        let groups = order.lines_by_token();
        if groups.is_empty() {
            tracing::debug!("order {} on {shop} has no booking tokens", order.id);
            summary.status = "no_bookings";
            return Ok(summary);
        }

        let mut compensated = false;
        for (token, indexes) in &groups {
            let lines: Vec<&LineItem> = indexes.iter().filter_map(|&i| order.line_items.get(i)).collect();
            let booking = self.engine.booking_by_token(token).await;
            let verdict = match &booking {
                Some(booking) => self.check_booking(shop, &order, booking, token, &lines, now).await,
                None => Verdict::Invalid(format!("no booking for token {token}")),
            };

            let result = match verdict {
                Verdict::AlreadyConfirmed => {
                    tracing::debug!("booking {token} already confirmed by order {}", order.id);
                    TokenResult::new(token, TokenOutcome::AlreadyConfirmed, None)
                }
                Verdict::Confirm { booking_id, confirmation } => {
                    self.apply_confirmation(booking_id, token, confirmation, now).await?
                }
                Verdict::Invalid(reason) => {
                    self.invalidate(shop, booking.as_ref(), &reason, now).await?;
                    if !compensated {
                        compensated = true;
                        self.compensate(shop, order.id, booking.as_ref(), &reason).await;
                    }
                    TokenResult::new(token, TokenOutcome::Invalid, Some(reason))
                }
            };
            let label = match result.outcome {
                TokenOutcome::Confirmed => "confirmed",
                TokenOutcome::AlreadyConfirmed => "already_confirmed",
                TokenOutcome::Invalid => "invalid",
                TokenOutcome::Failed => "failed",
            };
            metrics::counter!(crate::observability::CONFIRMATIONS_TOTAL, "outcome" => label).increment(1);
            summary.record(result);
        }

        tracing::info!(
            "order {} on {shop}: {} confirmed, {} invalid, {} failed",
            order.id, summary.confirmed, summary.invalid, summary.failed
        );
        Ok(summary)
    }

    async fn check_booking(
        &self,
        shop: &str,
        order: &OrderPayload,
        booking: &Booking,
        token: &str,
        lines: &[&LineItem],
        now: Ms,
    ) -> Verdict {
        if booking.shop != shop {
            return Verdict::Invalid("booking belongs to another shop".to_string());
        }
        if booking.status == BookingStatus::Confirmed && booking.order_id == Some(order.id) {
            return Verdict::AlreadyConfirmed;
        }
        match self.validate_against_order(order, booking, token, lines, now).await {
            Ok(confirmation) => Verdict::Confirm {
                booking_id: booking.id,
                confirmation,
            },
            Err(reason) => Verdict::Invalid(reason),
        }
    }

    async fn validate_against_order(
        &self,
        order: &OrderPayload,
        booking: &Booking,
        token: &str,
        lines: &[&LineItem],
        now: Ms,
    ) -> Result<Confirmation, String> {
        if booking.status != BookingStatus::Hold {
            return Err(match booking.order_id {
                Some(other) if booking.status == BookingStatus::Confirmed => {
                    format!("booking already confirmed by order {other}")
                }
                _ => format!("booking is {}, not HOLD", booking.status),
            });
        }
        if lines.is_empty() {
            return Err("no line items for booking".to_string());
        }

        let props: Vec<BTreeMap<String, String>> = lines.iter().map(|line| line.properties()).collect();
        let start = required_date(&props, order::START_DATE)?;
        let end = required_date(&props, order::END_DATE)?;
        let location = required(&props, order::LOCATION)?;
        if start != booking.start_date || end != booking.end_date {
            return Err(format!(
                "date tampering detected: order has {start}..{end}, booking has {}..{}",
                booking.start_date, booking.end_date
            ));
        }
        if location != booking.location {
            return Err(format!(
                "location tampering detected: order has {location}, booking has {}",
                booking.location
            ));
        }

        // Location rules may have changed since the hold was placed.
        let rules = self
            .engine
            .location(&booking.shop, &booking.location)
            .await
            .ok_or_else(|| format!("location {} no longer exists", booking.location))?;
        let today = self.shop_today(&booking.shop, now).await;
        let earliest_index = day_index(today)
            .checked_add(rules.lead_time_days)
            .ok_or_else(|| format!("location {} has a lead time out of range", rules.code))?;
        if day_index(booking.start_date) < earliest_index {
            return Err(format!("lead time of {} days no longer satisfied", rules.lead_time_days));
        }
        if duration_days(booking.start_date, booking.end_date) < rules.min_duration_days {
            return Err(format!("minimum duration of {} days not met", rules.min_duration_days));
        }

        let items = self.engine.booking_items(booking.id).await;
        if items.is_empty() {
            return Err("booking has no items".to_string());
        }
        for item in &items {
            let ordered: i64 = lines
                .iter()
                .filter(|line| line.variant_id == Some(item.variant_id))
                .filter(|line| line.product_id.is_none_or(|p| p == item.product_id))
                .fold(0i64, |total, line| total.saturating_add(line.quantity));
            if ordered != item.qty {
                return Err(format!(
                    "quantity mismatch for product {} variant {}: booked {}, ordered {ordered}",
                    item.product_id, item.variant_id, item.qty
                ));
            }
        }

        let mut expected_deposits: BTreeMap<i64, i64> = BTreeMap::new();
        for item in &items {
            let deposit = self
                .engine
                .product(&booking.shop, item.product_id)
                .await
                .and_then(|product| product.deposit());
            if let Some((variant, multiplier)) = deposit {
                let expected = expected_deposits.entry(variant).or_default();
                *expected = item
                    .qty
                    .checked_mul(multiplier)
                    .and_then(|qty| expected.checked_add(qty))
                    .ok_or_else(|| format!("deposit for product {} out of range", item.product_id))?;
            }
        }
        for (&variant, &expected) in &expected_deposits {
            let found = deposit_quantity(order, variant, token);
            if found != expected {
                return Err(format!(
                    "deposit mismatch for variant {variant}: expected {expected}, found {found}"
                ));
            }
        }

        if self.engine.booking_days(booking.id).await.is_empty() {
            return Err("booking has no capacity allocations".to_string());
        }

        Ok(Confirmation {
            order_id: order.id,
            customer_name: order.customer_name(),
            customer_email: order.customer_email(),
            revenue: Some(revenue(lines)),
            fulfillment_type: first_value(&props, order::FULFILLMENT_TYPE)
                .or_else(|| first_value(&props, order::FULFILLMENT)),
            delivery_address: first_value(&props, order::DELIVERY_ADDRESS),
        })
    }

    async fn apply_confirmation(
        &self,
        booking_id: Ulid,
        token: &str,
        confirmation: Confirmation,
        now: Ms,
    ) -> Result<TokenResult, EngineError> {
        let order_id = confirmation.order_id;
        let confirm = Statement::Confirm {
            booking_id,
            confirmation,
            at: now,
        };
        match self.engine.execute(vec![confirm]).await {
            Ok(()) => {
                tracing::info!("booking {booking_id} confirmed by order {order_id}");
                Ok(TokenResult::new(token, TokenOutcome::Confirmed, None))
            }
            Err(EngineError::Guard(GuardFailure::StatusMismatch { actual, .. })) => {
                let current = self.engine.booking(booking_id).await;
                if current.is_some_and(|b| b.status == BookingStatus::Confirmed && b.order_id == Some(order_id)) {
                    Ok(TokenResult::new(token, TokenOutcome::AlreadyConfirmed, None))
                } else {
                    tracing::warn!("booking {booking_id} became {actual} while confirming order {order_id}");
                    Ok(TokenResult::new(
                        token,
                        TokenOutcome::Failed,
                        Some(format!("booking became {actual} during confirmation")),
                    ))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a live hold INVALID and hand its capacity back. Bookings that are
    /// not this shop's holds are only reported, never touched.
    async fn invalidate(&self, shop: &str, booking: Option<&Booking>, reason: &str, now: Ms) -> Result<(), EngineError> {
        let Some(booking) = booking.filter(|b| b.shop == shop && b.status == BookingStatus::Hold) else {
            tracing::warn!("order references unusable booking: {reason}");
            return Ok(());
        };
        let days = self.engine.booking_days(booking.id).await;
        let mut batch = vec![Statement::TransitionStatus {
            booking_id: booking.id,
            from: vec![BookingStatus::Hold],
            to: BookingStatus::Invalid,
            reason: Some(reason.to_string()),
            at: now,
        }];
        batch.extend(unreserve_all(&booking.shop, &days));

        match self.engine.execute(batch).await {
            Ok(()) => {
                tracing::warn!("booking {} invalid: {reason}", booking.id);
                Ok(())
            }
            Err(EngineError::Guard(GuardFailure::StatusMismatch { actual, .. })) => {
                tracing::debug!("booking {} moved to {actual} before invalidation", booking.id);
                Ok(())
            }
            Err(e @ EngineError::Guard(GuardFailure::ReservedUnderflow { .. })) => {
                tracing::error!("ledger corruption invalidating booking {}: {e}", booking.id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the platform to cancel the order. A failed call leaves a note on the
    /// booking for manual follow-up.
    async fn compensate(&self, shop: &str, order_id: i64, booking: Option<&Booking>, reason: &str) {
        let message = format!("rental booking rejected: {reason}");
        match self.gateway.cancel_order(shop, order_id, &message).await {
            Ok(()) => tracing::info!("requested cancellation of order {order_id} on {shop}"),
            Err(e) => {
                tracing::warn!("cancelling order {order_id} on {shop} failed: {e}");
                let Some(booking) = booking.filter(|b| b.shop == shop) else {
                    return;
                };
                let note = format!("order {order_id} cancellation failed ({e}); needs manual review");
                if let Err(e) = self.engine.append_note(booking.id, &note, self.now()).await {
                    tracing::error!("could not flag booking {} for review: {e}", booking.id);
                }
            }
        }
    }
}
