use std::collections::BTreeMap;

use jiff::civil::Date;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::dates::{day_index, duration_days, list_dates, parse_date};
use crate::engine::{EngineError, GuardFailure};
use crate::limits::MAX_ITEMS_PER_HOLD;
use crate::model::*;

use super::BookingService;

#[derive(Debug, Clone, Deserialize)]
pub struct HoldItem {
    pub product_id: i64,
    #[serde(default)]
    pub variant_id: Option<i64>,
    pub qty: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HoldRequest {
    pub location: String,
    pub start_date: String,
    pub end_date: String,
    pub items: Vec<HoldItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldReceipt {
    pub booking_id: Ulid,
    pub booking_token: String,
    pub expires_at: Ms,
}

/// Why a hold was refused. Everything except [`HoldError::CapacityExceeded`] is
/// detected before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldError {
    UnknownLocation(String),
    LocationInactive(String),
    /// The location's day rules cannot be evaluated (out of range).
    InvalidLocationRules(String),
    InvalidDates,
    RangeTooLong { max_days: i64 },
    LeadTime { earliest: Date },
    MinDuration { min_days: i64 },
    NoItems,
    TooManyItems,
    InvalidQuantity { product_id: i64 },
    UnknownProduct(i64),
    NotRentable(i64),
    InvalidCapacity(i64),
    VariantMismatch { product_id: i64, expected: i64 },
    InvalidVariant { product_id: i64 },
    ConflictingVariants { product_id: i64 },
    TooManyUnits { max_units: i64 },
    CapacityExceeded { product_id: i64, date: Date },
}

impl HoldError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            HoldError::UnknownLocation(_) => "unknown_location",
            HoldError::LocationInactive(_) => "location_inactive",
            HoldError::InvalidLocationRules(_) => "invalid_location_rules",
            HoldError::InvalidDates => "invalid_dates",
            HoldError::RangeTooLong { .. } => "range_too_long",
            HoldError::LeadTime { .. } => "lead_time",
            HoldError::MinDuration { .. } => "min_duration",
            HoldError::NoItems => "no_items",
            HoldError::TooManyItems => "too_many_items",
            HoldError::InvalidQuantity { .. } => "invalid_quantity",
            HoldError::UnknownProduct(_) => "unknown_product",
            HoldError::NotRentable(_) => "not_rentable",
            HoldError::InvalidCapacity(_) => "invalid_capacity",
            HoldError::VariantMismatch { .. } => "variant_mismatch",
            HoldError::InvalidVariant { .. } => "invalid_variant",
            HoldError::ConflictingVariants { .. } => "conflicting_variants",
            HoldError::TooManyUnits { .. } => "too_many_units",
            HoldError::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }

    /// Capacity conflicts ask the shopper for other dates; everything else is bad input.
    pub fn is_capacity_conflict(&self) -> bool {
        matches!(self, HoldError::CapacityExceeded { .. })
    }
}

impl std::fmt::Display for HoldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldError::UnknownLocation(code) => write!(f, "unknown location {code}"),
            HoldError::LocationInactive(code) => write!(f, "location {code} is not taking bookings"),
            HoldError::InvalidLocationRules(code) => {
                write!(f, "location {code} has day rules out of range")
            }
            HoldError::InvalidDates => write!(f, "dates must be YYYY-MM-DD with start on or before end"),
            HoldError::RangeTooLong { max_days } => write!(f, "bookings may span at most {max_days} days"),
            HoldError::LeadTime { earliest } => write!(f, "earliest available start date is {earliest}"),
            HoldError::MinDuration { min_days } => write!(f, "bookings must be at least {min_days} days"),
            HoldError::NoItems => write!(f, "at least one item is required"),
            HoldError::TooManyItems => write!(f, "too many distinct products in one booking"),
            HoldError::InvalidQuantity { product_id } => {
                write!(f, "quantity for product {product_id} must be a positive integer")
            }
            HoldError::UnknownProduct(id) => write!(f, "unknown product {id}"),
            HoldError::NotRentable(id) => write!(f, "product {id} is not rentable"),
            HoldError::InvalidCapacity(id) => write!(f, "product {id} has no valid capacity configured"),
            HoldError::VariantMismatch { product_id, expected } => {
                write!(f, "product {product_id} must be booked as variant {expected}")
            }
            HoldError::InvalidVariant { product_id } => {
                write!(f, "product {product_id} requires a positive variant id")
            }
            HoldError::ConflictingVariants { product_id } => {
                write!(f, "product {product_id} requested with conflicting variants")
            }
            HoldError::TooManyUnits { max_units } => write!(f, "at most {max_units} units per booking"),
            HoldError::CapacityExceeded { product_id, date } => {
                write!(f, "product {product_id} is fully booked on {date}")
            }
        }
    }
}

impl std::error::Error for HoldError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    Held(HoldReceipt),
    Rejected(HoldError),
}

/// One product of a hold after validation and merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolvedItem {
    variant_id: i64,
    qty: i64,
    default_capacity: i64,
}

impl BookingService {
    /// Validate a prospective reservation and, if every rule passes, reserve its
    /// capacity for every day of the range in one atomic batch.
    pub async fn place_hold(&self, shop: &str, req: &HoldRequest) -> Result<HoldOutcome, EngineError> {
        let now = self.now();
        let outcome = match self.validate_hold(shop, req, now).await {
            Ok((start, end, items)) => self.reserve(shop, &req.location, start, end, &items, now).await?,
            Err(e) => HoldOutcome::Rejected(e),
        };
        match &outcome {
            HoldOutcome::Held(receipt) => {
                tracing::info!(
                    "hold {} on {shop}: {} {}..{} expires {}",
                    receipt.booking_id, req.location, req.start_date, req.end_date, receipt.expires_at
                );
                metrics::counter!(crate::observability::HOLDS_TOTAL, "outcome" => "held").increment(1);
            }
            HoldOutcome::Rejected(e) => {
                tracing::debug!("hold rejected on {shop}: {e}");
                metrics::counter!(crate::observability::HOLDS_TOTAL, "outcome" => e.code()).increment(1);
            }
        }
        Ok(outcome)
    }

    async fn validate_hold(
        &self,
        shop: &str,
        req: &HoldRequest,
        now: Ms,
    ) -> Result<(Date, Date, BTreeMap<i64, ResolvedItem>), HoldError> {
        let location = self
            .engine
            .location(shop, &req.location)
            .await
            .ok_or_else(|| HoldError::UnknownLocation(req.location.clone()))?;
        if !location.active {
            return Err(HoldError::LocationInactive(location.code));
        }

        let (Some(start), Some(end)) = (parse_date(&req.start_date), parse_date(&req.end_date)) else {
            return Err(HoldError::InvalidDates);
        };
        if start > end {
            return Err(HoldError::InvalidDates);
        }
        let days = duration_days(start, end);
        if days > self.settings.max_days {
            return Err(HoldError::RangeTooLong { max_days: self.settings.max_days });
        }

        let today = self.shop_today(shop, now).await;
        let earliest_index = day_index(today)
            .checked_add(location.lead_time_days)
            .ok_or_else(|| HoldError::InvalidLocationRules(location.code.clone()))?;
        if day_index(start) < earliest_index {
            let earliest = jiff::Span::new()
                .try_days(location.lead_time_days)
                .ok()
                .and_then(|span| today.checked_add(span).ok())
                .unwrap_or(today);
            return Err(HoldError::LeadTime { earliest });
        }
        if days < location.min_duration_days {
            return Err(HoldError::MinDuration { min_days: location.min_duration_days });
        }

        if req.items.is_empty() {
            return Err(HoldError::NoItems);
        }
        let mut merged: BTreeMap<i64, ResolvedItem> = BTreeMap::new();
        let mut total_units = 0i64;
        for item in &req.items {
            if item.qty <= 0 {
                return Err(HoldError::InvalidQuantity { product_id: item.product_id });
            }
            let product = self
                .engine
                .product(shop, item.product_id)
                .await
                .ok_or(HoldError::UnknownProduct(item.product_id))?;
            if !product.rentable {
                return Err(HoldError::NotRentable(product.product_id));
            }
            if product.default_capacity < 0 {
                return Err(HoldError::InvalidCapacity(product.product_id));
            }
            let variant_id = match (product.variant_id, item.variant_id) {
                (Some(expected), Some(given)) if given != expected => {
                    return Err(HoldError::VariantMismatch { product_id: product.product_id, expected });
                }
                (Some(expected), _) => expected,
                (None, Some(given)) if given > 0 => given,
                (None, _) => return Err(HoldError::InvalidVariant { product_id: product.product_id }),
            };

            total_units = total_units.saturating_add(item.qty);
            match merged.get_mut(&product.product_id) {
                Some(existing) if existing.variant_id != variant_id => {
                    return Err(HoldError::ConflictingVariants { product_id: product.product_id });
                }
                Some(existing) => {
                    existing.qty = existing
                        .qty
                        .checked_add(item.qty)
                        .ok_or(HoldError::TooManyUnits { max_units: self.settings.max_units })?;
                }
                None => {
                    merged.insert(
                        product.product_id,
                        ResolvedItem {
                            variant_id,
                            qty: item.qty,
                            default_capacity: product.default_capacity,
                        },
                    );
                }
            }
        }
        if merged.len() > MAX_ITEMS_PER_HOLD {
            return Err(HoldError::TooManyItems);
        }
        if total_units > self.settings.max_units {
            return Err(HoldError::TooManyUnits { max_units: self.settings.max_units });
        }

        Ok((start, end, merged))
    }

    async fn reserve(
        &self,
        shop: &str,
        location: &str,
        start: Date,
        end: Date,
        items: &BTreeMap<i64, ResolvedItem>,
        now: Ms,
    ) -> Result<HoldOutcome, EngineError> {
        let dates = list_dates(start, end).ok_or(EngineError::Invalid("empty date range"))?;
        let booking_id = Ulid::new();
        let token = Uuid::new_v4().to_string();
        let expires_at = now + self.settings.ttl_ms;

        let mut batch = Vec::with_capacity(1 + items.len() + dates.len() * items.len() * 3);
        batch.push(Statement::InsertBooking(Booking {
            id: booking_id,
            token: token.clone(),
            shop: shop.to_string(),
            status: BookingStatus::Hold,
            location: location.to_string(),
            start_date: start,
            end_date: end,
            expires_at: Some(expires_at),
            order_id: None,
            invalid_reason: None,
            customer_name: None,
            customer_email: None,
            revenue: None,
            fulfillment_type: None,
            delivery_address: None,
            notes: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        }));
        for (&product_id, item) in items {
            batch.push(Statement::InsertBookingItem(BookingItem {
                booking_id,
                product_id,
                variant_id: item.variant_id,
                qty: item.qty,
            }));
        }
        for &date in &dates {
            for (&product_id, item) in items {
                batch.push(Statement::EnsureInventoryDay {
                    shop: shop.to_string(),
                    product_id,
                    date,
                    capacity: item.default_capacity,
                });
                batch.push(Statement::Reserve {
                    shop: shop.to_string(),
                    product_id,
                    date,
                    qty: item.qty,
                });
                batch.push(Statement::InsertBookingDay(BookingDay {
                    booking_id,
                    product_id,
                    date,
                    qty: item.qty,
                }));
            }
        }

        match self.engine.execute(batch).await {
            Ok(()) => Ok(HoldOutcome::Held(HoldReceipt {
                booking_id,
                booking_token: token,
                expires_at,
            })),
            Err(EngineError::Guard(GuardFailure::CapacityExhausted { product_id, date })) => {
                Ok(HoldOutcome::Rejected(HoldError::CapacityExceeded { product_id, date }))
            }
            Err(e) => Err(e),
        }
    }
}
