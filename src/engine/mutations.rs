use jiff::civil::Date;
use jiff::tz::TimeZone;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn upsert_shop(&self, domain: &str, timezone: &str, now: Ms) -> Result<Shop, EngineError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(EngineError::Invalid("shop domain is required"));
        }
        if domain.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("shop domain too long"));
        }
        if TimeZone::get(timezone).is_err() {
            return Err(EngineError::Invalid("unknown time zone"));
        }
        let created_at = self.shop(domain).await.map_or(now, |s| s.created_at);
        let shop = Shop {
            domain: domain.to_string(),
            timezone: timezone.to_string(),
            created_at,
        };
        self.execute(vec![Statement::UpsertShop(shop.clone())]).await?;
        tracing::info!("shop {domain} saved (tz {timezone})");
        Ok(shop)
    }

    pub async fn upsert_location(&self, location: Location) -> Result<(), EngineError> {
        if location.code.trim().is_empty() {
            return Err(EngineError::Invalid("location code is required"));
        }
        if location.code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("location code too long"));
        }
        if location.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("location name too long"));
        }
        if location.lead_time_days < 0 || location.min_duration_days < 0 {
            return Err(EngineError::Invalid("day rules must be non-negative"));
        }
        if location.lead_time_days > MAX_RULE_DAYS || location.min_duration_days > MAX_RULE_DAYS {
            return Err(EngineError::LimitExceeded("day rules too large"));
        }
        if self.shop(&location.shop).await.is_none() {
            return Err(EngineError::Invalid("unknown shop"));
        }
        self.execute(vec![Statement::UpsertLocation(location)]).await
    }

    pub async fn upsert_product(&self, product: Product) -> Result<(), EngineError> {
        if product.product_id <= 0 {
            return Err(EngineError::Invalid("product id must be positive"));
        }
        if product.variant_id.is_some_and(|v| v <= 0) {
            return Err(EngineError::Invalid("variant id must be positive"));
        }
        if product.default_capacity < 0 {
            return Err(EngineError::Invalid("default capacity must be non-negative"));
        }
        if product.deposit_variant_id.is_some_and(|v| v <= 0) {
            return Err(EngineError::Invalid("deposit variant id must be positive"));
        }
        if product.deposit_multiplier.is_some_and(|m| m < 1) {
            return Err(EngineError::Invalid("deposit multiplier must be at least 1"));
        }
        if product.deposit_multiplier.is_some_and(|m| m > MAX_DEPOSIT_MULTIPLIER) {
            return Err(EngineError::LimitExceeded("deposit multiplier too large"));
        }
        if product.title.as_ref().is_some_and(|t| t.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("product title too long"));
        }
        if self.shop(&product.shop).await.is_none() {
            return Err(EngineError::Invalid("unknown shop"));
        }
        self.execute(vec![Statement::UpsertProduct(product)]).await
    }

    /// Override one day's capacity. Fails with a guard error if the day already has
    /// more reserved than the new capacity.
    pub async fn set_day_capacity(
        &self,
        shop: &str,
        product_id: i64,
        date: Date,
        capacity: i64,
    ) -> Result<(), EngineError> {
        if capacity < 0 {
            return Err(EngineError::Invalid("capacity must be non-negative"));
        }
        if self.product(shop, product_id).await.is_none() {
            return Err(EngineError::Invalid("unknown product"));
        }
        self.execute(vec![Statement::SetDayCapacity {
            shop: shop.to_string(),
            product_id,
            date,
            capacity,
        }])
        .await
    }

    /// Append an operator note, keeping whatever notes are already there.
    pub async fn append_note(&self, booking_id: Ulid, note: &str, at: Ms) -> Result<(), EngineError> {
        let mut note = note.to_string();
        if note.len() > MAX_NOTE_LEN {
            let mut cut = MAX_NOTE_LEN;
            while !note.is_char_boundary(cut) {
                cut -= 1;
            }
            note.truncate(cut);
        }
        let existing = self
            .booking(booking_id)
            .await
            .and_then(|b| b.notes)
            .map_or(0, |n| n.len());
        if existing + note.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("booking notes full"));
        }
        self.execute(vec![Statement::AppendNote { booking_id, note, at }]).await
    }
}
