use jiff::civil::Date;
use ulid::Ulid;

use crate::dates::list_dates;
use crate::limits::*;
use crate::model::*;

use super::Engine;

impl Engine {
    pub async fn shop(&self, domain: &str) -> Option<Shop> {
        self.read().await.shops.get(domain).cloned()
    }

    pub async fn location(&self, shop: &str, code: &str) -> Option<Location> {
        self.read()
            .await
            .locations
            .get(&(shop.to_string(), code.to_string()))
            .cloned()
    }

    pub async fn product(&self, shop: &str, product_id: i64) -> Option<Product> {
        self.read()
            .await
            .products
            .get(&(shop.to_string(), product_id))
            .cloned()
    }

    pub async fn booking(&self, id: Ulid) -> Option<Booking> {
        self.read().await.bookings.get(&id).cloned()
    }

    pub async fn booking_by_token(&self, token: &str) -> Option<Booking> {
        let tables = self.read().await;
        let id = tables.tokens.get(token)?;
        tables.bookings.get(id).cloned()
    }

    pub async fn booking_items(&self, id: Ulid) -> Vec<BookingItem> {
        self.read().await.items.get(&id).cloned().unwrap_or_default()
    }

    pub async fn booking_days(&self, id: Ulid) -> Vec<BookingDay> {
        self.read().await.days.get(&id).cloned().unwrap_or_default()
    }

    /// Booking plus its items and day allocations, scoped to `shop`.
    pub async fn booking_detail(&self, shop: &str, token: &str) -> Option<BookingDetail> {
        let tables = self.read().await;
        let id = tables.tokens.get(token)?;
        let booking = tables.bookings.get(id).filter(|b| b.shop == shop)?;
        Some(BookingDetail {
            booking: booking.clone(),
            items: tables.items.get(id).cloned().unwrap_or_default(),
            days: tables.days.get(id).cloned().unwrap_or_default(),
        })
    }

    pub async fn inventory_day(&self, shop: &str, product_id: i64, date: Date) -> Option<InventoryDay> {
        self.read()
            .await
            .inventory
            .get(&(shop.to_string(), product_id, date))
            .cloned()
    }

    /// Per-day capacity for one product. Days without a ledger row report the
    /// product's default capacity and nothing reserved.
    pub async fn availability(
        &self,
        shop: &str,
        product_id: i64,
        start: Date,
        end: Date,
    ) -> Option<Vec<DayAvailability>> {
        let dates = list_dates(start, end)?;
        if dates.len() as i64 > MAX_AVAILABILITY_DAYS {
            return None;
        }
        let tables = self.read().await;
        let product = tables.products.get(&(shop.to_string(), product_id))?;
        let default_capacity = product.default_capacity.max(0);
        Some(
            dates
                .into_iter()
                .map(|date| {
                    let (capacity, reserved) = tables
                        .inventory
                        .get(&(shop.to_string(), product_id, date))
                        .map_or((default_capacity, 0), |row| (row.capacity, row.reserved_qty));
                    DayAvailability {
                        date,
                        capacity,
                        reserved,
                        available: (capacity - reserved).max(0),
                    }
                })
                .collect(),
        )
    }

    /// Bookings for a shop, newest first.
    pub async fn list_bookings(&self, shop: &str, filter: &BookingFilter) -> Vec<Booking> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let needle = filter
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let tables = self.read().await;
        let mut out: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| b.shop == shop)
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .filter(|b| filter.from.is_none_or(|from| b.end_date >= from))
            .filter(|b| filter.to.is_none_or(|to| b.start_date <= to))
            .filter(|b| needle.as_deref().is_none_or(|n| matches_text(b, n)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        out
    }

    /// Ids of holds whose expiry is at or before `now`.
    pub async fn expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let tables = self.read().await;
        let mut expired: Vec<Ulid> = tables
            .bookings
            .values()
            .filter(|b| b.is_expired_hold(now))
            .map(|b| b.id)
            .collect();
        expired.sort();
        expired
    }

    pub async fn webhook_event(&self, shop: &str, event_id: &str) -> Option<WebhookEvent> {
        self.read()
            .await
            .webhook_events
            .get(&(shop.to_string(), event_id.to_string()))
            .cloned()
    }
}

fn matches_text(booking: &Booking, needle: &str) -> bool {
    let contains = |field: &Option<String>| {
        field
            .as_deref()
            .is_some_and(|v| v.to_lowercase().contains(needle))
    };
    booking.token.to_lowercase().contains(needle)
        || contains(&booking.customer_name)
        || contains(&booking.customer_email)
        || booking
            .order_id
            .is_some_and(|id| id.to_string().contains(needle))
}
