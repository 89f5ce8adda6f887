use std::fmt;

use jiff::civil::Date;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only timestamp type.
pub type Ms = i64;

/// Inventory ledger key: `(shop, product_id, date)`.
pub type DayKey = (String, i64, Date);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Hold,
    Confirmed,
    Released,
    Expired,
    Invalid,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Hold => "HOLD",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Released => "RELEASED",
            BookingStatus::Expired => "EXPIRED",
            BookingStatus::Invalid => "INVALID",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    /// Case-insensitive parse of the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOLD" => Some(BookingStatus::Hold),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "RELEASED" => Some(BookingStatus::Released),
            "EXPIRED" => Some(BookingStatus::Expired),
            "INVALID" => Some(BookingStatus::Invalid),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Configuration rows (owned by admin CRUD, read by the protocols) ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub domain: String,
    /// IANA zone the storefront's "today" is computed in.
    pub timezone: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub shop: String,
    pub code: String,
    pub name: Option<String>,
    pub active: bool,
    pub lead_time_days: i64,
    pub min_duration_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub shop: String,
    pub product_id: i64,
    /// When set, every booking of this product must use this variant.
    pub variant_id: Option<i64>,
    pub title: Option<String>,
    pub rentable: bool,
    pub default_capacity: i64,
    pub deposit_variant_id: Option<i64>,
    pub deposit_multiplier: Option<i64>,
}

impl Product {
    /// Deposit units owed per rented unit; `None` when no deposit is configured.
    pub fn deposit(&self) -> Option<(i64, i64)> {
        self.deposit_variant_id
            .map(|variant| (variant, self.deposit_multiplier.unwrap_or(1)))
    }
}

// ── Booking aggregate ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Public token carried by cart/order line-item properties.
    pub token: String,
    pub shop: String,
    pub status: BookingStatus,
    pub location: String,
    pub start_date: Date,
    pub end_date: Date,
    /// Only meaningful while `status == Hold`.
    pub expires_at: Option<Ms>,
    pub order_id: Option<i64>,
    pub invalid_reason: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub revenue: Option<f64>,
    pub fulfillment_type: Option<String>,
    pub delivery_address: Option<String>,
    /// Operator-facing notes, e.g. upstream failures that need manual review.
    pub notes: Option<String>,
    pub fulfilled_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_expired_hold(&self, now: Ms) -> bool {
        self.status == BookingStatus::Hold && self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingItem {
    pub booking_id: Ulid,
    pub product_id: i64,
    pub variant_id: i64,
    pub qty: i64,
}

/// Capacity one booking consumed for one product on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDay {
    pub booking_id: Ulid,
    pub product_id: i64,
    pub date: Date,
    pub qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDay {
    pub shop: String,
    pub product_id: i64,
    pub date: Date,
    pub capacity: i64,
    pub reserved_qty: i64,
}

impl InventoryDay {
    pub fn key(&self) -> DayKey {
        (self.shop.clone(), self.product_id, self.date)
    }

    pub fn available(&self) -> i64 {
        (self.capacity - self.reserved_qty).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub shop: String,
    pub event_id: String,
    pub topic: String,
    pub received_at: Ms,
}

/// Fields attached to a booking when an order confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub order_id: i64,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub revenue: Option<f64>,
    pub fulfillment_type: Option<String>,
    pub delivery_address: Option<String>,
}

// ── Statements ────────────────────────────────────────────────

/// One write against the table set. A batch of statements commits or aborts as a
/// unit; the conditional statements abort the batch when they match no row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    UpsertShop(Shop),
    UpsertLocation(Location),
    UpsertProduct(Product),
    /// Conditional: fails if the new capacity is below the day's reserved quantity.
    SetDayCapacity {
        shop: String,
        product_id: i64,
        date: Date,
        capacity: i64,
    },
    InsertBooking(Booking),
    InsertBookingItem(BookingItem),
    /// Insert-if-absent; a no-op when the row already exists.
    EnsureInventoryDay {
        shop: String,
        product_id: i64,
        date: Date,
        capacity: i64,
    },
    /// Conditional: `reserved_qty + qty <= capacity`.
    Reserve {
        shop: String,
        product_id: i64,
        date: Date,
        qty: i64,
    },
    /// Conditional: `reserved_qty >= qty`.
    Unreserve {
        shop: String,
        product_id: i64,
        date: Date,
        qty: i64,
    },
    InsertBookingDay(BookingDay),
    /// Conditional: the booking's current status is one of `from`.
    TransitionStatus {
        booking_id: Ulid,
        from: Vec<BookingStatus>,
        to: BookingStatus,
        reason: Option<String>,
        at: Ms,
    },
    /// Conditional: the booking is still `Hold`.
    Confirm {
        booking_id: Ulid,
        confirmation: Confirmation,
        at: Ms,
    },
    AppendNote {
        booking_id: Ulid,
        note: String,
        at: Ms,
    },
    /// Conditional: the booking is `Confirmed`.
    MarkFulfilled {
        booking_id: Ulid,
        at: Ms,
    },
    /// Conditional: no event with the same `(shop, event_id)` exists.
    InsertWebhookEvent(WebhookEvent),
    DeleteWebhookEvent {
        shop: String,
        event_id: String,
    },
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A batch that committed, replayed verbatim.
    BatchCommitted { statements: Vec<Statement> },
    // Snapshot rows written by compaction.
    ShopRestored(Shop),
    LocationRestored(Location),
    ProductRestored(Product),
    InventoryRestored(InventoryDay),
    BookingRestored {
        booking: Booking,
        items: Vec<BookingItem>,
        days: Vec<BookingDay>,
    },
    WebhookEventRestored(WebhookEvent),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingDetail {
    pub booking: Booking,
    pub items: Vec<BookingItem>,
    pub days: Vec<BookingDay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAvailability {
    pub date: Date,
    pub capacity: i64,
    pub reserved: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    /// Bookings ending on or after this date.
    pub from: Option<Date>,
    /// Bookings starting on or before this date.
    pub to: Option<Date>,
    /// Case-insensitive match on token, customer name/email, or order id.
    pub text: Option<String>,
    pub limit: Option<usize>,
}
