use jiff::civil::Date;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a conditional statement matched no row and aborted its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardFailure {
    /// `reserved_qty + qty <= capacity` did not hold (or the day row is missing).
    CapacityExhausted { product_id: i64, date: Date },
    /// `reserved_qty >= qty` did not hold on release. Indicates ledger corruption.
    ReservedUnderflow { product_id: i64, date: Date },
    /// Capacity override below what is already reserved.
    CapacityBelowReserved { product_id: i64, date: Date, reserved: i64 },
    StatusMismatch { booking_id: Ulid, actual: BookingStatus },
    BookingMissing(Ulid),
    DuplicateBooking(Ulid),
    DuplicateToken,
    DuplicateWebhookEvent { shop: String, event_id: String },
}

impl std::fmt::Display for GuardFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardFailure::CapacityExhausted { product_id, date } => {
                write!(f, "capacity exhausted for product {product_id} on {date}")
            }
            GuardFailure::ReservedUnderflow { product_id, date } => {
                write!(f, "reserved quantity underflow for product {product_id} on {date}")
            }
            GuardFailure::CapacityBelowReserved { product_id, date, reserved } => write!(
                f,
                "capacity for product {product_id} on {date} cannot drop below reserved {reserved}"
            ),
            GuardFailure::StatusMismatch { booking_id, actual } => {
                write!(f, "booking {booking_id} is {actual}")
            }
            GuardFailure::BookingMissing(id) => write!(f, "booking {id} does not exist"),
            GuardFailure::DuplicateBooking(id) => write!(f, "booking {id} already exists"),
            GuardFailure::DuplicateToken => write!(f, "booking token already in use"),
            GuardFailure::DuplicateWebhookEvent { shop, event_id } => {
                write!(f, "webhook event {event_id} for {shop} already recorded")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// A conditional statement aborted the batch; nothing was written.
    Guard(GuardFailure),
    /// Rejected before any statement ran.
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn guard(&self) -> Option<&GuardFailure> {
        match self {
            EngineError::Guard(g) => Some(g),
            _ => None,
        }
    }

    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, EngineError::Guard(GuardFailure::CapacityExhausted { .. }))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Guard(g) => write!(f, "batch aborted: {g}"),
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GuardFailure> for EngineError {
    fn from(g: GuardFailure) -> Self {
        EngineError::Guard(g)
    }
}
