//! Hard caps on request and storage sizes.

/// Statements accepted in a single atomic batch.
pub const MAX_BATCH_STATEMENTS: usize = 20_000;

/// Distinct products in one hold.
pub const MAX_ITEMS_PER_HOLD: usize = 25;

pub const MAX_NOTE_LEN: usize = 4_096;
pub const MAX_NOTES_LEN: usize = 65_536;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 64;

/// Upper bound for a location's lead time and minimum duration, in days.
pub const MAX_RULE_DAYS: i64 = 3_650;
pub const MAX_DEPOSIT_MULTIPLIER: i64 = 100;

/// Raw webhook body size accepted before JSON parsing.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Rows returned by an admin listing when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1_000;

/// Widest date range a read-only availability query may span.
pub const MAX_AVAILABILITY_DAYS: i64 = 366;
