/// Name of the synthetic whole-fleet series in occupancy output.
pub const AGGREGATE_SERIES: &str = "aggregate";

/// Entries kept in most/least borrowed and run-out rankings.
pub const RANKING_SIZE: usize = 5;

/// Trailing window for stock-out incidents, in calendar days.
pub const STOCKOUT_WINDOW_DAYS: u32 = 90;

/// Default number of feed entries.
pub const DEFAULT_FEED_LIMIT: usize = 50;

/// Upper bound on a requested feed size.
pub const MAX_FEED_LIMIT: usize = 1000;

/// Capacity assumed for equipment types missing from the capacity table.
pub const DEFAULT_CAPACITY: u64 = 10;

/// Largest capacity table accepted from configuration.
pub const MAX_CATALOG_ENTRIES: usize = 1024;

/// Longest equipment type name accepted from configuration or the log.
pub const MAX_EQUIPMENT_NAME_LEN: usize = 256;

/// Largest single transaction log record, in bytes.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// UTC offsets outside ±18h are rejected.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;
