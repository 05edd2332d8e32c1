use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Normalized lookup key for an equipment type. Matching is case-insensitive;
/// the display casing lives next to the key wherever it is needed.
pub fn equipment_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Outstanding and not (yet) overdue.
    Pending,
    /// Overdue, or returned after the due threshold.
    Late,
    /// Fully returned on time.
    Returned,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Late => "LATE",
            Status::Returned => "RETURNED",
        }
    }
}

/// One checkout and everything returned against it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Ulid,
    pub borrower_id: String,
    pub borrower_name: String,
    pub equipment_type: String,
    pub out_quantity: u32,
    pub out_at: Ms,
    /// Cumulative units returned. `None` until the first return.
    pub in_quantity: Option<u32>,
    /// Set by the return that resolves the transaction.
    pub in_at: Option<Ms>,
    pub status: Status,
    /// `in_at` if present, else `out_at`. Kept in sync by the setters below.
    pub effective_at: Ms,
}

impl Transaction {
    pub fn checked_out(
        id: Ulid,
        borrower_id: String,
        borrower_name: String,
        equipment_type: String,
        out_quantity: u32,
        out_at: Ms,
    ) -> Self {
        Self {
            id,
            borrower_id,
            borrower_name,
            equipment_type,
            out_quantity,
            out_at,
            in_quantity: None,
            in_at: None,
            status: Status::Pending,
            effective_at: out_at,
        }
    }

    pub fn key(&self) -> String {
        equipment_key(&self.equipment_type)
    }

    pub fn is_outstanding(&self) -> bool {
        self.status == Status::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.in_at.is_some()
    }

    /// Record a (possibly partial) return. The transaction resolves once the
    /// cumulative returned quantity reaches `out_quantity`.
    pub fn record_return(&mut self, quantity: u32, at: Ms, late: bool) {
        let total = self.in_quantity.unwrap_or(0).saturating_add(quantity);
        self.in_quantity = Some(total);
        if late {
            self.status = Status::Late;
        }
        if self.in_at.is_none() && total >= self.out_quantity {
            self.in_at = Some(at);
            if self.status == Status::Pending {
                self.status = Status::Returned;
            }
        }
        self.effective_at = self.in_at.unwrap_or(self.out_at);
    }

    pub fn mark_late(&mut self) {
        if self.status != Status::Returned {
            self.status = Status::Late;
        }
    }

    /// Whole days between checkout and return, truncated toward zero. `None`
    /// while unresolved or when the timestamps are too far apart to subtract.
    pub fn duration_days(&self) -> Option<i64> {
        self.in_at?.checked_sub(self.out_at).map(|ms| ms / DAY_MS)
    }

    pub fn feed_kind(&self) -> FeedKind {
        match self.in_at {
            Some(in_at) if in_at > self.out_at => FeedKind::Return,
            _ => FeedKind::Borrow,
        }
    }
}

/// Transaction log record. Flat, no nesting; this is the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CheckedOut {
        id: Ulid,
        borrower_id: String,
        borrower_name: String,
        equipment: String,
        quantity: u32,
        at: Ms,
    },
    Returned {
        id: Ulid,
        quantity: u32,
        at: Ms,
        late: bool,
    },
    MarkedLate {
        id: Ulid,
    },
}

impl Event {
    pub fn transaction_id(&self) -> Ulid {
        match self {
            Event::CheckedOut { id, .. } | Event::Returned { id, .. } | Event::MarkedLate { id } => *id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowCount {
    pub equipment_type: String,
    pub borrow_count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyBorrowed {
    pub equipment_type: String,
    pub date: chrono::NaiveDate,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding {
    pub equipment_type: String,
    pub quantity: u64,
}

// ── Report types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    pub fn bucket_count(&self) -> usize {
        match self {
            Granularity::Hour => 24,
            Granularity::Day => 7,
            Granularity::Week => 4,
            Granularity::Month => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hour" => Some(Granularity::Hour),
            "day" | "weekday" => Some(Granularity::Day),
            "week" => Some(Granularity::Week),
            "month" => Some(Granularity::Month),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Healthy,
    Moderate,
    Critical,
}

impl Health {
    /// Lower bound of each band is inclusive.
    pub fn classify(availability_percent: f64) -> Self {
        if availability_percent >= 75.0 {
            Health::Healthy
        } else if availability_percent >= 30.0 {
            Health::Moderate
        } else {
            Health::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Moderate => "Moderate",
            Health::Critical => "Critical",
        }
    }
}

/// Calendar identity of a bucket, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BucketPeriod {
    Hour {
        hour: u32,
    },
    #[serde(rename_all = "camelCase")]
    Day {
        date: chrono::NaiveDate,
        weekday: String,
    },
    #[serde(rename_all = "camelCase")]
    Week {
        week_start: chrono::NaiveDate,
        week_end: chrono::NaiveDate,
    },
    Month {
        year: i32,
        month: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub index: usize,
    pub label: String,
    pub period: BucketPeriod,
    /// Units outstanding at the end of the bucket, never negative.
    pub borrowed: u64,
    pub capacity: u64,
    pub availability_percent: f64,
    pub health: Health,
}

/// Every series for one granularity: one per catalog type plus `aggregate`.
/// Serializes as a single map keyed by display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancySeries {
    #[serde(skip)]
    pub granularity: Granularity,
    pub aggregate: Vec<Bucket>,
    #[serde(flatten)]
    pub equipment: BTreeMap<String, Vec<Bucket>>,
}

impl OccupancySeries {
    pub fn series(&self, equipment: &str) -> Option<&[Bucket]> {
        if equipment.eq_ignore_ascii_case(crate::limits::AGGREGATE_SERIES) {
            return Some(&self.aggregate);
        }
        let key = equipment_key(equipment);
        self.equipment
            .iter()
            .find(|(name, _)| equipment_key(name) == key)
            .map(|(_, buckets)| buckets.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutEntry {
    pub equipment_type: String,
    pub run_out_count: u32,
    pub capacity: u64,
    pub percentage: f64,
    pub currently_borrowed: u64,
    pub utilization_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Borrow,
    Return,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Borrow => "borrow",
            FeedKind::Return => "return",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub kind: FeedKind,
    #[serde(flatten)]
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub avg_borrowing_duration: f64,
    pub late_return_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rankings {
    pub most_borrowed: Vec<BorrowCount>,
    pub least_borrowed: Vec<BorrowCount>,
    pub run_out_frequency: Vec<RunOutEntry>,
}

/// Everything the dashboard renders, assembled from one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub generated_at: Ms,
    pub avg_borrowing_duration: f64,
    pub late_return_rate: f64,
    pub peak_borrowing_times: BTreeMap<Granularity, OccupancySeries>,
    pub most_borrowed: Vec<BorrowCount>,
    pub least_borrowed: Vec<BorrowCount>,
    pub run_out_frequency: Vec<RunOutEntry>,
    pub recent_transactions: Vec<FeedEntry>,
}

impl Report {
    pub fn occupancy(&self, granularity: Granularity) -> Option<&OccupancySeries> {
        self.peak_borrowing_times.get(&granularity)
    }
}
