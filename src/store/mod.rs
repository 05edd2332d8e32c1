//! Read-only query interface the report engine consumes, plus the bundled
//! implementations: an in-memory index and a log-backed wrapper that replays
//! the transaction log into it.

mod log;
mod memory;

pub use log::LogStore;
pub use memory::{InMemoryStore, LoadStats};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::FixedOffset;

use crate::model::*;

/// Everything the engine is allowed to ask of persistence. All queries are
/// read-only and commute, so callers may issue them concurrently.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// A view that stays fixed while a report reads from it. Stores that
    /// never change in place return themselves.
    fn pin(self: Arc<Self>) -> Arc<dyn TransactionStore>;

    /// Mean whole-day duration of `RETURNED` transactions with both timestamps.
    async fn average_duration_days(&self) -> Result<f64, StoreError>;

    /// Percentage of `LATE` transactions among `LATE | RETURNED | PENDING`.
    async fn late_rate(&self) -> Result<f64, StoreError>;

    /// Transactions of one equipment type opened in `[start, end)`, ordered by `out_at`.
    async fn transactions_in_window(
        &self,
        equipment: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Units of `PENDING` transactions of one type opened before `cutoff`.
    async fn outstanding_before(&self, equipment: &str, cutoff: Ms) -> Result<u64, StoreError>;

    /// Transaction count per equipment type, with share of all transactions.
    async fn grouped_counts(&self) -> Result<Vec<BorrowCount>, StoreError>;

    /// Units borrowed per equipment type and local calendar day, for
    /// transactions opened at or after `since`.
    async fn daily_borrowed_sums(
        &self,
        since: Ms,
        offset: FixedOffset,
    ) -> Result<Vec<DailyBorrowed>, StoreError>;

    /// Units of `PENDING` transactions per equipment type.
    async fn currently_outstanding(&self) -> Result<Vec<Outstanding>, StoreError>;

    /// Most recent transactions by effective timestamp, newest first.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached (connection, timeout, unreadable log).
    Unavailable(String),
    /// A specific query failed.
    QueryFailed { query: &'static str, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "transaction store unavailable: {msg}"),
            StoreError::QueryFailed { query, message } => {
                write!(f, "query {query} failed: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
