mod buckets;
mod error;
mod feed;
mod occupancy;
mod ranking;
pub(crate) mod summary;

pub use buckets::{availability_percent, local_date, local_midnight, BucketWindow, Timeline};
pub use error::ReportError;
pub use occupancy::sweep;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;

use crate::config::ReportConfig;
use crate::model::*;
use crate::observability;
use crate::store::TransactionStore;

/// Current wall-clock time in unix ms.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Assembles dashboard reports from a transaction store and an injected
/// capacity configuration. Holds no mutable state: every call reads the
/// store afresh, so concurrent requests never interfere.
pub struct ReportEngine {
    store: Arc<dyn TransactionStore>,
    config: Arc<ReportConfig>,
}

impl ReportEngine {
    pub fn new(store: Arc<dyn TransactionStore>, config: ReportConfig) -> Result<Self, ReportError> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Fix the store's current view for the rest of one request.
    fn pinned(&self) -> Arc<dyn TransactionStore> {
        self.store.clone().pin()
    }

    pub async fn summary(&self) -> Result<Summary, ReportError> {
        summary::summary(self.pinned().as_ref()).await
    }

    /// One granularity's per-type and aggregate bucket series as of `now`.
    pub async fn occupancy(
        &self,
        granularity: Granularity,
        now: Ms,
    ) -> Result<OccupancySeries, ReportError> {
        occupancy::occupancy_series(self.pinned().as_ref(), &self.config, granularity, now).await
    }

    /// All four granularities, computed concurrently.
    pub async fn peak_borrowing_times(
        &self,
        now: Ms,
    ) -> Result<BTreeMap<Granularity, OccupancySeries>, ReportError> {
        self.all_granularities(self.pinned().as_ref(), now).await
    }

    async fn all_granularities(
        &self,
        store: &dyn TransactionStore,
        now: Ms,
    ) -> Result<BTreeMap<Granularity, OccupancySeries>, ReportError> {
        let series = try_join_all(
            Granularity::ALL.map(|g| occupancy::occupancy_series(store, &self.config, g, now)),
        )
        .await?;
        Ok(Granularity::ALL.into_iter().zip(series).collect())
    }

    pub async fn rankings(&self, now: Ms) -> Result<Rankings, ReportError> {
        ranking::rankings(self.pinned().as_ref(), &self.config, now).await
    }

    pub async fn recent_transactions(&self) -> Result<Vec<FeedEntry>, ReportError> {
        feed::recent(self.pinned().as_ref(), self.config.feed_limit).await
    }

    /// Produce the full report as of `now`. The four stages run concurrently
    /// against one pinned store view; the first failure aborts the report.
    pub async fn generate_report(&self, now: Ms) -> Result<Report, ReportError> {
        let start = Instant::now();
        let pinned = self.pinned();
        let store = pinned.as_ref();
        let result = tokio::try_join!(
            summary::summary(store),
            self.all_granularities(store, now),
            ranking::rankings(store, &self.config, now),
            feed::recent(store, self.config.feed_limit),
        );
        let elapsed = start.elapsed();
        metrics::histogram!(observability::REPORT_DURATION_SECONDS).record(elapsed.as_secs_f64());

        match result {
            Ok((summary, peak_borrowing_times, rankings, recent_transactions)) => {
                metrics::counter!(observability::REPORTS_TOTAL, "status" => "ok").increment(1);
                tracing::debug!(
                    "report generated in {:.1}ms ({} feed entries)",
                    elapsed.as_secs_f64() * 1000.0,
                    recent_transactions.len()
                );
                Ok(Report {
                    generated_at: now,
                    avg_borrowing_duration: summary.avg_borrowing_duration,
                    late_return_rate: summary.late_return_rate,
                    peak_borrowing_times,
                    most_borrowed: rankings.most_borrowed,
                    least_borrowed: rankings.least_borrowed,
                    run_out_frequency: rankings.run_out_frequency,
                    recent_transactions,
                })
            }
            Err(e) => {
                metrics::counter!(observability::REPORTS_TOTAL, "status" => "error").increment(1);
                tracing::warn!("report failed: {e}");
                Err(e)
            }
        }
    }
}
