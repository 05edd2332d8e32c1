use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::FixedOffset;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{InMemoryStore, StoreError, TransactionStore};

/// Transaction store backed by the append-only log. Queries run against an
/// immutable in-memory snapshot; `reload` replays the log into a fresh
/// snapshot and swaps it in, so in-flight reports never see a half-applied log.
/// A report pins one snapshot up front (see [`TransactionStore::pin`]) and
/// keeps reading it even if a reload lands mid-report.
pub struct LogStore {
    path: PathBuf,
    snapshot: RwLock<Arc<InMemoryStore>>,
    /// Log length at the last successful load.
    loaded_len: AtomicU64,
}

impl LogStore {
    /// Replay the log at `path`. A missing file yields an empty store.
    pub fn open(path: &Path) -> io::Result<Self> {
        let len = log_len(path)?;
        let store = load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            snapshot: RwLock::new(Arc::new(store)),
            loaded_len: AtomicU64::new(len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<InMemoryStore> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload if the log changed size since the last load.
    pub async fn reload_if_changed(&self) -> io::Result<bool> {
        let len = log_len(&self.path)?;
        if len == self.loaded_len.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    pub async fn reload(&self) -> io::Result<()> {
        let path = self.path.clone();
        let (len, store) = tokio::task::spawn_blocking(move || -> io::Result<_> {
            let len = log_len(&path)?;
            Ok((len, load(&path)?))
        })
        .await
        .map_err(io::Error::other)??;

        let count = store.transaction_count();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(store);
        self.loaded_len.store(len, Ordering::Release);
        metrics::counter!(observability::STORE_RELOADS_TOTAL).increment(1);
        tracing::info!("reloaded {} ({count} transactions)", self.path.display());
        Ok(())
    }
}

fn log_len(path: &Path) -> io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn load(path: &Path) -> io::Result<InMemoryStore> {
    let events = Wal::replay(path)?;
    let (store, stats) = InMemoryStore::from_events(&events);
    if stats.skipped > 0 {
        tracing::warn!("{}: skipped {} of {} log records", path.display(), stats.skipped, events.len());
    }
    metrics::gauge!(observability::STORE_TRANSACTIONS).set(store.transaction_count() as f64);
    Ok(store)
}

#[async_trait]
impl TransactionStore for LogStore {
    fn pin(self: Arc<Self>) -> Arc<dyn TransactionStore> {
        self.snapshot()
    }

    async fn average_duration_days(&self) -> Result<f64, StoreError> {
        self.snapshot().average_duration_days().await
    }

    async fn late_rate(&self) -> Result<f64, StoreError> {
        self.snapshot().late_rate().await
    }

    async fn transactions_in_window(
        &self,
        equipment: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.snapshot()
            .transactions_in_window(equipment, start, end)
            .await
    }

    async fn outstanding_before(&self, equipment: &str, cutoff: Ms) -> Result<u64, StoreError> {
        self.snapshot().outstanding_before(equipment, cutoff).await
    }

    async fn grouped_counts(&self) -> Result<Vec<BorrowCount>, StoreError> {
        self.snapshot().grouped_counts().await
    }

    async fn daily_borrowed_sums(
        &self,
        since: Ms,
        offset: FixedOffset,
    ) -> Result<Vec<DailyBorrowed>, StoreError> {
        self.snapshot().daily_borrowed_sums(since, offset).await
    }

    async fn currently_outstanding(&self) -> Result<Vec<Outstanding>, StoreError> {
        self.snapshot().currently_outstanding().await
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        self.snapshot().recent_transactions(limit).await
    }
}
