use crate::model::*;
use crate::store::TransactionStore;

use super::error::ReportError;

/// Classify transactions as feed events, newest first by `effective_at`
/// with ties broken by id.
pub fn feed_entries(mut txns: Vec<Transaction>, limit: usize) -> Vec<FeedEntry> {
    txns.sort_by(|a, b| b.effective_at.cmp(&a.effective_at).then(b.id.cmp(&a.id)));
    txns.truncate(limit);
    txns.into_iter()
        .map(|transaction| FeedEntry {
            kind: transaction.feed_kind(),
            transaction,
        })
        .collect()
}

pub async fn recent(store: &dyn TransactionStore, limit: usize) -> Result<Vec<FeedEntry>, ReportError> {
    let txns = store.recent_transactions(limit).await?;
    Ok(feed_entries(txns, limit))
}
