use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::summary::{late_rate_percent, mean_duration_days};
use crate::limits::MAX_EQUIPMENT_NAME_LEN;
use crate::model::*;

use super::{StoreError, TransactionStore};

/// All transactions of one equipment type.
#[derive(Debug, Clone, Default)]
struct EquipmentLog {
    /// First-seen casing of the type name.
    display: String,
    /// Sorted by `out_at`.
    transactions: Vec<Transaction>,
}

impl EquipmentLog {
    fn insert(&mut self, txn: Transaction) {
        let pos = self
            .transactions
            .partition_point(|t| t.out_at <= txn.out_at);
        self.transactions.insert(pos, txn);
    }

    /// Position of `id`, searching only transactions opened at `out_at`.
    fn position(&self, id: &Ulid, out_at: Ms) -> Option<usize> {
        let lo = self.transactions.partition_point(|t| t.out_at < out_at);
        self.transactions[lo..]
            .iter()
            .take_while(|t| t.out_at == out_at)
            .position(|t| t.id == *id)
            .map(|i| lo + i)
    }

    fn get_mut(&mut self, id: &Ulid, out_at: Ms) -> Option<&mut Transaction> {
        let i = self.position(id, out_at)?;
        self.transactions.get_mut(i)
    }

    /// Transactions whose `out_at` lies in `[start, end)`.
    fn opened_in(&self, start: Ms, end: Ms) -> &[Transaction] {
        let lo = self.transactions.partition_point(|t| t.out_at < start);
        let hi = self.transactions.partition_point(|t| t.out_at < end);
        &self.transactions[lo..hi.max(lo)]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Transactions indexed by equipment type, built by applying log events.
pub struct InMemoryStore {
    equipment: DashMap<String, EquipmentLog>,
    /// Reverse lookup: transaction id → (equipment key, checkout time)
    id_to_equipment: DashMap<Ulid, (String, Ms)>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            equipment: DashMap::new(),
            id_to_equipment: DashMap::new(),
        }
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> (Self, LoadStats) {
        let store = Self::new();
        let mut stats = LoadStats::default();
        for event in events {
            if store.apply_event(event) {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }
        (store, stats)
    }

    pub fn transaction_count(&self) -> usize {
        self.id_to_equipment.len()
    }

    pub fn get(&self, id: &Ulid) -> Option<Transaction> {
        let (key, out_at) = self.id_to_equipment.get(id)?.value().clone();
        let log = self.equipment.get(&key)?;
        let i = log.position(id, out_at)?;
        log.transactions.get(i).cloned()
    }

    /// Apply one log record. Returns false when the record was skipped.
    pub fn apply_event(&self, event: &Event) -> bool {
        match event {
            Event::CheckedOut {
                id,
                borrower_id,
                borrower_name,
                equipment,
                quantity,
                at,
            } => {
                if self.id_to_equipment.contains_key(id) {
                    tracing::warn!("duplicate checkout {id}, skipping");
                    return false;
                }
                let key = equipment_key(equipment);
                if key.is_empty() || equipment.len() > MAX_EQUIPMENT_NAME_LEN || *quantity == 0 {
                    tracing::warn!("malformed checkout {id} ({equipment:?} x{quantity}), skipping");
                    return false;
                }
                let txn = Transaction::checked_out(
                    *id,
                    borrower_id.clone(),
                    borrower_name.clone(),
                    equipment.clone(),
                    *quantity,
                    *at,
                );
                self.equipment
                    .entry(key.clone())
                    .or_insert_with(|| EquipmentLog {
                        display: equipment.clone(),
                        transactions: Vec::new(),
                    })
                    .insert(txn);
                self.id_to_equipment.insert(*id, (key, *at));
                true
            }
            Event::Returned {
                id,
                quantity,
                at,
                late,
            } => self.update(id, |txn| {
                if *at < txn.out_at {
                    tracing::warn!("return for {id} predates its checkout");
                }
                txn.record_return(*quantity, *at, *late);
                if txn.in_quantity.unwrap_or(0) > txn.out_quantity {
                    tracing::warn!(
                        "transaction {id} returned {} of {} units",
                        txn.in_quantity.unwrap_or(0),
                        txn.out_quantity
                    );
                }
            }),
            Event::MarkedLate { id } => self.update(id, Transaction::mark_late),
        }
    }

    fn update(&self, id: &Ulid, f: impl FnOnce(&mut Transaction)) -> bool {
        let Some((key, out_at)) = self.id_to_equipment.get(id).map(|e| e.value().clone()) else {
            tracing::warn!("event for unknown transaction {id}, skipping");
            return false;
        };
        let Some(mut log) = self.equipment.get_mut(&key) else {
            return false;
        };
        match log.get_mut(id, out_at) {
            Some(txn) => {
                f(txn);
                true
            }
            None => false,
        }
    }

    fn all_transactions(&self) -> Vec<Transaction> {
        self.equipment
            .iter()
            .flat_map(|entry| entry.value().transactions.clone())
            .collect()
    }
}

fn local_date(at: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(&offset).date_naive())
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    fn pin(self: Arc<Self>) -> Arc<dyn TransactionStore> {
        self
    }

    async fn average_duration_days(&self) -> Result<f64, StoreError> {
        Ok(mean_duration_days(&self.all_transactions()))
    }

    async fn late_rate(&self) -> Result<f64, StoreError> {
        Ok(late_rate_percent(&self.all_transactions()))
    }

    async fn transactions_in_window(
        &self,
        equipment: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Transaction>, StoreError> {
        Ok(self
            .equipment
            .get(&equipment_key(equipment))
            .map(|log| log.opened_in(start, end).to_vec())
            .unwrap_or_default())
    }

    async fn outstanding_before(&self, equipment: &str, cutoff: Ms) -> Result<u64, StoreError> {
        Ok(self
            .equipment
            .get(&equipment_key(equipment))
            .map(|log| {
                log.opened_in(Ms::MIN, cutoff)
                    .iter()
                    .filter(|t| t.is_outstanding())
                    .map(|t| t.out_quantity as u64)
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn grouped_counts(&self) -> Result<Vec<BorrowCount>, StoreError> {
        let counts: Vec<(String, u64)> = self
            .equipment
            .iter()
            .filter(|e| !e.value().transactions.is_empty())
            .map(|e| (e.value().display.clone(), e.value().transactions.len() as u64))
            .collect();
        let total: u64 = counts.iter().map(|(_, c)| c).sum();
        Ok(counts
            .into_iter()
            .map(|(equipment_type, borrow_count)| BorrowCount {
                equipment_type,
                borrow_count,
                percentage: borrow_count as f64 * 100.0 / total as f64,
            })
            .collect())
    }

    async fn daily_borrowed_sums(
        &self,
        since: Ms,
        offset: FixedOffset,
    ) -> Result<Vec<DailyBorrowed>, StoreError> {
        let mut out = Vec::new();
        for entry in self.equipment.iter() {
            let log = entry.value();
            let mut per_day: HashMap<NaiveDate, u64> = HashMap::new();
            for txn in log.opened_in(since, Ms::MAX) {
                let date = local_date(txn.out_at, offset).ok_or_else(|| StoreError::QueryFailed {
                    query: "daily_borrowed_sums",
                    message: format!("timestamp {} out of range", txn.out_at),
                })?;
                *per_day.entry(date).or_default() += txn.out_quantity as u64;
            }
            out.extend(per_day.into_iter().map(|(date, quantity)| DailyBorrowed {
                equipment_type: log.display.clone(),
                date,
                quantity,
            }));
        }
        Ok(out)
    }

    async fn currently_outstanding(&self) -> Result<Vec<Outstanding>, StoreError> {
        Ok(self
            .equipment
            .iter()
            .filter_map(|entry| {
                let log = entry.value();
                let quantity: u64 = log
                    .transactions
                    .iter()
                    .filter(|t| t.is_outstanding())
                    .map(|t| t.out_quantity as u64)
                    .sum();
                (quantity > 0).then(|| Outstanding {
                    equipment_type: log.display.clone(),
                    quantity,
                })
            })
            .collect())
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        let mut all = self.all_transactions();
        all.sort_by(|a, b| b.effective_at.cmp(&a.effective_at).then(b.id.cmp(&a.id)));
        all.truncate(limit);
        Ok(all)
    }
}
