use std::collections::BTreeMap;

use futures::future::try_join_all;

use crate::config::ReportConfig;
use crate::model::*;
use crate::store::TransactionStore;

use super::buckets::{make_bucket, Timeline};
use super::error::ReportError;

/// Units out at the end of each bucket, by state reconstruction.
///
/// Starts from `starting` (units already out when the timeline opens), adds
/// `out_quantity` in the bucket of each checkout and subtracts the returned
/// quantity in the bucket of each resolving return that lands inside the
/// timeline. The running net is carried across buckets and reported clamped
/// at zero; the carried value itself is not clamped.
pub fn sweep(timeline: &Timeline, starting: u64, txns: &[Transaction]) -> Vec<u64> {
    let mut deltas = vec![0i64; timeline.len()];
    for txn in txns {
        if let Some(i) = timeline.locate(txn.out_at) {
            deltas[i] += txn.out_quantity as i64;
        }
        if let Some(in_at) = txn.in_at
            && let Some(i) = timeline.locate(in_at)
        {
            deltas[i] -= txn.in_quantity.unwrap_or(txn.out_quantity) as i64;
        }
    }

    let mut net = starting as i64;
    deltas
        .into_iter()
        .map(|delta| {
            net += delta;
            net.max(0) as u64
        })
        .collect()
}

/// Borrowed units per bucket for one equipment type.
async fn equipment_counts(
    store: &dyn TransactionStore,
    equipment: &str,
    timeline: &Timeline,
) -> Result<Vec<u64>, ReportError> {
    let (starting, txns) = tokio::try_join!(
        store.outstanding_before(equipment, timeline.start()),
        store.transactions_in_window(equipment, timeline.start(), timeline.end()),
    )?;
    Ok(sweep(timeline, starting, &txns))
}

/// Every catalog type's series for one granularity, plus the aggregate.
/// Per-type reads are issued concurrently and joined before assembly.
pub async fn occupancy_series(
    store: &dyn TransactionStore,
    config: &ReportConfig,
    granularity: Granularity,
    now: Ms,
) -> Result<OccupancySeries, ReportError> {
    let timeline =
        Timeline::build(granularity, now, config.utc_offset).ok_or(ReportError::ClockOutOfRange(now))?;
    let catalog = config.capacities.entries();

    let counts = try_join_all(
        catalog
            .iter()
            .map(|entry| equipment_counts(store, &entry.name, &timeline)),
    )
    .await?;

    Ok(assemble(granularity, &timeline, config, &counts))
}

/// Build bucket series from per-type counts, given in catalog order.
pub fn assemble(
    granularity: Granularity,
    timeline: &Timeline,
    config: &ReportConfig,
    counts: &[Vec<u64>],
) -> OccupancySeries {
    let total_capacity = config.capacities.total_capacity();
    let mut totals = vec![0u64; timeline.len()];
    let mut equipment = BTreeMap::new();

    for (entry, per_bucket) in config.capacities.entries().iter().zip(counts) {
        let buckets = timeline
            .buckets
            .iter()
            .zip(per_bucket)
            .enumerate()
            .map(|(i, (window, &borrowed))| {
                totals[i] += borrowed;
                make_bucket(i, window, borrowed, entry.capacity)
            })
            .collect();
        equipment.insert(entry.name.clone(), buckets);
    }

    let aggregate = timeline
        .buckets
        .iter()
        .zip(&totals)
        .enumerate()
        .map(|(i, (window, &borrowed))| make_bucket(i, window, borrowed, total_capacity))
        .collect();

    OccupancySeries {
        granularity,
        aggregate,
        equipment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};
    use ulid::Ulid;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn today_at(h: Ms) -> Ms {
        NaiveDate::from_ymd_opt(2026, 10, 14)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
            + h * HOUR_MS
    }

    fn txn(quantity: u32, out_h: Ms, in_h: Option<Ms>) -> Transaction {
        let mut t = Transaction::checked_out(
            Ulid::new(),
            "b".into(),
            "Bo".into(),
            "Cycle".into(),
            quantity,
            today_at(out_h),
        );
        if let Some(h) = in_h {
            t.record_return(quantity, today_at(h), false);
        }
        t
    }

    fn hours() -> Timeline {
        Timeline::build(Granularity::Hour, today_at(23), utc()).unwrap()
    }

    #[test]
    fn sweep_tracks_checkout_and_return() {
        let counts = sweep(&hours(), 0, &[txn(3, 9, Some(14))]);
        assert_eq!(counts[8], 0);
        assert_eq!(counts[9], 3);
        assert_eq!(counts[13], 3);
        assert_eq!(counts[14], 0);
        assert_eq!(counts[23], 0);
    }

    #[test]
    fn sweep_counts_partial_returns_until_resolved() {
        let mut partial = txn(3, 9, None);
        partial.record_return(1, today_at(11), false);
        assert_eq!(partial.in_quantity, Some(1));
        assert_eq!(partial.in_at, None);

        let counts = sweep(&hours(), 0, std::slice::from_ref(&partial));
        assert_eq!(counts[9], 3);
        assert_eq!(counts[11], 3);
        assert_eq!(counts[23], 3);

        partial.record_return(2, today_at(14), false);
        let counts = sweep(&hours(), 0, &[partial]);
        assert_eq!(counts[13], 3);
        assert_eq!(counts[14], 0);
    }

    #[test]
    fn sweep_carries_starting_balance() {
        let counts = sweep(&hours(), 4, &[txn(1, 2, None)]);
        assert_eq!(counts[0], 4);
        assert_eq!(counts[2], 5);
        assert_eq!(counts[23], 5);
    }

    #[test]
    fn sweep_return_outside_window_keeps_unit_out() {
        // Returned tomorrow: still out all of today
        let counts = sweep(&hours(), 0, &[txn(2, 10, Some(30))]);
        assert_eq!(counts[10], 2);
        assert_eq!(counts[23], 2);
    }

    #[test]
    fn sweep_clamps_reported_value_not_running_net() {
        let mut over = txn(1, 1, None);
        over.record_return(3, today_at(2), false);
        let counts = sweep(&hours(), 0, &[over, txn(1, 5, None)]);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 0);
        // net is -2 before the 05:00 checkout, so it still reads zero
        assert_eq!(counts[5], 0);
    }

    #[test]
    fn assemble_sums_aggregate() {
        let capacities =
            crate::config::CapacityTable::new([("Cycle", 10), ("Chess", 5)], 10).unwrap();
        let config = ReportConfig::new(capacities);
        let timeline = hours();
        let counts = vec![vec![2; 24], vec![5; 24]];

        let series = assemble(Granularity::Hour, &timeline, &config, &counts);
        let agg = &series.aggregate[0];
        assert_eq!(agg.borrowed, 7);
        assert_eq!(agg.capacity, 15);
        assert!((agg.availability_percent - 100.0 * 8.0 / 15.0).abs() < 1e-9);

        let chess = series.series("chess").unwrap();
        assert_eq!(chess[0].availability_percent, 0.0);
        assert_eq!(chess[0].health, Health::Critical);
        assert_eq!(series.series("Cycle").unwrap()[0].health, Health::Healthy);
    }
}
