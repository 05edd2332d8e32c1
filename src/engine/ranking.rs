use std::collections::{HashMap, HashSet};

use chrono::{Days, NaiveDate};

use crate::config::ReportConfig;
use crate::model::*;
use crate::store::TransactionStore;

use super::buckets::{local_date, local_midnight};
use super::error::ReportError;

/// Fold groups that differ only in casing, naming each by its catalog
/// display name when it has one.
fn merge_counts(counts: Vec<BorrowCount>, config: &ReportConfig) -> Vec<BorrowCount> {
    let mut merged: HashMap<String, (String, u64)> = HashMap::new();
    for c in counts {
        let name = config.capacities.display_name(&c.equipment_type).to_string();
        merged
            .entry(equipment_key(&c.equipment_type))
            .or_insert((name, 0))
            .1 += c.borrow_count;
    }
    let total: u64 = merged.values().map(|(_, n)| n).sum();
    merged
        .into_values()
        .map(|(equipment_type, borrow_count)| BorrowCount {
            equipment_type,
            borrow_count,
            percentage: if total == 0 {
                0.0
            } else {
                100.0 * borrow_count as f64 / total as f64
            },
        })
        .collect()
}

/// `(most_borrowed, least_borrowed)`, each at most `ranking_size` long.
/// Ties are broken by name.
pub fn borrow_rankings(
    counts: Vec<BorrowCount>,
    config: &ReportConfig,
) -> (Vec<BorrowCount>, Vec<BorrowCount>) {
    let mut ranked = merge_counts(counts, config);
    ranked.sort_by(|a, b| {
        b.borrow_count
            .cmp(&a.borrow_count)
            .then_with(|| a.equipment_type.cmp(&b.equipment_type))
    });
    let most: Vec<BorrowCount> = ranked.iter().take(config.ranking_size).cloned().collect();

    let excluded: HashSet<&str> = if config.exclusive_rankings {
        most.iter().map(|c| c.equipment_type.as_str()).collect()
    } else {
        HashSet::new()
    };
    let mut least: Vec<BorrowCount> = ranked
        .iter()
        .filter(|c| !excluded.contains(c.equipment_type.as_str()))
        .cloned()
        .collect();
    least.sort_by(|a, b| {
        a.borrow_count
            .cmp(&b.borrow_count)
            .then_with(|| a.equipment_type.cmp(&b.equipment_type))
    });
    least.truncate(config.ranking_size);

    (most, least)
}

/// First local date of the stock-out window ending today.
pub fn stockout_window_start(today: NaiveDate, window_days: u32) -> Option<NaiveDate> {
    today.checked_sub_days(Days::new(window_days.saturating_sub(1) as u64))
}

/// Count, per equipment type, the days in `[first_day, today]` on which units
/// checked out reached `stockout_ratio * capacity`. Every catalog type is
/// listed, including those that never ran out. Types outside the catalog are
/// listed once they borrowed in the window or have units out, measured
/// against the default capacity.
pub fn run_out_frequency(
    daily: &[DailyBorrowed],
    outstanding: &[Outstanding],
    config: &ReportConfig,
    first_day: NaiveDate,
    today: NaiveDate,
) -> Vec<RunOutEntry> {
    let capacities = &config.capacities;

    // key -> (display name, capacity), catalog first
    let mut types: HashMap<String, (String, u64)> = capacities
        .entries()
        .iter()
        .map(|e| (equipment_key(&e.name), (e.name.clone(), e.capacity)))
        .collect();
    let mut see = |name: &str| {
        types
            .entry(equipment_key(name))
            .or_insert_with(|| (name.to_string(), capacities.capacity_of(name)));
    };

    let mut per_day: HashMap<(String, NaiveDate), u64> = HashMap::new();
    for d in daily {
        if d.date < first_day || d.date > today {
            continue;
        }
        see(&d.equipment_type);
        *per_day.entry((equipment_key(&d.equipment_type), d.date)).or_default() += d.quantity;
    }

    let mut borrowed_now: HashMap<String, u64> = HashMap::new();
    for o in outstanding {
        see(&o.equipment_type);
        *borrowed_now.entry(equipment_key(&o.equipment_type)).or_default() += o.quantity;
    }

    let mut incidents: HashMap<&str, u32> = HashMap::new();
    for ((key, _), quantity) in &per_day {
        let Some((_, capacity)) = types.get(key) else {
            continue;
        };
        if *quantity as f64 >= config.stockout_ratio * *capacity as f64 {
            *incidents.entry(key.as_str()).or_default() += 1;
        }
    }

    let window = config.stockout_window_days as f64;
    let mut entries: Vec<RunOutEntry> = types
        .iter()
        .map(|(key, (name, capacity))| {
            let run_out_count = incidents.get(key.as_str()).copied().unwrap_or(0);
            let currently_borrowed = borrowed_now.get(key).copied().unwrap_or(0);
            RunOutEntry {
                equipment_type: name.clone(),
                run_out_count,
                capacity: *capacity,
                percentage: 100.0 * run_out_count as f64 / window,
                currently_borrowed,
                utilization_rate: 100.0 * currently_borrowed as f64 / *capacity as f64,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.run_out_count
            .cmp(&a.run_out_count)
            .then_with(|| a.equipment_type.cmp(&b.equipment_type))
    });
    entries.truncate(config.ranking_size);
    entries
}

pub async fn rankings(
    store: &dyn TransactionStore,
    config: &ReportConfig,
    now: Ms,
) -> Result<Rankings, ReportError> {
    let offset = config.utc_offset;
    let today = local_date(now, offset).ok_or(ReportError::ClockOutOfRange(now))?;
    let first_day = stockout_window_start(today, config.stockout_window_days)
        .ok_or(ReportError::ClockOutOfRange(now))?;
    let since = local_midnight(first_day, offset);

    let (counts, daily, outstanding) = tokio::try_join!(
        store.grouped_counts(),
        store.daily_borrowed_sums(since, offset),
        store.currently_outstanding(),
    )?;

    let (most_borrowed, least_borrowed) = borrow_rankings(counts, config);
    let run_out_frequency = run_out_frequency(&daily, &outstanding, config, first_day, today);
    Ok(Rankings {
        most_borrowed,
        least_borrowed,
        run_out_frequency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityTable;

    fn config(entries: &[(&str, u64)]) -> ReportConfig {
        ReportConfig::new(CapacityTable::new(entries.iter().map(|&(n, c)| (n, c)), 10).unwrap())
    }

    fn count(name: &str, n: u64) -> BorrowCount {
        BorrowCount {
            equipment_type: name.into(),
            borrow_count: n,
            percentage: 0.0,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn daily(name: &str, d: u32, quantity: u64) -> DailyBorrowed {
        DailyBorrowed {
            equipment_type: name.into(),
            date: day(d),
            quantity,
        }
    }

    #[test]
    fn rankings_sorted_and_truncated() {
        let cfg = config(&[("Chess", 5)]);
        let counts: Vec<_> = ["A", "B", "C", "D", "E", "F", "G"]
            .iter()
            .enumerate()
            .map(|(i, n)| count(n, i as u64 + 1))
            .collect();
        let (most, least) = borrow_rankings(counts, &cfg);
        assert_eq!(most.len(), 5);
        assert_eq!(least.len(), 5);
        assert_eq!(most[0].equipment_type, "G");
        assert!(most.windows(2).all(|w| w[0].borrow_count >= w[1].borrow_count));
        assert_eq!(least[0].equipment_type, "A");
        assert!(least.windows(2).all(|w| w[0].borrow_count <= w[1].borrow_count));
        assert!((most[0].percentage - 700.0 / 28.0).abs() < 1e-9);
    }

    #[test]
    fn rankings_merge_casing_and_use_catalog_name() {
        let cfg = config(&[("Yoga Mat", 5)]);
        let (most, _) = borrow_rankings(vec![count("yoga mat", 2), count("YOGA MAT", 1)], &cfg);
        assert_eq!(most.len(), 1);
        assert_eq!(most[0].equipment_type, "Yoga Mat");
        assert_eq!(most[0].borrow_count, 3);
        assert_eq!(most[0].percentage, 100.0);
    }

    #[test]
    fn exclusive_rankings_drop_most_from_least() {
        let mut cfg = config(&[("Chess", 5)]);
        let counts = vec![count("A", 1), count("B", 2), count("C", 3)];
        let (_, least) = borrow_rankings(counts.clone(), &cfg);
        assert_eq!(least.len(), 3);

        cfg.exclusive_rankings = true;
        let (most, least) = borrow_rankings(counts, &cfg);
        assert_eq!(most.len(), 3);
        assert!(least.is_empty());
    }

    #[test]
    fn run_out_counts_days_at_capacity() {
        let cfg = config(&[("A", 10), ("B", 4)]);
        let sums = vec![
            daily("A", 10, 10),
            daily("a", 11, 6),
            daily("A", 11, 4),
            daily("A", 12, 9),
            daily("B", 12, 3),
            daily("Ghost", 12, 100),
        ];
        let entries = run_out_frequency(&sums, &[], &cfg, day(1), day(14));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].equipment_type, "A");
        assert_eq!(entries[0].run_out_count, 2);
        assert_eq!(entries[1].equipment_type, "Ghost");
        assert_eq!(entries[1].run_out_count, 1);
        assert_eq!(entries[2].equipment_type, "B");
        assert_eq!(entries[2].run_out_count, 0);
    }

    #[test]
    fn run_out_measures_unlisted_types_against_default_capacity() {
        let sums: Vec<_> = (3..8).map(|d| daily("Carrom", d, 4)).collect();
        let outstanding = vec![Outstanding {
            equipment_type: "carrom".into(),
            quantity: 4,
        }];

        let tight = ReportConfig::new(CapacityTable::new([("Chess", 3)], 4).unwrap());
        let entries = run_out_frequency(&sums, &outstanding, &tight, day(1), day(14));
        assert_eq!(entries[0].equipment_type, "Carrom");
        assert_eq!(entries[0].run_out_count, 5);
        assert_eq!(entries[0].capacity, 4);
        assert_eq!(entries[0].utilization_rate, 100.0);

        let roomy = ReportConfig::new(CapacityTable::new([("Chess", 3)], 100).unwrap());
        let entries = run_out_frequency(&sums, &outstanding, &roomy, day(1), day(14));
        let carrom = entries.iter().find(|e| e.equipment_type == "Carrom").unwrap();
        assert_eq!(carrom.run_out_count, 0);
        assert_eq!(carrom.capacity, 100);
        assert_eq!(carrom.utilization_rate, 4.0);
    }

    #[test]
    fn run_out_skips_unlisted_types_without_recent_activity() {
        let cfg = config(&[("Chess", 3)]);
        let entries = run_out_frequency(&[daily("Carrom", 1, 4)], &[], &cfg, day(2), day(14));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].equipment_type, "Chess");
    }

    #[test]
    fn run_out_ignores_days_outside_window() {
        let cfg = config(&[("A", 1)]);
        let sums = vec![daily("A", 1, 5), daily("A", 5, 5), daily("A", 20, 5)];
        let entries = run_out_frequency(&sums, &[], &cfg, day(2), day(14));
        assert_eq!(entries[0].run_out_count, 1);
    }

    #[test]
    fn run_out_ratio_lowers_threshold() {
        let mut cfg = config(&[("A", 10)]);
        cfg.stockout_ratio = 0.8;
        let entries = run_out_frequency(&[daily("A", 3, 8)], &[], &cfg, day(1), day(14));
        assert_eq!(entries[0].run_out_count, 1);
    }

    #[test]
    fn run_out_attaches_current_utilization() {
        let cfg = config(&[("A", 10)]);
        let outstanding = vec![Outstanding {
            equipment_type: "a".into(),
            quantity: 4,
        }];
        let entries = run_out_frequency(&[daily("A", 3, 10)], &outstanding, &cfg, day(1), day(14));
        let a = &entries[0];
        assert_eq!(a.currently_borrowed, 4);
        assert_eq!(a.utilization_rate, 40.0);
        assert!((a.percentage - 100.0 / 90.0).abs() < 1e-9);
    }

    #[test]
    fn stockout_window_spans_exact_day_count() {
        let first = stockout_window_start(day(14), 90).unwrap();
        assert_eq!((day(14) - first).num_days() + 1, 90);
    }
}
