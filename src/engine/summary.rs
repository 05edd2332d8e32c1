use crate::model::*;
use crate::store::TransactionStore;

use super::error::ReportError;

/// Mean whole-day duration over `RETURNED` transactions. 0 when there are none.
pub fn mean_duration_days(txns: &[Transaction]) -> f64 {
    let (sum, n) = txns
        .iter()
        .filter(|t| t.status == Status::Returned)
        .filter_map(Transaction::duration_days)
        .fold((0i128, 0u64), |(sum, n), days| (sum + days as i128, n + 1));
    if n == 0 { 0.0 } else { sum as f64 / n as f64 }
}

/// Percentage of transactions currently `LATE`. 0 on empty input.
pub fn late_rate_percent(txns: &[Transaction]) -> f64 {
    if txns.is_empty() {
        return 0.0;
    }
    let late = txns.iter().filter(|t| t.status == Status::Late).count();
    100.0 * late as f64 / txns.len() as f64
}

/// Non-finite or negative store output reads as 0.
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

pub async fn summary(store: &dyn TransactionStore) -> Result<Summary, ReportError> {
    let (avg, late) = tokio::try_join!(store.average_duration_days(), store.late_rate())?;
    Ok(Summary {
        avg_borrowing_duration: sanitize(avg),
        late_return_rate: sanitize(late).min(100.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn returned(days: Ms, extra: Ms, late: bool) -> Transaction {
        let mut t = Transaction::checked_out(
            Ulid::new(),
            "b".into(),
            "Bo".into(),
            "Chess".into(),
            1,
            0,
        );
        t.record_return(1, days * DAY_MS + extra, late);
        t
    }

    fn pending() -> Transaction {
        Transaction::checked_out(Ulid::new(), "b".into(), "Bo".into(), "Chess".into(), 1, 0)
    }

    #[test]
    fn mean_duration_truncates_each_transaction() {
        let txns = vec![returned(1, 20 * HOUR_MS, false), returned(3, 0, false)];
        assert_eq!(mean_duration_days(&txns), 2.0);
    }

    #[test]
    fn mean_duration_ignores_late_and_pending() {
        let txns = vec![returned(2, 0, false), returned(10, 0, true), pending()];
        assert_eq!(mean_duration_days(&txns), 2.0);
    }

    #[test]
    fn mean_duration_skips_unsubtractable_timestamps() {
        let mut extreme = Transaction::checked_out(
            Ulid::new(),
            "b".into(),
            "Bo".into(),
            "Chess".into(),
            1,
            Ms::MIN,
        );
        extreme.record_return(1, Ms::MAX, false);
        let txns = vec![extreme, returned(2, 0, false)];
        assert_eq!(mean_duration_days(&txns), 2.0);
    }

    #[test]
    fn late_rate_counts_all_statuses() {
        let txns = vec![returned(1, 0, true), returned(1, 0, false), pending(), pending()];
        assert_eq!(late_rate_percent(&txns), 25.0);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(mean_duration_days(&[]), 0.0);
        assert_eq!(late_rate_percent(&[]), 0.0);
    }

    #[test]
    fn sanitize_clamps_degenerate_values() {
        assert_eq!(sanitize(f64::NAN), 0.0);
        assert_eq!(sanitize(f64::INFINITY), 0.0);
        assert_eq!(sanitize(-1.0), 0.0);
        assert_eq!(sanitize(2.5), 2.5);
    }
}
