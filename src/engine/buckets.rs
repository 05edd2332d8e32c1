use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime};

use crate::model::*;

/// One bucket's half-open time range `[start, end)` in unix ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketWindow {
    pub start: Ms,
    pub end: Ms,
    pub label: String,
    pub period: BucketPeriod,
}

/// Contiguous buckets for one granularity, oldest first.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub granularity: Granularity,
    pub buckets: Vec<BucketWindow>,
}

impl Timeline {
    /// Lay out the buckets of `granularity` around `now` in the local calendar.
    /// `None` when `now` falls outside chrono's representable range.
    pub fn build(granularity: Granularity, now: Ms, offset: FixedOffset) -> Option<Self> {
        let today = local_date(now, offset)?;
        let buckets = match granularity {
            Granularity::Hour => hour_buckets(today, offset),
            Granularity::Day => day_buckets(today, offset)?,
            Granularity::Week => week_buckets(today, offset)?,
            Granularity::Month => month_buckets(today, offset)?,
        };
        Some(Self {
            granularity,
            buckets,
        })
    }

    pub fn start(&self) -> Ms {
        self.buckets.first().map_or(0, |b| b.start)
    }

    pub fn end(&self) -> Ms {
        self.buckets.last().map_or(0, |b| b.end)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Index of the bucket containing `at`.
    pub fn locate(&self, at: Ms) -> Option<usize> {
        if at < self.start() || at >= self.end() {
            return None;
        }
        Some(self.buckets.partition_point(|b| b.end <= at))
    }
}

/// Calendar date of `at` under `offset`.
pub fn local_date(at: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(&offset).date_naive())
}

/// Unix ms of local midnight starting `date`.
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
        - offset.local_minus_utc() as Ms * 1000
}

fn hour_buckets(today: NaiveDate, offset: FixedOffset) -> Vec<BucketWindow> {
    let midnight = local_midnight(today, offset);
    (0..24u32)
        .map(|hour| {
            let start = midnight + hour as Ms * HOUR_MS;
            BucketWindow {
                start,
                end: start + HOUR_MS,
                label: format!("{hour:02}:00"),
                period: BucketPeriod::Hour { hour },
            }
        })
        .collect()
}

fn day_buckets(today: NaiveDate, offset: FixedOffset) -> Option<Vec<BucketWindow>> {
    (0..7u64)
        .rev()
        .map(|back| {
            let date = today.checked_sub_days(Days::new(back))?;
            let next = date.checked_add_days(Days::new(1))?;
            Some(BucketWindow {
                start: local_midnight(date, offset),
                end: local_midnight(next, offset),
                label: date.format("%a").to_string(),
                period: BucketPeriod::Day {
                    date,
                    weekday: date.format("%A").to_string(),
                },
            })
        })
        .collect()
}

/// Sunday-aligned weeks. Week offset 0 (the current week) is the last bucket.
fn week_buckets(today: NaiveDate, offset: FixedOffset) -> Option<Vec<BucketWindow>> {
    let sunday =
        today.checked_sub_days(Days::new(today.weekday().num_days_from_sunday() as u64))?;
    (0..4u64)
        .rev()
        .map(|weeks_back| {
            let week_start = sunday.checked_sub_days(Days::new(7 * weeks_back))?;
            let week_end = week_start.checked_add_days(Days::new(6))?;
            let next = week_start.checked_add_days(Days::new(7))?;
            Some(BucketWindow {
                start: local_midnight(week_start, offset),
                end: local_midnight(next, offset),
                label: format!("{} - {}", week_start.format("%b %d"), week_end.format("%b %d")),
                period: BucketPeriod::Week {
                    week_start,
                    week_end,
                },
            })
        })
        .collect()
}

/// The current month and the eleven before it, oldest first.
fn month_buckets(today: NaiveDate, offset: FixedOffset) -> Option<Vec<BucketWindow>> {
    let current = today.year() * 12 + today.month0() as i32;
    (0..12)
        .rev()
        .map(|back| {
            let first = first_of_month(current - back)?;
            let next = first_of_month(current - back + 1)?;
            Some(BucketWindow {
                start: local_midnight(first, offset),
                end: local_midnight(next, offset),
                label: first.format("%b %Y").to_string(),
                period: BucketPeriod::Month {
                    year: first.year(),
                    month: first.month(),
                },
            })
        })
        .collect()
}

/// `months` counts from year 0: `year * 12 + month0`.
fn first_of_month(months: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(months.div_euclid(12), months.rem_euclid(12) as u32 + 1, 1)
}

/// Share of `capacity` still on the shelf, in `[0, 100]`. Borrowed counts
/// beyond capacity read as fully out.
pub fn availability_percent(borrowed: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return if borrowed == 0 { 100.0 } else { 0.0 };
    }
    let out = borrowed.min(capacity);
    100.0 * (capacity - out) as f64 / capacity as f64
}

pub fn make_bucket(index: usize, window: &BucketWindow, borrowed: u64, capacity: u64) -> Bucket {
    let availability = availability_percent(borrowed, capacity);
    Bucket {
        index,
        label: window.label.clone(),
        period: window.period.clone(),
        borrowed,
        capacity,
        availability_percent: availability,
        health: Health::classify(availability),
    }
}
