//! Bucket time arithmetic.
//!
//! Every bucket is identified by hours since the epoch of the local wall
//! clock: `(unix_time + utc_offset) / 3600`, floored to the bucket's
//! resolution. Day buckets start at local midnight, month buckets at local
//! midnight of the first calendar day of the billing month.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const SECS_PER_HOUR: i64 = 3600;
const HOURS_PER_DAY: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Hour,
    Day,
    Month,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Hour, Resolution::Day, Resolution::Month];

    /// Per-app bucket table.
    pub fn app_table(self) -> &'static str {
        match self {
            Resolution::Hour => "traffic_app_hour",
            Resolution::Day => "traffic_app_day",
            Resolution::Month => "traffic_app_month",
        }
    }

    /// Global (owner 0) bucket table.
    pub fn total_table(self) -> &'static str {
        match self {
            Resolution::Hour => "traffic_hour",
            Resolution::Day => "traffic_day",
            Resolution::Month => "traffic_month",
        }
    }

    /// Bucket containing `unix_time`.
    pub fn bucket(self, unix_time: i64, month_start: u8, utc_offset_secs: i32) -> i64 {
        match self {
            Resolution::Hour => unix_hour(unix_time, utc_offset_secs),
            Resolution::Day => unix_day(unix_time, utc_offset_secs),
            Resolution::Month => unix_month(unix_time, month_start, utc_offset_secs),
        }
    }
}

pub fn unix_hour(unix_time: i64, utc_offset_secs: i32) -> i64 {
    (unix_time + utc_offset_secs as i64).div_euclid(SECS_PER_HOUR)
}

pub fn unix_day(unix_time: i64, utc_offset_secs: i32) -> i64 {
    unix_hour(unix_time, utc_offset_secs).div_euclid(HOURS_PER_DAY) * HOURS_PER_DAY
}

/// Month bucket of `unix_time`. A date before `month_start` belongs to the
/// previous month, so the billing cycle starting on the 10th maps
/// 2018-01-08 to the bucket of 2017-12-01.
pub fn unix_month(unix_time: i64, month_start: u8, utc_offset_secs: i32) -> i64 {
    let local = to_naive(unix_hour(unix_time, utc_offset_secs)).date();
    let mut first = local.with_day(1).unwrap_or(local);
    if local.day() < month_start as u32 {
        first = first.checked_sub_months(Months::new(1)).unwrap_or(first);
    }
    date_bucket(first)
}

/// Month bucket `months` months away from `month_bucket` (negative goes back).
pub fn month_shift(month_bucket: i64, months: i32) -> i64 {
    let date = to_naive(month_bucket).date();
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    date_bucket(shifted.unwrap_or(date))
}

/// Local wall-clock time at the start of a bucket.
pub fn to_naive(bucket: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp(bucket.saturating_mul(SECS_PER_HOUR), 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

fn date_bucket(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp().div_euclid(SECS_PER_HOUR))
        .unwrap_or_default()
}
