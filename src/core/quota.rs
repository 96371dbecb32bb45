//! Day and month traffic quotas.
//!
//! Each period remembers its bucket, the bytes counted in it, and the bucket
//! that last raised an alert. Comparing the alerted bucket with the current
//! one makes the alerted flag clear by itself when a new period opens.
//!
//! Periods only move forward. Traffic stamped before the open period, or
//! before the last alerted one, is stale: it still lands in its buckets but
//! is not counted toward a quota.

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaAlert {
    Day,
    Month,
}

impl QuotaAlert {
    pub fn text(self) -> &'static str {
        match self {
            QuotaAlert::Day => "Day traffic quota exceeded!",
            QuotaAlert::Month => "Month traffic quota exceeded!",
        }
    }

    pub fn meta_key(self) -> &'static str {
        match self {
            QuotaAlert::Day => "quota_day_alerted",
            QuotaAlert::Month => "quota_month_alerted",
        }
    }
}

/// Replicated quota view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub day_limit_mb: u32,
    pub month_limit_mb: u32,
    pub day_bytes: u64,
    pub month_bytes: u64,
    pub day_alerted: bool,
    pub month_alerted: bool,
}

#[derive(Debug, Default)]
struct Period {
    bucket: Option<i64>,
    bytes: u64,
    alerted: Option<i64>,
}

impl Period {
    fn is_alerted(&self) -> bool {
        self.bucket.is_some() && self.alerted == self.bucket
    }

    fn exceeds(&self, limit_mb: u32) -> bool {
        limit_mb != 0 && self.bytes > limit_mb as u64 * MIB
    }
}

#[derive(Debug, Default)]
pub struct QuotaManager {
    day_limit_mb: u32,
    month_limit_mb: u32,
    day: Period,
    month: Period,
}

impl QuotaManager {
    pub fn new(day_limit_mb: u32, month_limit_mb: u32) -> Self {
        Self {
            day_limit_mb,
            month_limit_mb,
            ..Self::default()
        }
    }

    pub fn set_limits(&mut self, day_limit_mb: u32, month_limit_mb: u32) {
        self.day_limit_mb = day_limit_mb;
        self.month_limit_mb = month_limit_mb;
    }

    fn period(&self, kind: QuotaAlert) -> &Period {
        match kind {
            QuotaAlert::Day => &self.day,
            QuotaAlert::Month => &self.month,
        }
    }

    fn period_mut(&mut self, kind: QuotaAlert) -> &mut Period {
        match kind {
            QuotaAlert::Day => &mut self.day,
            QuotaAlert::Month => &mut self.month,
        }
    }

    pub fn current_bucket(&self, kind: QuotaAlert) -> Option<i64> {
        self.period(kind).bucket
    }

    /// True if `bucket` precedes the open period or the last alerted period.
    pub fn is_stale(&self, kind: QuotaAlert, bucket: i64) -> bool {
        let period = self.period(kind);
        period.bucket.max(period.alerted).is_some_and(|newest| bucket < newest)
    }

    /// Opens `bucket` as the current period, seeded with bytes already stored for it.
    pub fn begin_period(&mut self, kind: QuotaAlert, bucket: i64, stored_bytes: u64) {
        let period = self.period_mut(kind);
        period.bucket = Some(bucket);
        period.bytes = stored_bytes;
    }

    /// Forgets the open periods and their alert marks; the next batch reopens
    /// and reseeds them. Used when period boundaries move.
    pub fn forget_periods(&mut self) {
        for period in [&mut self.day, &mut self.month] {
            period.bucket = None;
            period.alerted = None;
        }
    }

    /// Counts traffic in the open period of `kind`.
    pub fn add(&mut self, kind: QuotaAlert, bytes: u64) {
        let period = self.period_mut(kind);
        period.bytes = period.bytes.saturating_add(bytes);
    }

    /// Returns the first limit crossed in a period that has not alerted yet,
    /// marking that period alerted. `None` once every crossed limit has fired.
    pub fn check_quota(&mut self) -> Option<QuotaAlert> {
        for (kind, limit) in [
            (QuotaAlert::Day, self.day_limit_mb),
            (QuotaAlert::Month, self.month_limit_mb),
        ] {
            let period = self.period_mut(kind);
            if period.bucket.is_some() && !period.is_alerted() && period.exceeds(limit) {
                period.alerted = period.alerted.max(period.bucket);
                return Some(kind);
            }
        }
        None
    }

    pub fn alerted_bucket(&self, kind: QuotaAlert) -> Option<i64> {
        self.period(kind).alerted
    }

    /// Restores alert marks persisted before a restart.
    pub fn restore_alerted(&mut self, kind: QuotaAlert, bucket: Option<i64>) {
        self.period_mut(kind).alerted = bucket;
    }

    pub fn clear(&mut self) {
        self.day.bytes = 0;
        self.month.bytes = 0;
    }

    pub fn state(&self) -> QuotaState {
        QuotaState {
            day_limit_mb: self.day_limit_mb,
            month_limit_mb: self.month_limit_mb,
            day_bytes: self.day.bytes,
            month_bytes: self.month.bytes,
            day_alerted: self.day.is_alerted(),
            month_alerted: self.month.is_alerted(),
        }
    }
}
