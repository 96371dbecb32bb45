//! Core logic: traffic statistics, bucket time math and quotas.
//!
//! - [`StatEngine`]: single-writer aggregation of driver traffic into buckets
//! - [`period`]: hour/day/month bucket alignment with billing month start
//! - [`QuotaManager`]: day/month limits that alert once per period

pub mod period;
pub mod quota;
pub mod stat_engine;

pub use period::Resolution;
pub use quota::{QuotaAlert, QuotaManager, QuotaState};
pub use stat_engine::{StatEngine, StatEvent, StatSnapshot};
