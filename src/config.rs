//! Centralized runtime constants and settings.
//!
//! All tunable intervals, pool sizes and retention defaults are collected here
//! so they can be found and adjusted in a single place rather than scattered
//! across modules. [`Settings`] locates the runtime resources of one process;
//! [`StatConf`] is the statistics configuration replicated from the master to
//! every client.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Upper bound of the blocking worker pool (RPC handler bodies, SQLite writes).
pub const WORKER_POOL_SIZE: usize = 16;

/// Number of log buffers cycling between the driver and the pipeline.
pub const LOG_BUFFER_COUNT: usize = 4;

/// Capacity of one log buffer (bytes).
pub const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// How long `close()` waits for outstanding driver reads to complete (milliseconds).
pub const DRIVER_CLOSE_TIMEOUT_MS: u64 = 3000;

/// Interval between attempts to reopen a lost driver device (seconds).
pub const DRIVER_REOPEN_INTERVAL_SECS: u64 = 5;

/// Poll granularity of a blocking device read, bounding cancellation latency (milliseconds).
pub const DRIVER_READ_POLL_MS: u16 = 100;

/// Interval at which pending statistics are flushed and retention is enforced (seconds).
pub const STAT_MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Number of maintenance ticks between retention pruning passes (one hour at 60s ticks).
pub const PRUNE_CHECK_INTERVAL_TICKS: u64 = 60;

/// First and maximum delay of the client reconnect backoff (milliseconds).
pub const RECONNECT_BACKOFF_MIN_MS: u64 = 250;
pub const RECONNECT_BACKOFF_MAX_MS: u64 = 5000;

/// How long a client waits for the reply of a synchronous call (seconds).
pub const RPC_CALL_TIMEOUT_SECS: u64 = 10;

/// How long a freshly connected client waits for the master's hello (seconds).
pub const RPC_HELLO_TIMEOUT_SECS: u64 = 5;

/// Largest control-channel frame accepted from a peer (bytes).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Lock/connect rounds during single-instance arbitration before giving up.
pub const ARBITRATION_ATTEMPTS: u32 = 5;

pub const DEFAULT_MONTH_START: u8 = 1;
pub const DEFAULT_TRAF_HOUR_KEEP_DAYS: u32 = 90; // ~3 months
pub const DEFAULT_TRAF_DAY_KEEP_DAYS: u32 = 365; // ~1 year
pub const DEFAULT_TRAF_MONTH_KEEP_MONTHS: u32 = 36; // ~3 years

/// Statistics configuration: billing-cycle alignment, retention and quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatConf {
    /// Day of month (1..=28) on which the monthly quota period begins.
    pub month_start: u8,
    pub hour_keep_days: u32,
    pub day_keep_days: u32,
    pub month_keep_months: u32,
    /// Daily quota in MiB; 0 disables the check.
    pub quota_day_mb: u32,
    /// Monthly quota in MiB; 0 disables the check.
    pub quota_month_mb: u32,
    /// Offset of the local wall clock from UTC, used for bucket alignment.
    pub utc_offset_secs: i32,
}

impl Default for StatConf {
    fn default() -> Self {
        Self {
            month_start: DEFAULT_MONTH_START,
            hour_keep_days: DEFAULT_TRAF_HOUR_KEEP_DAYS,
            day_keep_days: DEFAULT_TRAF_DAY_KEEP_DAYS,
            month_keep_months: DEFAULT_TRAF_MONTH_KEEP_MONTHS,
            quota_day_mb: 0,
            quota_month_mb: 0,
            utc_offset_secs: 0,
        }
    }
}

impl StatConf {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(1..=28).contains(&self.month_start) {
            return Err(AppError::InvalidInput(format!(
                "month start day must be within 1..=28, got {}",
                self.month_start
            )));
        }
        if self.hour_keep_days == 0 || self.day_keep_days == 0 || self.month_keep_months == 0 {
            return Err(AppError::InvalidInput(
                "retention periods must be at least one unit".into(),
            ));
        }
        if self.utc_offset_secs.abs() > 14 * 3600 {
            return Err(AppError::InvalidInput(format!(
                "UTC offset {}s is out of range",
                self.utc_offset_secs
            )));
        }
        Ok(())
    }
}

/// Runtime resources of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime_dir: PathBuf,
    pub stat_db_path: PathBuf,
    pub device_path: PathBuf,
    pub control_socket: PathBuf,
    pub lock_path: PathBuf,
    pub log_buffer_count: usize,
    pub log_buffer_size: usize,
    pub stat: StatConf,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_runtime_dir(std::env::temp_dir().join("guardplane"))
    }
}

impl Settings {
    /// Settings whose socket, lock and database live under `dir`.
    pub fn with_runtime_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            stat_db_path: dir.join("stat.db"),
            control_socket: dir.join("control.sock"),
            lock_path: dir.join("instance.lock"),
            device_path: PathBuf::from("/dev/guardplane"),
            runtime_dir: dir,
            log_buffer_count: LOG_BUFFER_COUNT,
            log_buffer_size: LOG_BUFFER_SIZE,
            stat: StatConf::default(),
        }
    }

    /// Defaults, then the JSON file named by `GUARDPLANE_CONFIG`, then
    /// `GUARDPLANE_DIR` / `GUARDPLANE_DEVICE` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = match std::env::var_os("GUARDPLANE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os("GUARDPLANE_DIR") {
            let stat = settings.stat.clone();
            let device = settings.device_path.clone();
            settings = Self::with_runtime_dir(dir);
            settings.stat = stat;
            settings.device_path = device;
        }
        if let Some(device) = std::env::var_os("GUARDPLANE_DEVICE") {
            settings.device_path = PathBuf::from(device);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.log_buffer_count == 0 {
            return Err(AppError::InvalidInput("log buffer count must be positive".into()));
        }
        if self.log_buffer_size < 64 {
            return Err(AppError::InvalidInput(format!(
                "log buffer size {} is too small",
                self.log_buffer_size
            )));
        }
        self.stat.validate()
    }
}
