//! Log ingestion pipeline (master only).
//!
//! Keeps every free buffer submitted to the driver, decodes each completed
//! buffer and dispatches its records in buffer order, first to the
//! [`StatEngine`] and then to the log subscribers, before resubmitting the
//! buffer. Losing the device closes the channel, clears the engine's process
//! mappings and retries the open on an interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::codec::log::{decode_records, LogRecord};
use crate::config::DRIVER_REOPEN_INTERVAL_SECS;
use crate::core::StatEngine;
use crate::driver::{DriverChannel, LogBuffer};
use crate::error::AppError;
use crate::events::EventBus;
use crate::services::stopped;

/// Ingestion counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    buffers: AtomicU64,
    records: AtomicU64,
    malformed_buffers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    pub buffers: u64,
    pub records: u64,
    pub malformed_buffers: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            buffers: self.buffers.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            malformed_buffers: self.malformed_buffers.load(Ordering::Relaxed),
        }
    }
}

enum Stop {
    Shutdown,
    DeviceLost(AppError),
}

pub struct LogPipeline {
    channel: DriverChannel,
    stats: Arc<StatEngine>,
    records: Arc<EventBus<LogRecord>>,
    counters: Arc<PipelineStats>,
    reopen_interval: Duration,
}

impl LogPipeline {
    pub fn new(
        channel: DriverChannel,
        stats: Arc<StatEngine>,
        records: Arc<EventBus<LogRecord>>,
    ) -> Self {
        Self {
            channel,
            stats,
            records,
            counters: Arc::new(PipelineStats::default()),
            reopen_interval: Duration::from_secs(DRIVER_REOPEN_INTERVAL_SECS),
        }
    }

    pub fn with_reopen_interval(mut self, interval: Duration) -> Self {
        self.reopen_interval = interval;
        self
    }

    pub fn counters(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.counters)
    }

    /// Supervises the driver until `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut open_failure_reported = false;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.channel.open() {
                if open_failure_reported {
                    tracing::debug!("Driver still unavailable: {e}");
                } else {
                    tracing::warn!(
                        "Cannot open driver: {e}; retrying every {}s",
                        self.reopen_interval.as_secs_f32()
                    );
                    open_failure_reported = true;
                }
                if sleep_or_shutdown(&mut shutdown, self.reopen_interval).await {
                    break;
                }
                continue;
            }
            if open_failure_reported {
                tracing::info!("Driver available again");
                open_failure_reported = false;
            }

            let stop = self.drain(&mut shutdown).await;
            let reason = match &stop {
                Stop::Shutdown => "shutdown".to_owned(),
                Stop::DeviceLost(e) => e.to_string(),
            };
            self.channel.close(&reason).await;
            self.stats.clear_processes();
            match stop {
                Stop::Shutdown => break,
                Stop::DeviceLost(e) => {
                    tracing::warn!("Driver lost: {e}");
                    if sleep_or_shutdown(&mut shutdown, self.reopen_interval).await {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.stats.flush() {
            tracing::warn!("Final statistics flush failed: {e}");
        }
        tracing::info!("Log pipeline stopped");
    }

    async fn drain(&mut self, shutdown: &mut watch::Receiver<bool>) -> Stop {
        if let Err(e) = self.channel.submit_all() {
            return Stop::DeviceLost(e);
        }
        loop {
            tokio::select! {
                _ = stopped(shutdown) => return Stop::Shutdown,
                ready = self.channel.next_ready() => {
                    let buffer = match ready {
                        Ok(buffer) => buffer,
                        Err(e) => return Stop::DeviceLost(e),
                    };
                    let buffer = match self.process_buffer(buffer).await {
                        Ok(buffer) => buffer,
                        Err(e) => return Stop::DeviceLost(e),
                    };
                    if let Err(e) = self.channel.recycle(buffer) {
                        return Stop::DeviceLost(e);
                    }
                }
            }
        }
    }

    /// Decodes and dispatches one buffer on the worker pool, handing it back.
    async fn process_buffer(&self, buffer: LogBuffer) -> Result<LogBuffer, AppError> {
        let stats = Arc::clone(&self.stats);
        let records = Arc::clone(&self.records);
        let counters = Arc::clone(&self.counters);
        let buffer = tokio::task::spawn_blocking(move || {
            dispatch_buffer(buffer.filled(), &stats, &records, &counters);
            buffer
        })
        .await?;
        Ok(buffer)
    }
}

/// Returns true if shutdown was signalled before `delay` elapsed.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stopped(shutdown) => true,
    }
}

fn dispatch_buffer(
    bytes: &[u8],
    stats: &StatEngine,
    records: &EventBus<LogRecord>,
    counters: &PipelineStats,
) {
    let mut dispatched = 0u64;
    for item in decode_records(bytes) {
        match item {
            Ok(record) => {
                if let Err(e) = stats.apply_record(&record) {
                    tracing::warn!("Statistics rejected a log record: {e}");
                }
                records.emit(&record);
                dispatched += 1;
            }
            Err(e) => {
                counters.malformed_buffers.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Malformed log buffer ({} bytes): {e}; kept {dispatched} records before it",
                    bytes.len()
                );
            }
        }
    }
    counters.records.fetch_add(dispatched, Ordering::Relaxed);
    counters.buffers.fetch_add(1, Ordering::Relaxed);
}
