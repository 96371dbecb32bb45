//! Exclusive handle to the filter device and its log buffer pool.
//!
//! [`DriverChannel`] is owned by the ingestion pipeline. Reads block on a
//! dedicated `driver-io` thread; completed buffers come back through a tokio
//! channel so the pipeline can await them next to its shutdown signal.
//! [`DriverControl`] is the shared, cloneable view other components use to
//! issue control requests against whatever device is currently open.

pub mod device;
pub mod pool;

use std::io;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::DRIVER_CLOSE_TIMEOUT_MS;
use crate::error::{AppError, AppResult};
use crate::events::EventBus;

pub use device::{DeviceOpener, DriverDevice, DriverRequest, FileDeviceOpener, DRIVER_API_VERSION};
pub use pool::{BufferPool, BufferState, LogBuffer, PoolCounts};

/// Observable device lifecycle, replicated to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverEvent {
    Opened,
    Closed { reason: String },
    ConfUpdated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub open: bool,
}

/// Shared view of the open device for control requests.
pub struct DriverControl {
    device: RwLock<Option<Arc<dyn DriverDevice>>>,
    events: Arc<EventBus<DriverEvent>>,
}

impl DriverControl {
    pub fn new(events: Arc<EventBus<DriverEvent>>) -> Self {
        Self {
            device: RwLock::new(None),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus<DriverEvent>> {
        &self.events
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            open: self.current().is_some(),
        }
    }

    fn current(&self) -> Option<Arc<dyn DriverDevice>> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_device(&self, device: Option<Arc<dyn DriverDevice>>) {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
    }

    /// Sends one request to the open device; `DeviceUnavailable` while closed.
    pub fn request(&self, request: &DriverRequest) -> AppResult<Vec<u8>> {
        let device = self
            .current()
            .ok_or_else(|| AppError::DeviceUnavailable("driver is not open".into()))?;
        device
            .control(request)
            .map_err(|e| AppError::DeviceUnavailable(format!("driver request failed: {e}")))
    }

    pub fn update_conf(&self, conf: Vec<u8>) -> AppResult<()> {
        self.request(&DriverRequest::SetConf(conf))?;
        self.events.emit(&DriverEvent::ConfUpdated);
        Ok(())
    }

    pub fn set_flags(&self, flags: u32) -> AppResult<()> {
        self.request(&DriverRequest::SetFlags(flags)).map(|_| ())
    }

    /// Raw counter block as reported by the driver.
    pub fn query_counters(&self) -> AppResult<Vec<u8>> {
        self.request(&DriverRequest::QueryCounters)
    }

    pub fn clear_counters(&self) -> AppResult<()> {
        self.request(&DriverRequest::ClearCounters).map(|_| ())
    }
}

/// Result of one device read, as delivered by the I/O thread.
#[derive(Debug)]
pub struct ReadCompletion {
    pub buffer: LogBuffer,
    pub result: io::Result<usize>,
}

struct IoWorker {
    device: Arc<dyn DriverDevice>,
    submit: std_mpsc::Sender<LogBuffer>,
    completions: mpsc::UnboundedReceiver<ReadCompletion>,
    _thread: std::thread::JoinHandle<()>,
}

pub struct DriverChannel {
    opener: Arc<dyn DeviceOpener>,
    control: Arc<DriverControl>,
    buffer_count: usize,
    buffer_size: usize,
    pool: Option<BufferPool>,
    io: Option<IoWorker>,
}

impl DriverChannel {
    pub fn new(
        opener: Arc<dyn DeviceOpener>,
        control: Arc<DriverControl>,
        buffer_count: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            opener,
            control,
            buffer_count,
            buffer_size,
            pool: None,
            io: None,
        }
    }

    pub fn control(&self) -> &Arc<DriverControl> {
        &self.control
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Acquires the device, validates its interface version and starts the I/O thread.
    pub fn open(&mut self) -> AppResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let device = self
            .opener
            .open()
            .map_err(|e| AppError::DeviceUnavailable(format!("cannot open driver: {e}")))?;

        let reply = device
            .control(&DriverRequest::Validate {
                version: DRIVER_API_VERSION,
            })
            .map_err(|e| AppError::DeviceUnavailable(format!("driver validation failed: {e}")))?;
        let version = reply
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes);
        if version != Some(DRIVER_API_VERSION) {
            device.cancel_io();
            return Err(AppError::DeviceUnavailable(format!(
                "driver interface version {version:?} does not match {DRIVER_API_VERSION}"
            )));
        }

        let (submit_tx, submit_rx) = std_mpsc::channel::<LogBuffer>();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let reader = Arc::clone(&device);
        let thread = std::thread::Builder::new()
            .name("driver-io".into())
            .spawn(move || {
                while let Ok(mut buffer) = submit_rx.recv() {
                    let result = reader.read_log(buffer.spare_mut());
                    if done_tx.send(ReadCompletion { buffer, result }).is_err() {
                        break;
                    }
                }
                tracing::debug!("driver-io thread exiting");
            })?;

        self.pool = Some(BufferPool::new(self.buffer_count, self.buffer_size));
        self.io = Some(IoWorker {
            device: Arc::clone(&device),
            submit: submit_tx,
            completions: done_rx,
            _thread: thread,
        });
        self.control.set_device(Some(device));
        tracing::info!(
            "Driver channel open ({} buffers of {} bytes)",
            self.buffer_count,
            self.buffer_size
        );
        self.control.events.emit(&DriverEvent::Opened);
        Ok(())
    }

    /// Hands one free buffer to the I/O thread. `Ok(false)` when none is free.
    pub fn submit_read(&mut self) -> AppResult<bool> {
        let (Some(pool), Some(io)) = (self.pool.as_mut(), self.io.as_ref()) else {
            return Err(AppError::DeviceUnavailable("driver is not open".into()));
        };
        let Some(buffer) = pool.acquire() else {
            return Ok(false);
        };
        if let Err(std_mpsc::SendError(buffer)) = io.submit.send(buffer) {
            pool.release(buffer);
            return Err(AppError::DeviceUnavailable("driver I/O thread stopped".into()));
        }
        Ok(true)
    }

    /// Submits every free buffer; returns how many went out.
    pub fn submit_all(&mut self) -> AppResult<usize> {
        let mut submitted = 0;
        while self.submit_read()? {
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Waits for the next completed read. Cancel-safe.
    pub async fn next_ready(&mut self) -> AppResult<LogBuffer> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| AppError::DeviceUnavailable("driver is not open".into()))?;
        match io.completions.recv().await {
            Some(completion) => self.complete(completion),
            None => Err(AppError::DeviceUnavailable("driver I/O thread stopped".into())),
        }
    }

    /// Applies a read completion: success moves the buffer Pending -> Ready,
    /// failure returns it to Free and reports the device as lost.
    pub fn complete(&mut self, completion: ReadCompletion) -> AppResult<LogBuffer> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| AppError::DeviceUnavailable("driver is not open".into()))?;
        let ReadCompletion { mut buffer, result } = completion;
        match result {
            Ok(len) => {
                buffer.set_len(len);
                if !pool.mark_ready(&buffer) {
                    tracing::error!("Completed buffer {} was not pending", buffer.slot());
                }
                Ok(buffer)
            }
            Err(e) => {
                pool.release(buffer);
                Err(AppError::DeviceUnavailable(format!("driver read failed: {e}")))
            }
        }
    }

    /// Returns a consumed buffer to the pool and immediately resubmits a read.
    pub fn recycle(&mut self, buffer: LogBuffer) -> AppResult<()> {
        self.release(buffer);
        self.submit_read().map(|_| ())
    }

    pub fn release(&mut self, buffer: LogBuffer) {
        if let Some(pool) = self.pool.as_mut() {
            pool.release(buffer);
        }
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.as_ref().map(BufferPool::counts).unwrap_or_default()
    }

    /// Cancels outstanding reads, waits (bounded) for their completions, frees
    /// the buffers and releases the device.
    pub async fn close(&mut self, reason: &str) {
        let Some(IoWorker {
            device,
            submit,
            mut completions,
            ..
        }) = self.io.take()
        else {
            return;
        };
        self.control.set_device(None);
        device.cancel_io();
        drop(submit);

        let deadline = Duration::from_millis(DRIVER_CLOSE_TIMEOUT_MS);
        let drained = tokio::time::timeout(deadline, async {
            while let Some(completion) = completions.recv().await {
                if let Some(pool) = self.pool.as_mut() {
                    pool.release(completion.buffer);
                }
            }
        })
        .await;

        let counts = self.pool_counts();
        if drained.is_err() {
            tracing::warn!(
                "Driver close timed out with {} reads outstanding",
                counts.pending
            );
        }
        if counts.ready > 0 {
            tracing::warn!("Driver closed with {} unconsumed buffers", counts.ready);
        }
        self.pool = None;
        tracing::info!("Driver channel closed: {reason}");
        self.control.events.emit(&DriverEvent::Closed {
            reason: reason.to_owned(),
        });
    }
}
