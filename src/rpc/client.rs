//! Client side of the control channel.
//!
//! A [`ControlClient`] is shared by every proxy of one client process. While
//! connected it owns an outbound queue drained by a writer task; replies are
//! matched to waiting calls by correlation id and broadcasts are handed to the
//! [`BroadcastHandler`] in arrival order. Losing the connection fails every
//! waiting call with `TransportLost`, flips the state to `Disconnected` and
//! lets [`ControlClient::run`] reconnect with exponential backoff.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::rpc::{FrameKind, Origin, RpcMessage, RpcValue};
use crate::config::{
    RECONNECT_BACKOFF_MAX_MS, RECONNECT_BACKOFF_MIN_MS, RPC_CALL_TIMEOUT_SECS,
    RPC_HELLO_TIMEOUT_SECS,
};
use crate::error::{AppError, AppResult};
use crate::services::stopped;

use super::command::Command;
use super::frame::{message_frame, read_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected { client_id: u32 },
}

/// Receives master broadcasts, one at a time, on the connection's reader task.
pub trait BroadcastHandler: Send + Sync + 'static {
    fn on_broadcast(&self, msg: &RpcMessage);
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BACKOFF_MIN_MS),
            Duration::from_millis(RECONNECT_BACKOFF_MAX_MS),
        )
    }
}

type PendingReply = oneshot::Sender<AppResult<Vec<RpcValue>>>;

pub struct ControlClient {
    socket: PathBuf,
    broadcasts: Arc<dyn BroadcastHandler>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: DashMap<u32, PendingReply>,
    next_correlation: AtomicU32,
    call_timeout: Duration,
    backoff: Mutex<Backoff>,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>, broadcasts: Arc<dyn BroadcastHandler>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            socket: socket.into(),
            broadcasts,
            state,
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            next_correlation: AtomicU32::new(1),
            call_timeout: Duration::from_secs(RPC_CALL_TIMEOUT_SECS),
            backoff: Mutex::new(Backoff::default()),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        *self.backoff.lock().unwrap_or_else(PoisonError::into_inner) = backoff;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected { .. })
    }

    /// Watch of the connection state; every (re)connect is a change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn outbound(&self) -> AppResult<(u32, mpsc::UnboundedSender<Bytes>)> {
        let tx = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (self.state(), tx) {
            (ConnectionState::Connected { client_id }, Some(tx)) => Ok((client_id, tx)),
            _ => Err(AppError::MasterUnavailable("not connected to the master".into())),
        }
    }

    fn correlation(&self) -> u32 {
        loop {
            let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Sends a request and waits for its reply.
    pub async fn call(&self, command: Command, args: Vec<RpcValue>) -> AppResult<Vec<RpcValue>> {
        let (client_id, tx) = self.outbound()?;
        let correlation = self.correlation();
        let frame = message_frame(&RpcMessage::request(
            Origin::Client(client_id),
            command.id(),
            correlation,
            args,
        ))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(correlation, reply_tx);
        if tx.send(frame).is_err() {
            self.pending.remove(&correlation);
            return Err(AppError::TransportLost("connection to the master closed".into()));
        }

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::TransportLost(format!(
                "connection lost while waiting for {command:?}"
            ))),
            Err(_) => {
                self.pending.remove(&correlation);
                Err(AppError::TransportLost(format!(
                    "{command:?} timed out after {}s",
                    self.call_timeout.as_secs_f32()
                )))
            }
        }
    }

    /// Sends a request without waiting; its effect arrives as a broadcast.
    pub fn post(&self, command: Command, args: Vec<RpcValue>) -> AppResult<()> {
        let (client_id, tx) = self.outbound()?;
        let frame = message_frame(&RpcMessage::request(
            Origin::Client(client_id),
            command.id(),
            0,
            args,
        ))?;
        tx.send(frame)
            .map_err(|_| AppError::TransportLost("connection to the master closed".into()))
    }

    /// Keeps a connection to the master until `shutdown` turns true.
    /// `first` is a connection already established during arbitration.
    pub async fn run(self: Arc<Self>, mut first: Option<UnixStream>, mut shutdown: watch::Receiver<bool>) {
        let mut connect_failure_reported = false;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let stream = match first.take() {
                Some(stream) => Ok(stream),
                None => UnixStream::connect(&self.socket).await,
            };
            match stream {
                Ok(stream) => {
                    connect_failure_reported = false;
                    if self.serve_connection(stream, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) if !connect_failure_reported => {
                    tracing::warn!("Cannot reach master at {}: {e}", self.socket.display());
                    connect_failure_reported = true;
                }
                Err(e) => tracing::debug!("Master still unreachable: {e}"),
            }
            let delay = self
                .backoff
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
        self.disconnected();
    }

    /// Runs one connection. Returns true if it ended because of shutdown.
    async fn serve_connection(&self, stream: UnixStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let (mut reader, mut writer) = stream.into_split();
        let client_id = match self.await_hello(&mut reader).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Master handshake failed: {e}");
                return false;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.state.send_replace(ConnectionState::Connected { client_id });
        tracing::info!("Connected to master as client {client_id}");

        let stopped = loop {
            let msg = tokio::select! {
                _ = stopped(shutdown) => break true,
                msg = read_message(&mut reader) => msg,
            };
            match msg {
                Ok(Some(msg)) => self.on_message(msg),
                Ok(None) => break false,
                Err(e) => {
                    tracing::warn!("Control channel error: {e}");
                    break false;
                }
            }
        };
        self.disconnected();
        writer_task.abort();
        stopped
    }

    async fn await_hello(&self, reader: &mut OwnedReadHalf) -> AppResult<u32> {
        let hello = tokio::time::timeout(
            Duration::from_secs(RPC_HELLO_TIMEOUT_SECS),
            read_message(reader),
        )
        .await
        .map_err(|_| AppError::TransportLost("no hello from master".into()))??
        .ok_or_else(|| AppError::TransportLost("master closed before hello".into()))?;
        if hello.kind != FrameKind::Broadcast || hello.command != Command::Hello.id() {
            return Err(AppError::InvalidInput(format!(
                "expected hello, got command {}",
                hello.command
            )));
        }
        let id = super::arg_u64(&hello.args, 0)?;
        u32::try_from(id).map_err(|_| AppError::InvalidInput(format!("client id {id} out of range")))
    }

    fn on_message(&self, msg: RpcMessage) {
        match msg.kind {
            FrameKind::Reply | FrameKind::ReplyError => {
                let Some((_, waiter)) = self.pending.remove(&msg.correlation) else {
                    tracing::debug!("Late reply {} dropped", msg.correlation);
                    return;
                };
                let result = if msg.kind == FrameKind::Reply {
                    Ok(msg.args)
                } else {
                    let kind = super::arg_str(&msg.args, 0).unwrap_or("Io");
                    let message = super::arg_str(&msg.args, 1).unwrap_or("master error");
                    Err(AppError::from_kind(kind, message))
                };
                let _ = waiter.send(result);
            }
            FrameKind::Broadcast => self.broadcasts.on_broadcast(&msg),
            FrameKind::Request => tracing::warn!("Master sent a request frame; ignored"),
        }
    }

    fn disconnected(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let waiting: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for correlation in waiting {
            if let Some((_, waiter)) = self.pending.remove(&correlation) {
                let _ = waiter.send(Err(AppError::TransportLost(
                    "connection to the master lost".into(),
                )));
            }
        }
        let changed = self.state.send_if_modified(|state| {
            let was_connected = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            was_connected
        });
        if changed {
            tracing::info!("Disconnected from master");
        }
    }
}
