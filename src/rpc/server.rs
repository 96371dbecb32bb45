//! Master side of the control channel.
//!
//! Every accepted client gets an id, a `Hello` frame carrying that id, and
//! one unbounded outbound queue drained by its own writer task. Broadcasts
//! and replies share that queue, so a client sees them in the order the
//! master produced them. Requests of one client are executed one after the
//! other on the blocking worker pool.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::codec::rpc::{FrameKind, Origin, RpcMessage, RpcValue};
use crate::error::{AppError, AppResult};
use crate::services::stopped;

use super::command::{Command, ReplyMode};
use super::frame::{message_frame, read_message};

/// Executes one client request against the master's local components.
///
/// Runs on the blocking worker pool; implementations may block on I/O.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, origin: Origin, command: Command, args: &[RpcValue]) -> AppResult<Vec<RpcValue>>;
}

pub struct ControlServer {
    handler: Arc<dyn RequestHandler>,
    peers: DashMap<u32, mpsc::UnboundedSender<Bytes>>,
    next_id: AtomicU32,
}

impl ControlServer {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            peers: DashMap::new(),
            next_id: AtomicU32::new(1),
        })
    }

    /// Binds the control socket, replacing a stale socket file. Only the
    /// holder of the instance lock may call this.
    pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!("Control socket listening at {}", path.display());
        Ok(listener)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queues `msg` for every connected client.
    pub fn broadcast(&self, msg: &RpcMessage) {
        if self.peers.is_empty() {
            return;
        }
        let frame = match message_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Dropping broadcast {}: {e}", msg.command);
                return;
            }
        };
        self.peers.retain(|id, tx| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                tracing::debug!("Client {id} queue closed; dropping peer");
            }
            alive
        });
    }

    /// Accepts clients until `shutdown` turns true, then disconnects them all.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: watch::Receiver<bool>) {
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => Arc::clone(&self).spawn_peer(stream, shutdown.clone()),
                    Err(e) => {
                        tracing::warn!("Control socket accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        self.peers.clear();
        tracing::info!("Control server stopped");
    }

    fn spawn_peer(self: Arc<Self>, stream: UnixStream, shutdown: watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        // Hello goes in before the peer is visible to broadcasts.
        match message_frame(&RpcMessage::broadcast(
            Command::Hello.id(),
            vec![RpcValue::from(id)],
        )) {
            Ok(hello) => {
                let _ = tx.send(hello);
            }
            Err(e) => {
                tracing::error!("Cannot encode hello: {e}");
                return;
            }
        }
        self.peers.insert(id, tx.clone());
        tracing::info!("Client {id} connected");

        tokio::spawn(write_loop(id, writer, rx));
        tokio::spawn(async move {
            self.read_loop(id, reader, tx, shutdown).await;
            self.peers.remove(&id);
            tracing::info!("Client {id} disconnected");
        });
    }

    async fn read_loop(
        &self,
        id: u32,
        mut reader: OwnedReadHalf,
        tx: mpsc::UnboundedSender<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = stopped(&mut shutdown) => return,
                msg = read_message(&mut reader) => msg,
            };
            match msg {
                Ok(Some(msg)) => {
                    if let Some(reply) = self.execute(id, msg).await {
                        match message_frame(&reply) {
                            Ok(frame) => {
                                let _ = tx.send(frame);
                            }
                            Err(e) => tracing::error!("Cannot encode reply for client {id}: {e}"),
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("Dropping client {id}: {e}");
                    return;
                }
            }
        }
    }

    /// Runs one request; returns the frame to send back, if any.
    async fn execute(&self, id: u32, msg: RpcMessage) -> Option<RpcMessage> {
        if msg.kind != FrameKind::Request {
            tracing::warn!("Client {id} sent a {:?} frame; ignored", msg.kind);
            return None;
        }
        let wants_reply = msg.correlation != 0;
        let command = match Command::from_id(msg.command) {
            Some(command) => command,
            None => {
                let err = AppError::InvalidInput(format!("unknown command {}", msg.command));
                return wants_reply.then(|| msg.reply_error(err.kind(), &err.to_string()));
            }
        };
        let Some(mode) = command.reply_mode() else {
            let err = AppError::InvalidInput(format!("{command:?} cannot be requested"));
            return wants_reply.then(|| msg.reply_error(err.kind(), &err.to_string()));
        };

        let handler = Arc::clone(&self.handler);
        let args = msg.args.clone();
        let result = tokio::task::spawn_blocking(move || {
            handler.handle(Origin::Client(id), command, &args)
        })
        .await
        .map_err(AppError::from)
        .and_then(|r| r);

        match (result, wants_reply) {
            (Ok(values), true) => Some(msg.reply(values)),
            (Err(e), true) => Some(msg.reply_error(e.kind(), &e.to_string())),
            (Err(e), false) => {
                tracing::warn!("Posted {command:?} from client {id} failed: {e}");
                None
            }
            (Ok(_), false) => {
                if mode == ReplyMode::Sync {
                    tracing::debug!("Client {id} posted synchronous {command:?}");
                }
                None
            }
        }
    }
}

async fn write_loop(id: u32, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("Write to client {id} failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::frame::write_message;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, origin: Origin, command: Command, args: &[RpcValue]) -> AppResult<Vec<RpcValue>> {
            match command {
                Command::Ping => {
                    let Origin::Client(id) = origin else {
                        return Err(AppError::InvalidInput("master origin".into()));
                    };
                    let mut out = vec![RpcValue::from(id)];
                    out.extend_from_slice(args);
                    Ok(out)
                }
                _ => Err(AppError::DeviceUnavailable("driver is not open".into())),
            }
        }
    }

    async fn start() -> (tempfile::TempDir, Arc<ControlServer>, watch::Sender<bool>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = ControlServer::bind(&path).unwrap();
        let server = ControlServer::new(Arc::new(Echo));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&server).serve(listener, rx));
        (dir, server, tx)
    }

    async fn connect(dir: &tempfile::TempDir) -> (OwnedReadHalf, OwnedWriteHalf, u32) {
        let stream = UnixStream::connect(dir.path().join("ctl.sock")).await.unwrap();
        let (mut r, w) = stream.into_split();
        let hello = read_message(&mut r).await.unwrap().unwrap();
        assert_eq!(hello.command, Command::Hello.id());
        let id = hello.args[0].as_u64().unwrap() as u32;
        (r, w, id)
    }

    #[tokio::test]
    async fn test_hello_assigns_distinct_ids() {
        let (dir, server, _stop) = start().await;
        let (_r1, _w1, a) = connect(&dir).await;
        let (_r2, _w2, b) = connect(&dir).await;
        assert_ne!(a, b);
        for _ in 0..100 {
            if server.peer_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(server.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_request_reply_and_error_reply() {
        let (dir, _server, _stop) = start().await;
        let (mut r, mut w, id) = connect(&dir).await;

        let ping = RpcMessage::request(Origin::Client(id), Command::Ping.id(), 7, vec![RpcValue::Int(5)]);
        write_message(&mut w, &ping).await.unwrap();
        let reply = read_message(&mut r).await.unwrap().unwrap();
        assert_eq!(reply.kind, FrameKind::Reply);
        assert_eq!(reply.correlation, 7);
        assert_eq!(reply.args, vec![RpcValue::from(id), RpcValue::Int(5)]);

        let status = RpcMessage::request(Origin::Client(id), Command::DriverStatus.id(), 8, vec![]);
        write_message(&mut w, &status).await.unwrap();
        let reply = read_message(&mut r).await.unwrap().unwrap();
        assert_eq!(reply.kind, FrameKind::ReplyError);
        assert_eq!(reply.args[0].as_str(), Some("DeviceUnavailable"));

        let bogus = RpcMessage::request(Origin::Client(id), Command::StatAppCreated.id(), 9, vec![]);
        write_message(&mut w, &bogus).await.unwrap();
        let reply = read_message(&mut r).await.unwrap().unwrap();
        assert_eq!(reply.correlation, 9);
        assert_eq!(reply.args[0].as_str(), Some("InvalidInput"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client_in_order() {
        let (dir, server, _stop) = start().await;
        let (mut r1, _w1, _) = connect(&dir).await;
        let (mut r2, _w2, _) = connect(&dir).await;
        while server.peer_count() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        for n in 0..3i64 {
            server.broadcast(&RpcMessage::broadcast(
                Command::StatDeleteApp.id(),
                vec![RpcValue::Int(n)],
            ));
        }
        for r in [&mut r1, &mut r2] {
            for n in 0..3i64 {
                let msg = read_message(r).await.unwrap().unwrap();
                assert_eq!(msg.args, vec![RpcValue::Int(n)]);
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        let (dir, _server, stop) = start().await;
        let (mut r, _w, _) = connect(&dir).await;
        stop.send(true).unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), read_message(&mut r))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, None);
    }
}
