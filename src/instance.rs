//! Single-master arbitration.
//!
//! The first process to take the exclusive lock on the lock file becomes the
//! master and binds the control socket. Every later process finds the lock
//! held, connects to that socket and runs as a client. A process that finds
//! the lock held but no socket yet (the master is still starting, or just
//! died) retries a few times before giving up.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::net::UnixStream;

use crate::config::ARBITRATION_ATTEMPTS;
use crate::error::{AppError, AppResult};

const ARBITRATION_RETRY_MS: u64 = 50;

/// Exclusive hold on the instance lock file, released on drop.
pub struct InstanceLock {
    _file: Flock<File>,
}

impl InstanceLock {
    /// Returns `None` if another process holds the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, Errno::EWOULDBLOCK)) => return Ok(None),
            Err((_, errno)) => return Err(io::Error::from(errno)),
        };
        file.set_len(0)?;
        let mut pid: &File = &file;
        writeln!(pid, "{}", std::process::id())?;
        Ok(Some(Self { _file: file }))
    }
}

pub enum Arbitration {
    Master(InstanceLock),
    /// Connected to the running master; the stream is handed to the client.
    Client(UnixStream),
}

pub async fn arbitrate(lock_path: &Path, socket: &Path) -> AppResult<Arbitration> {
    for attempt in 1..=ARBITRATION_ATTEMPTS {
        if let Some(lock) = InstanceLock::try_acquire(lock_path)? {
            tracing::info!("Instance lock acquired; running as master");
            return Ok(Arbitration::Master(lock));
        }
        match UnixStream::connect(socket).await {
            Ok(stream) => {
                tracing::info!("Master found at {}; running as client", socket.display());
                return Ok(Arbitration::Client(stream));
            }
            Err(e) => tracing::debug!("Arbitration attempt {attempt}: master not reachable: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(ARBITRATION_RETRY_MS * attempt as u64)).await;
    }
    Err(AppError::MasterUnavailable(format!(
        "{} is locked but no master answers on {}",
        lock_path.display(),
        socket.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("instance.lock");
        let first = InstanceLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
        drop(first);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_process_becomes_client() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("instance.lock");
        let socket = dir.path().join("control.sock");

        let master = arbitrate(&lock, &socket).await.unwrap();
        assert!(matches!(master, Arbitration::Master(_)));
        let _listener = UnixListener::bind(&socket).unwrap();

        let client = arbitrate(&lock, &socket).await.unwrap();
        assert!(matches!(client, Arbitration::Client(_)));
    }

    #[tokio::test]
    async fn test_locked_without_socket_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("instance.lock");
        let _held = InstanceLock::try_acquire(&lock).unwrap().unwrap();
        let err = arbitrate(&lock, &dir.path().join("missing.sock"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "MasterUnavailable");
    }
}
