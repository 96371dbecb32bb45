//! Device boundary: control requests and blocking log reads.
//!
//! Control requests travel as `{opcode: u32, payload_len: u32, payload}` in a
//! fixed in/out buffer handed to `ioctl`; the driver overwrites it with
//! `{reply_len: u32, reply}`. Log reads are plain `read(2)` calls on the
//! device, one buffer per call.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{ByteReader, ByteWriter};

/// Interface version this build speaks; checked by `Validate` on open.
pub const DRIVER_API_VERSION: u32 = 3;

/// Size of the in/out buffer passed with every control request.
pub const CONTROL_BUFFER_SIZE: usize = 64 * 1024;

const DEVICE_TYPE: u32 = 0xD000;
const METHOD_BUFFERED: u32 = 0;
const READ_ACCESS: u32 = 1;
const WRITE_ACCESS: u32 = 2;

const fn ctl_code(function: u32, access: u32) -> u32 {
    (DEVICE_TYPE << 16) | (access << 14) | (function << 2) | METHOD_BUFFERED
}

pub const IOCTL_VALIDATE: u32 = ctl_code(0x801, READ_ACCESS | WRITE_ACCESS);
pub const IOCTL_SET_CONF: u32 = ctl_code(0x802, WRITE_ACCESS);
pub const IOCTL_SET_FLAGS: u32 = ctl_code(0x803, WRITE_ACCESS);
pub const IOCTL_QUERY_COUNTERS: u32 = ctl_code(0x805, READ_ACCESS);
pub const IOCTL_CLEAR_COUNTERS: u32 = ctl_code(0x806, WRITE_ACCESS);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRequest {
    Validate { version: u32 },
    /// Opaque firewall configuration blob, pushed down as-is.
    SetConf(Vec<u8>),
    SetFlags(u32),
    QueryCounters,
    ClearCounters,
}

impl DriverRequest {
    pub fn opcode(&self) -> u32 {
        match self {
            DriverRequest::Validate { .. } => IOCTL_VALIDATE,
            DriverRequest::SetConf(_) => IOCTL_SET_CONF,
            DriverRequest::SetFlags(_) => IOCTL_SET_FLAGS,
            DriverRequest::QueryCounters => IOCTL_QUERY_COUNTERS,
            DriverRequest::ClearCounters => IOCTL_CLEAR_COUNTERS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(16);
        w.put_u32(self.opcode());
        w.put_u32(0);
        match self {
            DriverRequest::Validate { version } => w.put_u32(*version),
            DriverRequest::SetConf(blob) => w.put_slice(blob),
            DriverRequest::SetFlags(flags) => w.put_u32(*flags),
            DriverRequest::QueryCounters | DriverRequest::ClearCounters => {}
        }
        let payload_len = w.len() - 8;
        w.patch_u32(4, payload_len as u32);
        w.into_vec()
    }
}

/// Splits a control reply buffer into its payload.
pub fn decode_reply(buf: &[u8]) -> io::Result<Vec<u8>> {
    let mut r = ByteReader::new(buf);
    let len = r
        .u32()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))? as usize;
    r.bytes(len)
        .map(<[u8]>::to_vec)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// An open device handle.
pub trait DriverDevice: Send + Sync {
    /// Issues one control request and returns the reply payload.
    fn control(&self, request: &DriverRequest) -> io::Result<Vec<u8>>;

    /// Blocks until the driver fills `buf` with log records; returns the byte count.
    /// Fails with `Interrupted` once [`cancel_io`](Self::cancel_io) was called.
    fn read_log(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Makes the current and every later `read_log` return promptly.
    fn cancel_io(&self);
}

pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn DriverDevice>>;
}

/// Opens the character device at `path`.
pub struct FileDeviceOpener {
    path: PathBuf,
}

impl FileDeviceOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
impl DeviceOpener for FileDeviceOpener {
    fn open(&self) -> io::Result<Arc<dyn DriverDevice>> {
        Ok(Arc::new(unix::FileDevice::open(&self.path)?))
    }
}

#[cfg(not(unix))]
impl DeviceOpener for FileDeviceOpener {
    fn open(&self) -> io::Result<Arc<dyn DriverDevice>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no device backend for {}", self.path.display()),
        ))
    }
}

#[cfg(unix)]
mod unix {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::fd::{AsFd, AsRawFd};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    use super::{decode_reply, DriverDevice, DriverRequest, CONTROL_BUFFER_SIZE};
    use crate::config::DRIVER_READ_POLL_MS;

    pub struct FileDevice {
        file: Flock<File>,
        cancelled: AtomicBool,
    }

    impl FileDevice {
        pub fn open(path: &Path) -> io::Result<Self> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
                if errno == Errno::EWOULDBLOCK {
                    io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("{} is held by another process", path.display()),
                    )
                } else {
                    io::Error::from(errno)
                }
            })?;
            tracing::info!("Opened driver device {}", path.display());
            Ok(Self {
                file,
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl DriverDevice for FileDevice {
        fn control(&self, request: &DriverRequest) -> io::Result<Vec<u8>> {
            let encoded = request.encode();
            if encoded.len() > CONTROL_BUFFER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("control request of {} bytes exceeds buffer", encoded.len()),
                ));
            }
            let mut buf = vec![0u8; CONTROL_BUFFER_SIZE];
            buf[..encoded.len()].copy_from_slice(&encoded);

            // SAFETY: the fd is open for the lifetime of `self.file`, and `buf`
            // is a live, writable allocation of CONTROL_BUFFER_SIZE bytes, the
            // size the driver is told to expect for every request.
            let rc = unsafe {
                nix::libc::ioctl(
                    self.file.as_raw_fd(),
                    request.opcode() as _,
                    buf.as_mut_ptr(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            decode_reply(&buf)
        }

        fn read_log(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                if self.cancelled.load(Ordering::Acquire) {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
                }
                let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(DRIVER_READ_POLL_MS)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "driver device hung up",
                    ));
                }
                if revents.contains(PollFlags::POLLIN) {
                    let n = (&*self.file).read(buf)?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "driver device closed",
                        ));
                    }
                    return Ok(n);
                }
            }
        }

        fn cancel_io(&self) {
            self.cancelled.store(true, Ordering::Release);
        }
    }
}
