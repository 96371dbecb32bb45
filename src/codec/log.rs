//! Kernel log record format.
//!
//! A log buffer holds a sequence of records, each an 8-byte header
//! `{kind: u8, flags: u8, count: u16, body_len: u32}` followed by `body_len`
//! bytes and zero padding to the next 8-byte boundary. A zero header ends the
//! buffer early (the driver zero-fills unused space).
//!
//! | kind | record             | body                                                      |
//! |------|--------------------|-----------------------------------------------------------|
//! | 1    | process started    | pid u32, path UTF-16LE (`count` units)                    |
//! | 2    | process ended      | pid u32                                                   |
//! | 3    | traffic samples    | unix_time u64, `count` x {proc_id, flags, in, out: u32}   |
//! | 4    | blocked connection | reason, proto, inbound, pad: u8; ports u16 x2; ips u32 x2; pid u32; path |

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{ByteReader, ByteWriter, CodecError};

pub const LOG_HEADER_SIZE: usize = 8;
pub const LOG_ALIGN: usize = 8;

const KIND_END: u8 = 0;
const KIND_PROC_NEW: u8 = 1;
const KIND_PROC_END: u8 = 2;
const KIND_TRAFFIC: u8 = 3;
const KIND_BLOCKED_IP: u8 = 4;

const TRAFFIC_SAMPLE_SIZE: usize = 16;
const SAMPLE_FLAG_INACTIVE: u32 = 0x1;
const BLOCKED_FIXED_SIZE: usize = 20;

/// One decoded unit of kernel-reported activity. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    ProcessStarted { pid: u32, path: String },
    ProcessEnded { pid: u32 },
    TrafficSamples(TrafficBatch),
    BlockedConnection(BlockedConnection),
}

/// Byte-count deltas reported by the driver for one accounting tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficBatch {
    /// Seconds since the epoch; every sample's buckets derive from it.
    pub unix_time: i64,
    pub samples: Vec<TrafficSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    /// Process id the driver reported in a previous `ProcessStarted`.
    pub proc_id: u32,
    /// The process went away; this is its last sample.
    pub inactive: bool,
    pub in_bytes: u32,
    pub out_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedConnection {
    pub reason: BlockReason,
    pub proto: u8,
    pub inbound: bool,
    pub local_port: u16,
    pub remote_port: u16,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub pid: u32,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    IpInet,
    Reauth,
    Program,
    AppGroupFound,
    AppGroupDefault,
    Unknown(u8),
}

impl BlockReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => BlockReason::IpInet,
            2 => BlockReason::Reauth,
            3 => BlockReason::Program,
            4 => BlockReason::AppGroupFound,
            5 => BlockReason::AppGroupDefault,
            n => BlockReason::Unknown(n),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            BlockReason::IpInet => 1,
            BlockReason::Reauth => 2,
            BlockReason::Program => 3,
            BlockReason::AppGroupFound => 4,
            BlockReason::AppGroupDefault => 5,
            BlockReason::Unknown(n) => n,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            BlockReason::IpInet => "Not allowed Internet address",
            BlockReason::Reauth => "Old connection closed on startup",
            BlockReason::Program => "Programs logic",
            BlockReason::AppGroupFound => "App. Group logic",
            BlockReason::AppGroupDefault => "App. Group default logic",
            BlockReason::Unknown(_) => "Unknown",
        }
    }
}

/// Iterates the records of one buffer.
///
/// Yields at most one `Err`: a truncated or inconsistent record stops the
/// iteration, leaving every record before it intact.
pub struct RecordIter<'a> {
    reader: ByteReader<'a>,
    done: bool,
}

pub fn decode_records(buf: &[u8]) -> RecordIter<'_> {
    RecordIter {
        reader: ByteReader::new(buf),
        done: false,
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<LogRecord, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && !self.reader.is_empty() {
            match self.next_record() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl RecordIter<'_> {
    /// `Ok(None)` means a record was skipped (unknown kind) or the end marker was hit.
    fn next_record(&mut self) -> Result<Option<LogRecord>, CodecError> {
        let r = &mut self.reader;
        let kind = r.u8()?;
        let flags = r.u8()?;
        let count = r.u16()? as usize;
        let body_len = r.u32()? as usize;

        if kind == KIND_END && body_len == 0 {
            self.done = true;
            return Ok(None);
        }

        let body = r.bytes(body_len)?;
        let padding = (LOG_ALIGN - (LOG_HEADER_SIZE + body_len) % LOG_ALIGN) % LOG_ALIGN;
        r.skip_up_to(padding);

        let mut body = ByteReader::new(body);
        let record = match kind {
            KIND_PROC_NEW => {
                expect_len(kind, body_len, 4 + 2 * count)?;
                let pid = body.u32()?;
                let path = body.utf16(count)?;
                LogRecord::ProcessStarted { pid, path }
            }
            KIND_PROC_END => {
                expect_len(kind, body_len, 4)?;
                LogRecord::ProcessEnded { pid: body.u32()? }
            }
            KIND_TRAFFIC => {
                expect_len(kind, body_len, 8 + TRAFFIC_SAMPLE_SIZE * count)?;
                let unix_time = body.i64()?;
                let mut samples = Vec::with_capacity(count);
                for _ in 0..count {
                    let proc_id = body.u32()?;
                    let sample_flags = body.u32()?;
                    samples.push(TrafficSample {
                        proc_id,
                        inactive: sample_flags & SAMPLE_FLAG_INACTIVE != 0,
                        in_bytes: body.u32()?,
                        out_bytes: body.u32()?,
                    });
                }
                LogRecord::TrafficSamples(TrafficBatch { unix_time, samples })
            }
            KIND_BLOCKED_IP => {
                expect_len(kind, body_len, BLOCKED_FIXED_SIZE + 2 * count)?;
                let reason = BlockReason::from_code(body.u8()?);
                let proto = body.u8()?;
                let inbound = body.u8()? != 0;
                body.u8()?;
                LogRecord::BlockedConnection(BlockedConnection {
                    reason,
                    proto,
                    inbound,
                    local_port: body.u16()?,
                    remote_port: body.u16()?,
                    local_ip: Ipv4Addr::from(body.u32()?),
                    remote_ip: Ipv4Addr::from(body.u32()?),
                    pid: body.u32()?,
                    path: body.utf16(count)?,
                })
            }
            other => {
                tracing::debug!("Skipping log record of unknown kind {other} (flags {flags:#x}, {body_len} bytes)");
                return Ok(None);
            }
        };
        Ok(Some(record))
    }
}

fn expect_len(kind: u8, actual: usize, expected: usize) -> Result<(), CodecError> {
    if actual != expected {
        return Err(CodecError::Invalid(format!(
            "record kind {kind} declares {actual} body bytes, layout needs {expected}"
        )));
    }
    Ok(())
}

/// Appends one record, header and padding included.
pub fn encode_record(record: &LogRecord, w: &mut ByteWriter) {
    let start = w.len();
    let (kind, count) = match record {
        LogRecord::ProcessStarted { .. } => (KIND_PROC_NEW, 0),
        LogRecord::ProcessEnded { .. } => (KIND_PROC_END, 0),
        LogRecord::TrafficSamples(batch) => (KIND_TRAFFIC, batch.samples.len()),
        LogRecord::BlockedConnection(_) => (KIND_BLOCKED_IP, 0),
    };
    w.put_u8(kind);
    w.put_u8(0);
    w.put_u16(count as u16);
    w.put_u32(0);

    let body_start = w.len();
    match record {
        LogRecord::ProcessStarted { pid, path } => {
            w.put_u32(*pid);
            let units = w.put_utf16(path);
            w.patch_u16(start + 2, units as u16);
        }
        LogRecord::ProcessEnded { pid } => w.put_u32(*pid),
        LogRecord::TrafficSamples(batch) => {
            w.put_i64(batch.unix_time);
            for s in &batch.samples {
                w.put_u32(s.proc_id);
                w.put_u32(if s.inactive { SAMPLE_FLAG_INACTIVE } else { 0 });
                w.put_u32(s.in_bytes);
                w.put_u32(s.out_bytes);
            }
        }
        LogRecord::BlockedConnection(b) => {
            w.put_u8(b.reason.code());
            w.put_u8(b.proto);
            w.put_u8(b.inbound as u8);
            w.put_u8(0);
            w.put_u16(b.local_port);
            w.put_u16(b.remote_port);
            w.put_u32(u32::from(b.local_ip));
            w.put_u32(u32::from(b.remote_ip));
            w.put_u32(b.pid);
            let units = w.put_utf16(&b.path);
            w.patch_u16(start + 2, units as u16);
        }
    }
    let body_len = w.len() - body_start;
    w.patch_u32(start + 4, body_len as u32);
    w.pad_to(LOG_ALIGN);
}

pub fn encode_records(records: &[LogRecord]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(records.len() * 32);
    for record in records {
        encode_record(record, &mut w);
    }
    w.into_vec()
}
