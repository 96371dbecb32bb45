//! RPC argument lists and message envelopes.
//!
//! A message is `{kind: u8, origin: u32, command: u32, correlation: u32,
//! arg_count: u16}` followed by `arg_count` values, each `{tag: u8, len: u32,
//! bytes}`. Origin 0 is the master; clients carry the id the master assigned
//! them in its hello. Correlation 0 marks messages that expect no reply.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ByteReader, ByteWriter, CodecError};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_JSON: u8 = 6;

/// One typed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
    /// Structured payloads (snapshots, records) as serialized JSON.
    Json(String),
}

impl RpcValue {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        serde_json::to_string(value)
            .map(RpcValue::Json)
            .map_err(|e| CodecError::Invalid(format!("json encode: {e}")))
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            RpcValue::Json(text) => serde_json::from_str(text)
                .map_err(|e| CodecError::Invalid(format!("json decode: {e}"))),
            other => Err(CodecError::Invalid(format!("expected json, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Int(v) => Some(*v),
            RpcValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RpcValue::UInt(v) => Some(*v),
            RpcValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RpcValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn encode(&self, w: &mut ByteWriter) {
        let (tag, body): (u8, &[u8]) = match self {
            RpcValue::Null => (TAG_NULL, &[][..]),
            RpcValue::Bool(b) => {
                w.put_u8(TAG_BOOL);
                w.put_u32(1);
                w.put_u8(*b as u8);
                return;
            }
            RpcValue::Int(v) => {
                w.put_u8(TAG_INT);
                w.put_u32(8);
                w.put_i64(*v);
                return;
            }
            RpcValue::UInt(v) => {
                w.put_u8(TAG_UINT);
                w.put_u32(8);
                w.put_u64(*v);
                return;
            }
            RpcValue::Str(s) => (TAG_STR, s.as_bytes()),
            RpcValue::Bytes(b) => (TAG_BYTES, b.as_slice()),
            RpcValue::Json(s) => (TAG_JSON, s.as_bytes()),
        };
        w.put_u8(tag);
        w.put_u32(body.len() as u32);
        w.put_slice(body);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let tag = r.u8()?;
        let len = r.u32()? as usize;
        let body = r.bytes(len)?;
        let mut b = ByteReader::new(body);
        let value = match tag {
            TAG_NULL => RpcValue::Null,
            TAG_BOOL => RpcValue::Bool(b.u8()? != 0),
            TAG_INT => RpcValue::Int(b.i64()?),
            TAG_UINT => RpcValue::UInt(b.u64()?),
            TAG_STR => RpcValue::Str(utf8(body)?),
            TAG_BYTES => RpcValue::Bytes(body.to_vec()),
            TAG_JSON => RpcValue::Json(utf8(body)?),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(value)
    }
}

fn utf8(body: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(body.to_vec()).map_err(|e| CodecError::Invalid(e.to_string()))
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        RpcValue::Bool(v)
    }
}

impl From<i64> for RpcValue {
    fn from(v: i64) -> Self {
        RpcValue::Int(v)
    }
}

impl From<u64> for RpcValue {
    fn from(v: u64) -> Self {
        RpcValue::UInt(v)
    }
}

impl From<u32> for RpcValue {
    fn from(v: u32) -> Self {
        RpcValue::UInt(v as u64)
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        RpcValue::Str(v.to_owned())
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        RpcValue::Str(v)
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(v: Vec<u8>) -> Self {
        RpcValue::Bytes(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Reply,
    ReplyError,
    Broadcast,
}

impl FrameKind {
    fn code(self) -> u8 {
        match self {
            FrameKind::Request => 1,
            FrameKind::Reply => 2,
            FrameKind::ReplyError => 3,
            FrameKind::Broadcast => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            3 => Ok(FrameKind::ReplyError),
            4 => Ok(FrameKind::Broadcast),
            other => Err(CodecError::Invalid(format!("unknown frame kind {other}"))),
        }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Master,
    Client(u32),
}

impl Origin {
    fn id(self) -> u32 {
        match self {
            Origin::Master => 0,
            Origin::Client(id) => id,
        }
    }

    fn from_id(id: u32) -> Self {
        if id == 0 {
            Origin::Master
        } else {
            Origin::Client(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub kind: FrameKind,
    pub origin: Origin,
    pub command: u32,
    pub correlation: u32,
    pub args: Vec<RpcValue>,
}

impl RpcMessage {
    pub fn request(origin: Origin, command: u32, correlation: u32, args: Vec<RpcValue>) -> Self {
        Self {
            kind: FrameKind::Request,
            origin,
            command,
            correlation,
            args,
        }
    }

    pub fn broadcast(command: u32, args: Vec<RpcValue>) -> Self {
        Self {
            kind: FrameKind::Broadcast,
            origin: Origin::Master,
            command,
            correlation: 0,
            args,
        }
    }

    /// Reply to `self`, reusing its command and correlation id.
    pub fn reply(&self, args: Vec<RpcValue>) -> Self {
        Self {
            kind: FrameKind::Reply,
            origin: Origin::Master,
            command: self.command,
            correlation: self.correlation,
            args,
        }
    }

    /// Error reply carrying `[kind, message]`.
    pub fn reply_error(&self, kind: &str, message: &str) -> Self {
        Self {
            kind: FrameKind::ReplyError,
            origin: Origin::Master,
            command: self.command,
            correlation: self.correlation,
            args: vec![RpcValue::from(kind), RpcValue::from(message)],
        }
    }
}

pub fn encode_message(msg: &RpcMessage) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(15 + msg.args.len() * 16);
    w.put_u8(msg.kind.code());
    w.put_u32(msg.origin.id());
    w.put_u32(msg.command);
    w.put_u32(msg.correlation);
    w.put_u16(msg.args.len() as u16);
    for arg in &msg.args {
        arg.encode(&mut w);
    }
    w.into_vec()
}

pub fn decode_message(buf: &[u8]) -> Result<RpcMessage, CodecError> {
    let mut r = ByteReader::new(buf);
    let kind = FrameKind::from_code(r.u8()?)?;
    let origin = Origin::from_id(r.u32()?);
    let command = r.u32()?;
    let correlation = r.u32()?;
    let count = r.u16()? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(RpcValue::decode(&mut r)?);
    }
    if !r.is_empty() {
        return Err(CodecError::Invalid(format!(
            "{} trailing bytes after message",
            r.remaining()
        )));
    }
    Ok(RpcMessage {
        kind,
        origin,
        command,
        correlation,
        args,
    })
}
