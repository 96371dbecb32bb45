//! Master/client control plane over a Unix stream socket.
//!
//! The master runs a [`ControlServer`] that executes client requests against
//! its local components and relays every component event to all clients as a
//! broadcast. Clients hold a [`ControlClient`] and proxies with the same
//! contract as the local components ([`service`]); their
//! [`ClientDispatcher`] re-emits broadcasts on the client's own event buses.

pub mod bus;
pub mod client;
pub mod command;
pub mod dispatch;
pub mod frame;
pub mod server;
pub mod service;

pub use bus::{relay_events, Notification, RelayHandle};
pub use client::{Backoff, BroadcastHandler, ConnectionState, ControlClient};
pub use command::{BroadcastMode, Command, ReplyMode};
pub use dispatch::{ClientDispatcher, MasterDispatcher};
pub use server::{ControlServer, RequestHandler};
pub use service::{DriverService, StatService};

use serde::de::DeserializeOwned;

use crate::codec::rpc::RpcValue;
use crate::error::{AppError, AppResult};

fn arg(args: &[RpcValue], index: usize) -> AppResult<&RpcValue> {
    args.get(index)
        .ok_or_else(|| AppError::InvalidInput(format!("missing argument {index}")))
}

fn mismatch(index: usize, want: &str, got: &RpcValue) -> AppError {
    AppError::InvalidInput(format!("argument {index}: expected {want}, got {got:?}"))
}

pub(crate) fn arg_i64(args: &[RpcValue], index: usize) -> AppResult<i64> {
    let v = arg(args, index)?;
    v.as_i64().ok_or_else(|| mismatch(index, "integer", v))
}

pub(crate) fn arg_u64(args: &[RpcValue], index: usize) -> AppResult<u64> {
    let v = arg(args, index)?;
    v.as_u64().ok_or_else(|| mismatch(index, "unsigned integer", v))
}

pub(crate) fn arg_bool(args: &[RpcValue], index: usize) -> AppResult<bool> {
    let v = arg(args, index)?;
    v.as_bool().ok_or_else(|| mismatch(index, "bool", v))
}

pub(crate) fn arg_str(args: &[RpcValue], index: usize) -> AppResult<&str> {
    let v = arg(args, index)?;
    v.as_str().ok_or_else(|| mismatch(index, "string", v))
}

pub(crate) fn arg_bytes(args: &[RpcValue], index: usize) -> AppResult<&[u8]> {
    let v = arg(args, index)?;
    v.as_bytes().ok_or_else(|| mismatch(index, "bytes", v))
}

pub(crate) fn arg_json<T: DeserializeOwned>(args: &[RpcValue], index: usize) -> AppResult<T> {
    Ok(arg(args, index)?.to_json()?)
}
