//! Event <-> broadcast mapping and the master-side relay.

use std::sync::Arc;

use crate::codec::log::{decode_records, encode_records, LogRecord};
use crate::codec::rpc::{RpcMessage, RpcValue};
use crate::core::StatEvent;
use crate::driver::DriverEvent;
use crate::error::{AppError, AppResult};
use crate::events::{Events, SubscriptionId};

use super::command::Command;
use super::{arg_bool, arg_bytes, arg_i64, arg_json, arg_str, arg_u64};

/// Any event a master replicates to its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Stat(StatEvent),
    Driver(DriverEvent),
    Log(LogRecord),
}

impl Notification {
    pub fn to_message(&self) -> AppResult<RpcMessage> {
        let (command, args) = match self {
            Notification::Stat(event) => match event {
                StatEvent::ConfChanged(conf) => (Command::StatSetConf, vec![RpcValue::json(conf)?]),
                StatEvent::TrafficCleared => (Command::StatClearTraffic, vec![]),
                StatEvent::AppDeleted { app_id } => {
                    (Command::StatDeleteApp, vec![RpcValue::Int(*app_id)])
                }
                StatEvent::AppCreated { app_id, path } => (
                    Command::StatAppCreated,
                    vec![RpcValue::Int(*app_id), RpcValue::from(path.as_str())],
                ),
                StatEvent::TrafficLogged {
                    unix_time,
                    in_bytes,
                    out_bytes,
                    quota,
                } => (
                    Command::StatTrafficLogged,
                    vec![
                        RpcValue::Int(*unix_time),
                        RpcValue::UInt(*in_bytes),
                        RpcValue::UInt(*out_bytes),
                        RpcValue::json(quota)?,
                    ],
                ),
                StatEvent::QuotaAlert(alert) => {
                    (Command::StatQuotaAlert, vec![RpcValue::json(alert)?])
                }
            },
            Notification::Driver(event) => match event {
                DriverEvent::Opened => (
                    Command::DriverStateChanged,
                    vec![RpcValue::Bool(true), RpcValue::from("")],
                ),
                DriverEvent::Closed { reason } => (
                    Command::DriverStateChanged,
                    vec![RpcValue::Bool(false), RpcValue::from(reason.as_str())],
                ),
                DriverEvent::ConfUpdated => (Command::DriverConfUpdated, vec![]),
            },
            Notification::Log(record) => (
                Command::LogRecord,
                vec![RpcValue::Bytes(encode_records(std::slice::from_ref(record)))],
            ),
        };
        Ok(RpcMessage::broadcast(command.id(), args))
    }

    pub fn from_message(msg: &RpcMessage) -> AppResult<Self> {
        let command = Command::from_id(msg.command)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown command {}", msg.command)))?;
        let args = &msg.args;
        let notification = match command {
            Command::StatSetConf => Notification::Stat(StatEvent::ConfChanged(arg_json(args, 0)?)),
            Command::StatClearTraffic => Notification::Stat(StatEvent::TrafficCleared),
            Command::StatDeleteApp => Notification::Stat(StatEvent::AppDeleted {
                app_id: arg_i64(args, 0)?,
            }),
            Command::StatAppCreated => Notification::Stat(StatEvent::AppCreated {
                app_id: arg_i64(args, 0)?,
                path: arg_str(args, 1)?.to_owned(),
            }),
            Command::StatTrafficLogged => Notification::Stat(StatEvent::TrafficLogged {
                unix_time: arg_i64(args, 0)?,
                in_bytes: arg_u64(args, 1)?,
                out_bytes: arg_u64(args, 2)?,
                quota: arg_json(args, 3)?,
            }),
            Command::StatQuotaAlert => Notification::Stat(StatEvent::QuotaAlert(arg_json(args, 0)?)),
            Command::DriverStateChanged => Notification::Driver(if arg_bool(args, 0)? {
                DriverEvent::Opened
            } else {
                DriverEvent::Closed {
                    reason: arg_str(args, 1)?.to_owned(),
                }
            }),
            Command::DriverConfUpdated => Notification::Driver(DriverEvent::ConfUpdated),
            Command::LogRecord => match decode_records(arg_bytes(args, 0)?).next() {
                Some(record) => Notification::Log(record?),
                None => {
                    return Err(AppError::MalformedRecord(
                        "log broadcast carries no record".into(),
                    ))
                }
            },
            other => {
                return Err(AppError::InvalidInput(format!(
                    "{other:?} is not a broadcast"
                )))
            }
        };
        Ok(notification)
    }

    /// Raises the event on the matching bus.
    pub fn emit(&self, events: &Events) {
        match self {
            Notification::Stat(e) => events.stats.emit(e),
            Notification::Driver(e) => events.driver.emit(e),
            Notification::Log(r) => events.logs.emit(r),
        }
    }
}

/// Relay subscriptions; dropping the handle unsubscribes them.
pub struct RelayHandle {
    events: Events,
    stats: SubscriptionId,
    logs: SubscriptionId,
    driver: SubscriptionId,
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.events.stats.unsubscribe(self.stats);
        self.events.logs.unsubscribe(self.logs);
        self.events.driver.unsubscribe(self.driver);
    }
}

/// Forwards every event raised on `events` to `sink` as a broadcast message,
/// synchronously and therefore in emission order.
pub fn relay_events(events: &Events, sink: impl Fn(RpcMessage) + Send + Sync + 'static) -> RelayHandle {
    let forward: Arc<dyn Fn(Notification) + Send + Sync> =
        Arc::new(move |notification: Notification| match notification.to_message() {
            Ok(msg) => sink(msg),
            Err(e) => tracing::error!("Cannot encode {notification:?} for broadcast: {e}"),
        });

    let f = Arc::clone(&forward);
    let stats = events
        .stats
        .subscribe(move |e: &StatEvent| f(Notification::Stat(e.clone())));
    let f = Arc::clone(&forward);
    let logs = events
        .logs
        .subscribe(move |r: &LogRecord| f(Notification::Log(r.clone())));
    let f = forward;
    let driver = events
        .driver
        .subscribe(move |e: &DriverEvent| f(Notification::Driver(e.clone())));

    RelayHandle {
        events: events.clone(),
        stats,
        logs,
        driver,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::log::{BlockReason, BlockedConnection};
    use crate::config::StatConf;
    use crate::core::{QuotaAlert, QuotaState};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    fn samples() -> Vec<Notification> {
        vec![
            Notification::Stat(StatEvent::AppCreated {
                app_id: 3,
                path: "/usr/bin/ssh".into(),
            }),
            Notification::Stat(StatEvent::TrafficLogged {
                unix_time: 1_600_000_000,
                in_bytes: 10,
                out_bytes: 20,
                quota: QuotaState {
                    day_limit_mb: 1,
                    day_bytes: 30,
                    month_bytes: 30,
                    ..QuotaState::default()
                },
            }),
            Notification::Stat(StatEvent::QuotaAlert(QuotaAlert::Month)),
            Notification::Stat(StatEvent::ConfChanged(StatConf {
                month_start: 5,
                ..StatConf::default()
            })),
            Notification::Stat(StatEvent::TrafficCleared),
            Notification::Stat(StatEvent::AppDeleted { app_id: 3 }),
            Notification::Driver(DriverEvent::Opened),
            Notification::Driver(DriverEvent::Closed {
                reason: "device removed".into(),
            }),
            Notification::Driver(DriverEvent::ConfUpdated),
            Notification::Log(LogRecord::BlockedConnection(BlockedConnection {
                reason: BlockReason::Program,
                proto: 6,
                inbound: false,
                local_port: 40000,
                remote_port: 443,
                local_ip: Ipv4Addr::new(10, 0, 0, 2),
                remote_ip: Ipv4Addr::new(1, 1, 1, 1),
                pid: 77,
                path: "/usr/bin/curl".into(),
            })),
        ]
    }

    #[test]
    fn test_every_notification_survives_the_wire() {
        for n in samples() {
            let msg = n.to_message().unwrap();
            assert_eq!(Notification::from_message(&msg).unwrap(), n);
        }
    }

    #[test]
    fn test_replayed_events_reuse_the_request_command() {
        let msg = Notification::Stat(StatEvent::AppDeleted { app_id: 9 })
            .to_message()
            .unwrap();
        assert_eq!(msg.command, Command::StatDeleteApp.id());
        assert_eq!(msg.args, vec![RpcValue::Int(9)]);
    }

    #[test]
    fn test_request_only_command_is_not_a_broadcast() {
        let msg = RpcMessage::broadcast(Command::StatListApps.id(), vec![]);
        assert_eq!(Notification::from_message(&msg).unwrap_err().kind(), "InvalidInput");
    }

    #[test]
    fn test_relay_preserves_emission_order_and_unsubscribes_on_drop() {
        let events = Events::default();
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&out);
        let handle = relay_events(&events, move |msg| o.lock().unwrap().push(msg));

        let expected = samples();
        for n in &expected {
            n.emit(&events);
        }
        let relayed: Vec<Notification> = out
            .lock()
            .unwrap()
            .iter()
            .map(|m| Notification::from_message(m).unwrap())
            .collect();
        assert_eq!(relayed, expected);

        drop(handle);
        assert_eq!(events.stats.subscriber_count(), 0);
        assert_eq!(events.logs.subscriber_count(), 0);
        assert_eq!(events.driver.subscriber_count(), 0);
    }
}
