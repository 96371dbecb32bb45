//! Role-specific dispatch of control-channel traffic.
//!
//! [`MasterDispatcher`] turns client requests into calls on the master's
//! authoritative components. [`ClientDispatcher`] applies master broadcasts to
//! the client's cached view and raises the identical events on the client's
//! buses; after every (re)connect it queries the current snapshot instead of
//! relying on broadcasts it may have missed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::codec::rpc::{Origin, RpcMessage, RpcValue};
use crate::core::{QuotaAlert, StatEngine, StatEvent, StatSnapshot};
use crate::driver::{DriverControl, DriverEvent, DriverStatus};
use crate::error::{AppError, AppResult};
use crate::events::Events;
use crate::services::stopped;

use super::bus::Notification;
use super::client::{BroadcastHandler, ConnectionState, ControlClient};
use super::command::Command;
use super::server::RequestHandler;
use super::{arg_bytes, arg_i64, arg_json, arg_u64};

pub struct MasterDispatcher {
    stats: Arc<StatEngine>,
    driver: Arc<DriverControl>,
}

impl MasterDispatcher {
    pub fn new(stats: Arc<StatEngine>, driver: Arc<DriverControl>) -> Self {
        Self { stats, driver }
    }
}

impl RequestHandler for MasterDispatcher {
    fn handle(&self, origin: Origin, command: Command, args: &[RpcValue]) -> AppResult<Vec<RpcValue>> {
        tracing::debug!("{command:?} from {origin:?}");
        let reply = match command {
            Command::Ping => vec![],
            Command::StatSnapshot => vec![RpcValue::json(&self.stats.snapshot())?],
            Command::StatSetConf => {
                self.stats.set_conf(arg_json(args, 0)?)?;
                vec![]
            }
            Command::StatClearTraffic => {
                self.stats.clear_traffic()?;
                vec![]
            }
            Command::StatDeleteApp => vec![RpcValue::Bool(self.stats.delete_app(arg_i64(args, 0)?)?)],
            Command::StatQueryBuckets => {
                let buckets = self.stats.query_buckets(
                    arg_i64(args, 0)?,
                    arg_json(args, 1)?,
                    arg_i64(args, 2)?,
                    arg_i64(args, 3)?,
                )?;
                vec![RpcValue::json(&buckets)?]
            }
            Command::StatListApps => vec![RpcValue::json(&self.stats.list_apps()?)?],
            Command::DriverStatus => vec![RpcValue::json(&self.driver.status())?],
            Command::DriverUpdateConf => {
                self.driver.update_conf(arg_bytes(args, 0)?.to_vec())?;
                vec![]
            }
            Command::DriverSetFlags => {
                let flags = arg_u64(args, 0)?;
                let flags = u32::try_from(flags)
                    .map_err(|_| AppError::InvalidInput(format!("flags {flags:#x} exceed 32 bits")))?;
                self.driver.set_flags(flags)?;
                vec![]
            }
            Command::DriverQueryCounters => vec![RpcValue::Bytes(self.driver.query_counters()?)],
            Command::DriverClearCounters => {
                self.driver.clear_counters()?;
                vec![]
            }
            other => {
                return Err(AppError::InvalidInput(format!(
                    "{other:?} cannot be requested"
                )))
            }
        };
        Ok(reply)
    }
}

#[derive(Debug, Default)]
struct ClientCache {
    stat: Option<StatSnapshot>,
    driver: Option<DriverStatus>,
}

pub struct ClientDispatcher {
    events: Events,
    cache: Mutex<ClientCache>,
}

impl ClientDispatcher {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            cache: Mutex::new(ClientCache::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, ClientCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last statistics snapshot known to this client.
    pub fn cached_snapshot(&self) -> Option<StatSnapshot> {
        self.cache().stat.clone()
    }

    pub fn cached_driver_status(&self) -> Option<DriverStatus> {
        self.cache().driver
    }

    fn apply(&self, notification: &Notification) {
        let mut cache = self.cache();
        match notification {
            Notification::Stat(event) => {
                if let Some(snapshot) = cache.stat.as_mut() {
                    apply_stat_event(snapshot, event);
                }
            }
            Notification::Driver(DriverEvent::Opened) => {
                cache.driver = Some(DriverStatus { open: true })
            }
            Notification::Driver(DriverEvent::Closed { .. }) => {
                cache.driver = Some(DriverStatus { open: false })
            }
            Notification::Driver(DriverEvent::ConfUpdated) | Notification::Log(_) => {}
        }
    }

    /// Re-reads the master's state and raises events for anything that
    /// changed while this client was not listening.
    pub async fn resync(&self, client: &ControlClient) -> AppResult<()> {
        let reply = client.call(Command::StatSnapshot, vec![]).await?;
        let snapshot: StatSnapshot = arg_json(&reply, 0)?;
        let reply = client.call(Command::DriverStatus, vec![]).await?;
        let status: DriverStatus = arg_json(&reply, 0)?;

        let (previous_stat, previous_driver) = {
            let mut cache = self.cache();
            (cache.stat.replace(snapshot.clone()), cache.driver.replace(status))
        };
        if let Some(previous) = previous_stat {
            if previous.conf != snapshot.conf {
                self.events.stats.emit(&StatEvent::ConfChanged(snapshot.conf.clone()));
            }
        }
        if let Some(previous) = previous_driver {
            if previous.open != status.open {
                self.events.driver.emit(&if status.open {
                    DriverEvent::Opened
                } else {
                    DriverEvent::Closed {
                        reason: "closed while disconnected".into(),
                    }
                });
            }
        }
        tracing::debug!("Resynchronized with master (driver open: {})", status.open);
        Ok(())
    }

    /// Resyncs on every transition to connected until `shutdown` turns true.
    pub async fn run_resync(
        self: Arc<Self>,
        client: Arc<ControlClient>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut state = client.subscribe_state();
        loop {
            let connected = matches!(*state.borrow_and_update(), ConnectionState::Connected { .. });
            if connected {
                if let Err(e) = self.resync(&client).await {
                    tracing::warn!("Resync with master failed: {e}");
                }
            }
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                changed = state.changed() => if changed.is_err() { break },
            }
        }
    }
}

fn apply_stat_event(snapshot: &mut StatSnapshot, event: &StatEvent) {
    match event {
        StatEvent::ConfChanged(conf) => {
            if snapshot.conf.month_start != conf.month_start
                || snapshot.conf.utc_offset_secs != conf.utc_offset_secs
            {
                snapshot.quota.day_alerted = false;
                snapshot.quota.month_alerted = false;
            }
            snapshot.quota.day_limit_mb = conf.quota_day_mb;
            snapshot.quota.month_limit_mb = conf.quota_month_mb;
            snapshot.conf = conf.clone();
        }
        StatEvent::TrafficLogged { quota, .. } => snapshot.quota = quota.clone(),
        StatEvent::QuotaAlert(QuotaAlert::Day) => snapshot.quota.day_alerted = true,
        StatEvent::QuotaAlert(QuotaAlert::Month) => snapshot.quota.month_alerted = true,
        StatEvent::TrafficCleared => {
            snapshot.quota.day_bytes = 0;
            snapshot.quota.month_bytes = 0;
        }
        StatEvent::AppCreated { .. } | StatEvent::AppDeleted { .. } => {}
    }
}

impl BroadcastHandler for ClientDispatcher {
    fn on_broadcast(&self, msg: &RpcMessage) {
        match Notification::from_message(msg) {
            Ok(notification) => {
                self.apply(&notification);
                notification.emit(&self.events);
            }
            Err(e) => tracing::warn!("Ignoring broadcast {}: {e}", msg.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::log::{encode_records, TrafficBatch, TrafficSample};
    use crate::config::StatConf;
    use crate::core::{QuotaState, Resolution};
    use crate::db::tests::open_memory_db;
    use crate::db::{AppRecord, TrafficBucket, GLOBAL_OWNER};

    fn master() -> (MasterDispatcher, Arc<StatEngine>) {
        let stats = Arc::new(
            StatEngine::new(open_memory_db(), StatConf::default(), Arc::new(Default::default()))
                .unwrap(),
        );
        let driver = Arc::new(DriverControl::new(Arc::new(Default::default())));
        (MasterDispatcher::new(Arc::clone(&stats), driver), stats)
    }

    #[test]
    fn test_master_executes_stat_requests() {
        let (d, stats) = master();
        let app = stats.log_process_new(1, "/bin/a").unwrap();
        stats
            .log_traffic(&TrafficBatch {
                unix_time: 7200,
                samples: vec![TrafficSample {
                    proc_id: 1,
                    inactive: false,
                    in_bytes: 5,
                    out_bytes: 6,
                }],
            })
            .unwrap();
        let origin = Origin::Client(1);

        let reply = d
            .handle(
                origin,
                Command::StatQueryBuckets,
                &[
                    RpcValue::Int(GLOBAL_OWNER),
                    RpcValue::json(&Resolution::Hour).unwrap(),
                    RpcValue::Int(0),
                    RpcValue::Int(100),
                ],
            )
            .unwrap();
        let buckets: Vec<TrafficBucket> = arg_json(&reply, 0).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!((buckets[0].bucket_time, buckets[0].in_bytes), (2, 5));

        let reply = d.handle(origin, Command::StatListApps, &[]).unwrap();
        let apps: Vec<AppRecord> = arg_json(&reply, 0).unwrap();
        assert_eq!(apps[0].app_id, app);

        let reply = d.handle(origin, Command::StatDeleteApp, &[RpcValue::Int(app)]).unwrap();
        assert_eq!(reply, vec![RpcValue::Bool(true)]);
    }

    #[test]
    fn test_master_rejects_bad_arguments_and_closed_driver() {
        let (d, _) = master();
        let origin = Origin::Client(1);
        let err = d.handle(origin, Command::StatSetConf, &[RpcValue::Int(1)]).unwrap_err();
        assert_eq!(err.kind(), "MalformedRecord");
        let bad_conf = StatConf {
            month_start: 31,
            ..StatConf::default()
        };
        let err = d
            .handle(origin, Command::StatSetConf, &[RpcValue::json(&bad_conf).unwrap()])
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        let err = d.handle(origin, Command::DriverQueryCounters, &[]).unwrap_err();
        assert_eq!(err.kind(), "DeviceUnavailable");
        let err = d.handle(origin, Command::LogRecord, &[]).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[test]
    fn test_client_reemits_broadcasts_and_updates_cache() {
        let events = Events::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        events
            .stats
            .subscribe(move |e: &StatEvent| s.lock().unwrap().push(e.clone()));
        let logs = Arc::new(Mutex::new(0));
        let l = Arc::clone(&logs);
        events.logs.subscribe(move |_| *l.lock().unwrap() += 1);

        let d = ClientDispatcher::new(events);
        d.cache().stat = Some(StatSnapshot {
            conf: StatConf::default(),
            quota: Default::default(),
        });

        let conf = StatConf {
            quota_day_mb: 9,
            ..StatConf::default()
        };
        for n in [
            Notification::Stat(StatEvent::ConfChanged(conf.clone())),
            Notification::Stat(StatEvent::TrafficLogged {
                unix_time: 0,
                in_bytes: 3,
                out_bytes: 4,
                quota: QuotaState {
                    day_limit_mb: 9,
                    day_bytes: 7,
                    month_bytes: 7,
                    ..QuotaState::default()
                },
            }),
            Notification::Driver(DriverEvent::Opened),
        ] {
            d.on_broadcast(&n.to_message().unwrap());
        }
        d.on_broadcast(&RpcMessage::broadcast(
            Command::LogRecord.id(),
            vec![RpcValue::Bytes(encode_records(&[crate::codec::log::LogRecord::ProcessEnded {
                pid: 2,
            }]))],
        ));

        let snapshot = d.cached_snapshot().unwrap();
        assert_eq!(snapshot.conf, conf);
        assert_eq!(snapshot.quota.day_limit_mb, 9);
        assert_eq!(snapshot.quota.day_bytes, 7);
        assert_eq!(d.cached_driver_status(), Some(DriverStatus { open: true }));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(*logs.lock().unwrap(), 1);
    }
}
