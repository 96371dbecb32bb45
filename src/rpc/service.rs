//! Role-agnostic handles to the statistics engine and the driver.
//!
//! On the master the handles call the local component on the blocking worker
//! pool; on a client they forward the same operation over the control
//! channel. Callers cannot tell the two apart except by latency: results,
//! errors and the events raised on the process's buses are identical.

use std::sync::Arc;

use crate::codec::rpc::RpcValue;
use crate::config::StatConf;
use crate::core::{Resolution, StatEngine, StatSnapshot};
use crate::db::{AppRecord, TrafficBucket};
use crate::driver::{DriverControl, DriverStatus};
use crate::error::AppResult;

use super::client::ControlClient;
use super::command::Command;
use super::{arg_bool, arg_bytes, arg_json};

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[derive(Clone)]
pub enum StatService {
    Local(Arc<StatEngine>),
    Remote(Arc<ControlClient>),
}

impl StatService {
    pub async fn snapshot(&self) -> AppResult<StatSnapshot> {
        match self {
            StatService::Local(engine) => Ok(engine.snapshot()),
            StatService::Remote(client) => {
                let reply = client.call(Command::StatSnapshot, vec![]).await?;
                arg_json(&reply, 0)
            }
        }
    }

    pub async fn set_conf(&self, conf: StatConf) -> AppResult<()> {
        match self {
            StatService::Local(engine) => {
                let engine = Arc::clone(engine);
                blocking(move || engine.set_conf(conf)).await
            }
            StatService::Remote(client) => {
                client
                    .call(Command::StatSetConf, vec![RpcValue::json(&conf)?])
                    .await?;
                Ok(())
            }
        }
    }

    /// Fire-and-forget on a client: failures are only logged by the master.
    pub async fn clear_traffic(&self) -> AppResult<()> {
        match self {
            StatService::Local(engine) => {
                let engine = Arc::clone(engine);
                blocking(move || engine.clear_traffic()).await
            }
            StatService::Remote(client) => client.post(Command::StatClearTraffic, vec![]),
        }
    }

    pub async fn delete_app(&self, app_id: i64) -> AppResult<bool> {
        match self {
            StatService::Local(engine) => {
                let engine = Arc::clone(engine);
                blocking(move || engine.delete_app(app_id)).await
            }
            StatService::Remote(client) => {
                let reply = client
                    .call(Command::StatDeleteApp, vec![RpcValue::Int(app_id)])
                    .await?;
                arg_bool(&reply, 0)
            }
        }
    }

    pub async fn query_buckets(
        &self,
        owner_id: i64,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> AppResult<Vec<TrafficBucket>> {
        match self {
            StatService::Local(engine) => {
                let engine = Arc::clone(engine);
                blocking(move || engine.query_buckets(owner_id, resolution, from, to)).await
            }
            StatService::Remote(client) => {
                let args = vec![
                    RpcValue::Int(owner_id),
                    RpcValue::json(&resolution)?,
                    RpcValue::Int(from),
                    RpcValue::Int(to),
                ];
                let reply = client.call(Command::StatQueryBuckets, args).await?;
                arg_json(&reply, 0)
            }
        }
    }

    pub async fn list_apps(&self) -> AppResult<Vec<AppRecord>> {
        match self {
            StatService::Local(engine) => {
                let engine = Arc::clone(engine);
                blocking(move || engine.list_apps()).await
            }
            StatService::Remote(client) => {
                let reply = client.call(Command::StatListApps, vec![]).await?;
                arg_json(&reply, 0)
            }
        }
    }
}

#[derive(Clone)]
pub enum DriverService {
    Local(Arc<DriverControl>),
    Remote(Arc<ControlClient>),
}

impl DriverService {
    pub async fn status(&self) -> AppResult<DriverStatus> {
        match self {
            DriverService::Local(control) => Ok(control.status()),
            DriverService::Remote(client) => {
                let reply = client.call(Command::DriverStatus, vec![]).await?;
                arg_json(&reply, 0)
            }
        }
    }

    pub async fn update_conf(&self, conf: Vec<u8>) -> AppResult<()> {
        match self {
            DriverService::Local(control) => {
                let control = Arc::clone(control);
                blocking(move || control.update_conf(conf)).await
            }
            DriverService::Remote(client) => {
                client
                    .call(Command::DriverUpdateConf, vec![RpcValue::Bytes(conf)])
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn set_flags(&self, flags: u32) -> AppResult<()> {
        match self {
            DriverService::Local(control) => {
                let control = Arc::clone(control);
                blocking(move || control.set_flags(flags)).await
            }
            DriverService::Remote(client) => {
                client.post(Command::DriverSetFlags, vec![RpcValue::from(flags)])
            }
        }
    }

    pub async fn query_counters(&self) -> AppResult<Vec<u8>> {
        match self {
            DriverService::Local(control) => {
                let control = Arc::clone(control);
                blocking(move || control.query_counters()).await
            }
            DriverService::Remote(client) => {
                let reply = client.call(Command::DriverQueryCounters, vec![]).await?;
                Ok(arg_bytes(&reply, 0)?.to_vec())
            }
        }
    }

    pub async fn clear_counters(&self) -> AppResult<()> {
        match self {
            DriverService::Local(control) => {
                let control = Arc::clone(control);
                blocking(move || control.clear_counters()).await
            }
            DriverService::Remote(client) => client.post(Command::DriverClearCounters, vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::codec::log::{TrafficBatch, TrafficSample};
    use crate::core::StatEvent;
    use crate::db::tests::open_memory_db;
    use crate::db::GLOBAL_OWNER;
    use crate::events::Events;
    use crate::rpc::bus::relay_events;
    use crate::rpc::client::{BroadcastHandler, ConnectionState};
    use crate::rpc::dispatch::{ClientDispatcher, MasterDispatcher};
    use crate::rpc::server::ControlServer;

    fn record(events: &Events) -> Arc<Mutex<Vec<StatEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        events
            .stats
            .subscribe(move |e: &StatEvent| s.lock().unwrap().push(e.clone()));
        seen
    }

    fn traffic(unix_time: i64, proc_id: u32, in_bytes: u32, out_bytes: u32) -> TrafficBatch {
        TrafficBatch {
            unix_time,
            samples: vec![TrafficSample {
                proc_id,
                inactive: false,
                in_bytes,
                out_bytes,
            }],
        }
    }

    #[tokio::test]
    async fn test_local_service_reports_driver_closed() {
        let control = Arc::new(DriverControl::new(Arc::new(Default::default())));
        let driver = DriverService::Local(control);
        assert_eq!(driver.status().await.unwrap(), DriverStatus { open: false });
        assert_eq!(
            driver.query_counters().await.unwrap_err().kind(),
            "DeviceUnavailable"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_service_matches_local_results_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");

        // Master side.
        let master_events = Events::default();
        let master_seen = record(&master_events);
        let engine = Arc::new(
            StatEngine::new(
                open_memory_db(),
                StatConf::default(),
                Arc::clone(&master_events.stats),
            )
            .unwrap(),
        );
        let control = Arc::new(DriverControl::new(Arc::clone(&master_events.driver)));
        let server = ControlServer::new(Arc::new(MasterDispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&control),
        )));
        let relay_target = Arc::clone(&server);
        let _relay = relay_events(&master_events, move |msg| relay_target.broadcast(&msg));
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&server).serve(ControlServer::bind(&socket).unwrap(), stop_rx.clone()));

        // Client side.
        let client_events = Events::default();
        let client_seen = record(&client_events);
        let dispatcher = Arc::new(ClientDispatcher::new(client_events));
        let client = Arc::new(ControlClient::new(
            &socket,
            Arc::clone(&dispatcher) as Arc<dyn BroadcastHandler>,
        ));
        let mut state = client.subscribe_state();
        tokio::spawn(Arc::clone(&client).run(None, stop_rx));
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, ConnectionState::Connected { .. })),
        )
        .await
        .unwrap()
        .unwrap();
        dispatcher.resync(&client).await.unwrap();

        let local = StatService::Local(Arc::clone(&engine));
        let remote = StatService::Remote(Arc::clone(&client));

        let conf = StatConf {
            quota_day_mb: 1,
            ..StatConf::default()
        };
        remote.set_conf(conf.clone()).await.unwrap();
        assert_eq!(engine.conf(), conf);

        let app_id = engine.log_process_new(4, "/usr/bin/wget").unwrap();
        engine.log_traffic(&traffic(3600 * 5, 4, 700_000, 400_000)).unwrap();
        engine.log_traffic(&traffic(3600 * 6, 99, 10, 20)).unwrap();
        // Next day, then a late sample for the first day.
        engine.log_traffic(&traffic(86_400 + 3600, 4, 6, 4)).unwrap();
        engine.log_traffic(&traffic(3600 * 7, 4, 1, 0)).unwrap();

        for owner in [GLOBAL_OWNER, app_id] {
            assert_eq!(
                remote.query_buckets(owner, Resolution::Hour, 0, 100).await.unwrap(),
                local.query_buckets(owner, Resolution::Hour, 0, 100).await.unwrap(),
            );
        }
        assert_eq!(remote.list_apps().await.unwrap(), local.list_apps().await.unwrap());
        assert_eq!(remote.snapshot().await.unwrap(), local.snapshot().await.unwrap());
        let cached = dispatcher.cached_snapshot().unwrap();
        assert_eq!(cached, engine.snapshot());
        assert_eq!(cached.quota.day_bytes, 10);
        assert!(!cached.quota.day_alerted);
        assert_eq!(
            remote.delete_app(GLOBAL_OWNER).await.unwrap_err(),
            local.delete_app(GLOBAL_OWNER).await.unwrap_err(),
        );

        remote.clear_traffic().await.unwrap();
        // The posted clear runs before this call; its broadcast precedes the reply.
        assert!(remote.list_apps().await.is_ok());
        assert!(remote.delete_app(app_id).await.unwrap());
        assert_eq!(dispatcher.cached_snapshot().unwrap(), engine.snapshot());

        let master_seen = master_seen.lock().unwrap().clone();
        assert!(master_seen.contains(&StatEvent::QuotaAlert(crate::core::QuotaAlert::Day)));
        assert!(master_seen.contains(&StatEvent::TrafficCleared));
        assert_eq!(*client_seen.lock().unwrap(), master_seen);

        let remote_driver = DriverService::Remote(Arc::clone(&client));
        assert_eq!(remote_driver.status().await.unwrap(), control.status());
        assert_eq!(
            remote_driver.update_conf(vec![1, 2]).await.unwrap_err().kind(),
            "DeviceUnavailable"
        );

        stop.send(true).unwrap();
    }
}
