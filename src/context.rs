//! Process-wide context, built once at startup.
//!
//! Arbitration decides the role; the role decides whether the capabilities
//! wrap local components or the control client. Everything else in the
//! process talks to the capabilities and the event buses only.

use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};

use crate::config::Settings;
use crate::core::StatEngine;
use crate::db::Database;
use crate::driver::{DriverChannel, DriverControl, FileDeviceOpener};
use crate::error::AppResult;
use crate::events::Events;
use crate::instance::{arbitrate, Arbitration, InstanceLock};
use crate::log::{LogPipeline, PipelineStats};
use crate::rpc::{
    relay_events, BroadcastHandler, ClientDispatcher, ControlClient, ControlServer, DriverService,
    MasterDispatcher, RelayHandle, StatService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Client,
}

pub struct AppContext {
    pub role: Role,
    pub settings: Settings,
    /// Buses the rest of the process subscribes to, whatever the role.
    pub events: Events,
    pub stats: StatService,
    pub driver: DriverService,
    pipeline_counters: Option<Arc<PipelineStats>>,
    client: Option<Arc<ControlClient>>,
    _relay: Option<RelayHandle>,
    _lock: Option<InstanceLock>,
}

/// Runtime resources that [`crate::services::BackgroundServices`] takes over.
pub enum Launch {
    Master {
        engine: Arc<StatEngine>,
        pipeline: LogPipeline,
        server: Arc<ControlServer>,
        listener: UnixListener,
    },
    Client {
        client: Arc<ControlClient>,
        dispatcher: Arc<ClientDispatcher>,
        stream: UnixStream,
    },
}

impl AppContext {
    pub async fn start(settings: Settings) -> AppResult<(Self, Launch)> {
        settings.validate()?;
        match arbitrate(&settings.lock_path, &settings.control_socket).await? {
            Arbitration::Master(lock) => Self::master(settings, lock),
            Arbitration::Client(stream) => Ok(Self::client(settings, stream)),
        }
    }

    fn master(settings: Settings, lock: InstanceLock) -> AppResult<(Self, Launch)> {
        let events = Events::default();
        let db = Database::open(&settings.stat_db_path)?;
        tracing::info!("Statistics database opened at {}", settings.stat_db_path.display());
        let engine = Arc::new(StatEngine::new(
            db,
            settings.stat.clone(),
            Arc::clone(&events.stats),
        )?);
        let control = Arc::new(DriverControl::new(Arc::clone(&events.driver)));
        let channel = DriverChannel::new(
            Arc::new(FileDeviceOpener::new(&settings.device_path)),
            Arc::clone(&control),
            settings.log_buffer_count,
            settings.log_buffer_size,
        );
        let pipeline = LogPipeline::new(channel, Arc::clone(&engine), Arc::clone(&events.logs));

        let listener = ControlServer::bind(&settings.control_socket)?;
        let server = ControlServer::new(Arc::new(MasterDispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&control),
        )));
        let relay_target = Arc::clone(&server);
        let relay = relay_events(&events, move |msg| relay_target.broadcast(&msg));

        let context = Self {
            role: Role::Master,
            settings,
            events,
            stats: StatService::Local(Arc::clone(&engine)),
            driver: DriverService::Local(control),
            pipeline_counters: Some(pipeline.counters()),
            client: None,
            _relay: Some(relay),
            _lock: Some(lock),
        };
        let launch = Launch::Master {
            engine,
            pipeline,
            server,
            listener,
        };
        Ok((context, launch))
    }

    fn client(settings: Settings, stream: UnixStream) -> (Self, Launch) {
        let events = Events::default();
        let dispatcher = Arc::new(ClientDispatcher::new(events.clone()));
        let client = Arc::new(ControlClient::new(
            &settings.control_socket,
            Arc::clone(&dispatcher) as Arc<dyn BroadcastHandler>,
        ));
        let context = Self {
            role: Role::Client,
            settings,
            events,
            stats: StatService::Remote(Arc::clone(&client)),
            driver: DriverService::Remote(Arc::clone(&client)),
            pipeline_counters: None,
            client: Some(Arc::clone(&client)),
            _relay: None,
            _lock: None,
        };
        let launch = Launch::Client {
            client,
            dispatcher,
            stream,
        };
        (context, launch)
    }

    /// Ingestion counters; only the master reads the driver.
    pub fn pipeline_counters(&self) -> Option<Arc<PipelineStats>> {
        self.pipeline_counters.clone()
    }

    /// False on a client that lost its master; always true on the master.
    pub fn is_connected(&self) -> bool {
        self.client.as_ref().map_or(true, |c| c.is_connected())
    }
}
