//! Background service lifecycle management.
//!
//! `BackgroundServices` owns every long-running task of the process and the
//! shutdown signal they all watch. The master runs:
//! 1. Log pipeline (driver reads, statistics, record events)
//! 2. Control server accept loop
//! 3. Statistics maintenance (periodic flush + retention pruning)
//!
//! A client runs the reconnect loop and the resync task instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config;
use crate::context::Launch;
use crate::core::StatEngine;
use crate::db::now_unix;

pub struct BackgroundServices {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundServices {
    /// Spawns the role's tasks on the current runtime.
    pub fn start(launch: Launch) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let tasks = match launch {
            Launch::Master {
                engine,
                pipeline,
                server,
                listener,
            } => vec![
                tokio::spawn(pipeline.run(rx.clone())),
                tokio::spawn(server.serve(listener, rx.clone())),
                tokio::spawn(run_maintenance(
                    engine,
                    Duration::from_secs(config::STAT_MAINTENANCE_INTERVAL_SECS),
                    config::PRUNE_CHECK_INTERVAL_TICKS,
                    rx,
                )),
            ],
            Launch::Client {
                client,
                dispatcher,
                stream,
            } => vec![
                tokio::spawn(Arc::clone(&client).run(Some(stream), rx.clone())),
                tokio::spawn(dispatcher.run_resync(client, rx)),
            ],
        };
        tracing::info!("{} background services started", tasks.len());
        Self { shutdown, tasks }
    }

    /// Signals every task and waits for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!("Background task failed: {e}");
            }
        }
        tracing::info!("Background services stopped");
    }
}

impl Drop for BackgroundServices {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Resolves once `shutdown` turns true or its sender is gone. The borrowed
/// value is released before returning, so the future stays `Send` when a
/// `select!` arm awaits other work after it.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Flushes pending statistics every `period`; prunes expired buckets on the
/// first tick and every `prune_every` ticks after it.
async fn run_maintenance(
    engine: Arc<StatEngine>,
    period: Duration,
    prune_every: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = interval.tick() => {}
        }
        let prune = ticks % prune_every.max(1) == 0;
        ticks += 1;
        let engine = Arc::clone(&engine);
        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = engine.flush() {
                tracing::warn!("{e}; keeping deltas for the next flush");
            }
            if prune {
                match engine.prune_old_buckets(now_unix()) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Pruned {n} expired traffic buckets"),
                    Err(e) => tracing::warn!("Failed to prune old buckets: {e}"),
                }
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!("Maintenance pass failed: {e}");
        }
    }
    if let Err(e) = engine.flush() {
        tracing::warn!("Final statistics flush failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::log::{TrafficBatch, TrafficSample};
    use crate::config::StatConf;
    use crate::core::Resolution;
    use crate::db::tests::open_memory_db;
    use crate::db::GLOBAL_OWNER;

    fn stored(engine: &StatEngine) -> usize {
        engine
            .query_buckets(GLOBAL_OWNER, Resolution::Hour, 0, i64::MAX)
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_maintenance_prunes_expired_buckets() {
        let engine = Arc::new(
            StatEngine::new(open_memory_db(), StatConf::default(), Arc::new(Default::default()))
                .unwrap(),
        );
        engine
            .log_traffic(&TrafficBatch {
                unix_time: 3600,
                samples: vec![TrafficSample {
                    proc_id: 1,
                    inactive: false,
                    in_bytes: 10,
                    out_bytes: 10,
                }],
            })
            .unwrap();
        assert_eq!(stored(&engine), 1);

        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(run_maintenance(
            Arc::clone(&engine),
            Duration::from_millis(10),
            1,
            rx,
        ));
        for _ in 0..200 {
            if stored(&engine) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored(&engine), 0);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
