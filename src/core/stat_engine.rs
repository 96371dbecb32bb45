//! Traffic statistics and quota engine.
//!
//! Every mutation takes the engine mutex, so bucket updates and the quota
//! check that follows them are atomic with respect to other writers. Events
//! are emitted while the mutex is held; subscribers therefore observe them in
//! execution order and must not call back into the engine.
//!
//! Byte deltas first accumulate in memory and are then written in one
//! transaction. A failed write leaves them pending for the next flush; the
//! in-memory quota counters are never rolled back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::period::{month_shift, unix_day, unix_hour, unix_month, Resolution};
use super::quota::{QuotaAlert, QuotaManager, QuotaState};
use crate::codec::log::{LogRecord, TrafficBatch};
use crate::config::StatConf;
use crate::db::{
    now_unix, AppRecord, AppTotalDelta, BucketDelta, Database, TrafficBucket, GLOBAL_OWNER,
};
use crate::error::{AppError, AppResult};
use crate::events::EventBus;

/// Observable statistics changes, replicated to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatEvent {
    AppCreated { app_id: i64, path: String },
    /// `quota` is the quota view right after the batch was counted.
    TrafficLogged {
        unix_time: i64,
        in_bytes: u64,
        out_bytes: u64,
        quota: QuotaState,
    },
    QuotaAlert(QuotaAlert),
    ConfChanged(StatConf),
    TrafficCleared,
    AppDeleted { app_id: i64 },
}

/// Everything a client needs to rebuild its cached view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub conf: StatConf,
    pub quota: QuotaState,
}

type BucketKey = (i64, Resolution, i64);

#[derive(Debug, Default, Clone, Copy)]
struct Delta {
    in_bytes: u64,
    out_bytes: u64,
}

impl Delta {
    fn add(&mut self, in_bytes: u64, out_bytes: u64) {
        self.in_bytes = self.in_bytes.saturating_add(in_bytes);
        self.out_bytes = self.out_bytes.saturating_add(out_bytes);
    }
}

struct EngineState {
    conf: StatConf,
    /// Driver process id -> app id, for processes the driver reported as started.
    procs: HashMap<u32, i64>,
    app_cache: HashMap<String, i64>,
    pending: BTreeMap<BucketKey, Delta>,
    /// App id -> (delta, latest hour bucket).
    pending_totals: BTreeMap<i64, (Delta, i64)>,
    quota: QuotaManager,
}

pub struct StatEngine {
    db: Database,
    state: Mutex<EngineState>,
    events: Arc<EventBus<StatEvent>>,
}

impl StatEngine {
    pub fn new(db: Database, conf: StatConf, events: Arc<EventBus<StatEvent>>) -> AppResult<Self> {
        conf.validate()?;
        let mut quota = QuotaManager::new(conf.quota_day_mb, conf.quota_month_mb);
        for kind in [QuotaAlert::Day, QuotaAlert::Month] {
            let alerted = db
                .meta_get(kind.meta_key())?
                .and_then(|v| v.parse::<i64>().ok());
            quota.restore_alerted(kind, alerted);
        }
        Ok(Self {
            db,
            state: Mutex::new(EngineState {
                conf,
                procs: HashMap::new(),
                app_cache: HashMap::new(),
                pending: BTreeMap::new(),
                pending_totals: BTreeMap::new(),
                quota,
            }),
            events,
        })
    }

    pub fn events(&self) -> &Arc<EventBus<StatEvent>> {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one decoded driver record. Blocked-connection records carry no
    /// statistics and are ignored here.
    pub fn apply_record(&self, record: &LogRecord) -> AppResult<()> {
        match record {
            LogRecord::ProcessStarted { pid, path } => self.log_process_new(*pid, path).map(|_| ()),
            LogRecord::ProcessEnded { pid } => {
                self.log_process_end(*pid);
                Ok(())
            }
            LogRecord::TrafficSamples(batch) => self.log_traffic(batch),
            LogRecord::BlockedConnection(_) => Ok(()),
        }
    }

    /// Resolves (or registers) the app at `path` and binds process `pid` to it.
    pub fn log_process_new(&self, pid: u32, path: &str) -> AppResult<i64> {
        let mut state = self.lock();
        let app_id = match state.app_cache.get(path).copied() {
            Some(id) => id,
            None => {
                let id = match self.db.app_id_by_path(path)? {
                    Some(id) => id,
                    None => {
                        let id = self.db.insert_app(path, now_unix())?;
                        tracing::debug!("Registered app {id}: {path}");
                        self.events.emit(&StatEvent::AppCreated {
                            app_id: id,
                            path: path.to_owned(),
                        });
                        id
                    }
                };
                state.app_cache.insert(path.to_owned(), id);
                id
            }
        };
        if let Some(previous) = state.procs.insert(pid, app_id) {
            if previous != app_id {
                tracing::debug!("Process {pid} rebound from app {previous} to {app_id}");
            }
        }
        Ok(app_id)
    }

    /// Drops the mapping of an exited process. Returns false if it was unknown.
    pub fn log_process_end(&self, pid: u32) -> bool {
        self.lock().procs.remove(&pid).is_some()
    }

    /// Forgets every process mapping (the driver went away).
    pub fn clear_processes(&self) {
        let mut state = self.lock();
        let n = state.procs.len();
        state.procs.clear();
        if n > 0 {
            tracing::debug!("Cleared {n} process mappings");
        }
    }

    pub fn active_processes(&self) -> usize {
        self.lock().procs.len()
    }

    /// Adds one batch of deltas to the hour/day/month buckets of each sample's
    /// app and of the global rows, then flushes and checks quotas.
    ///
    /// Samples from a process the engine never saw start count toward the
    /// global rows only. A sample flagged inactive ends its process mapping
    /// after being counted.
    pub fn log_traffic(&self, batch: &TrafficBatch) -> AppResult<()> {
        if batch.samples.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        let state = &mut *state;
        let conf = &state.conf;
        let hour = unix_hour(batch.unix_time, conf.utc_offset_secs);
        let day = unix_day(batch.unix_time, conf.utc_offset_secs);
        let month = unix_month(batch.unix_time, conf.month_start, conf.utc_offset_secs);
        let buckets = [
            (Resolution::Hour, hour),
            (Resolution::Day, day),
            (Resolution::Month, month),
        ];

        let counted = [
            (QuotaAlert::Day, self.roll_quota_period(state, QuotaAlert::Day, Resolution::Day, day)),
            (
                QuotaAlert::Month,
                self.roll_quota_period(state, QuotaAlert::Month, Resolution::Month, month),
            ),
        ];

        let mut total = Delta::default();
        for sample in &batch.samples {
            let (in_bytes, out_bytes) = (sample.in_bytes as u64, sample.out_bytes as u64);
            total.add(in_bytes, out_bytes);

            let app_id = if sample.inactive {
                state.procs.remove(&sample.proc_id)
            } else {
                state.procs.get(&sample.proc_id).copied()
            };
            match app_id {
                Some(app_id) => {
                    let entry = state.pending_totals.entry(app_id).or_default();
                    entry.0.add(in_bytes, out_bytes);
                    entry.1 = entry.1.max(hour);
                }
                None => tracing::debug!(
                    "Traffic for unknown process {} counted globally only",
                    sample.proc_id
                ),
            }
            for owner in std::iter::once(GLOBAL_OWNER).chain(app_id) {
                for (resolution, bucket) in buckets {
                    state
                        .pending
                        .entry((owner, resolution, bucket))
                        .or_default()
                        .add(in_bytes, out_bytes);
                }
            }
        }
        for (kind, counts) in counted {
            if counts {
                state.quota.add(kind, total.in_bytes.saturating_add(total.out_bytes));
            }
        }

        self.events.emit(&StatEvent::TrafficLogged {
            unix_time: batch.unix_time,
            in_bytes: total.in_bytes,
            out_bytes: total.out_bytes,
            quota: state.quota.state(),
        });

        if let Err(e) = self.flush_locked(state) {
            tracing::warn!("{e}; keeping deltas for the next flush");
        }
        while self.check_quota_locked(state).is_some() {}
        Ok(())
    }

    /// Opens a new quota period when `bucket` moved forward, seeding it from
    /// storage. Returns false for a stale bucket, whose traffic the quota skips.
    fn roll_quota_period(
        &self,
        state: &mut EngineState,
        kind: QuotaAlert,
        resolution: Resolution,
        bucket: i64,
    ) -> bool {
        if state.quota.is_stale(kind, bucket) {
            tracing::debug!("Late traffic for {kind:?} bucket {bucket} not counted toward quota");
            return false;
        }
        if state.quota.current_bucket(kind) == Some(bucket) {
            return true;
        }
        let stored = match self.db.bucket(GLOBAL_OWNER, resolution, bucket) {
            Ok(b) => b.map_or(0, |b| b.in_bytes + b.out_bytes),
            Err(e) => {
                tracing::warn!("Cannot read {resolution:?} bucket {bucket} for quota: {e:#}");
                0
            }
        };
        let pending = state
            .pending
            .get(&(GLOBAL_OWNER, resolution, bucket))
            .map_or(0, |d| d.in_bytes + d.out_bytes);
        state.quota.begin_period(kind, bucket, stored + pending);
        true
    }

    /// Writes every pending delta in one transaction.
    pub fn flush(&self) -> AppResult<()> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut EngineState) -> AppResult<()> {
        if state.pending.is_empty() && state.pending_totals.is_empty() {
            return Ok(());
        }
        let buckets: Vec<BucketDelta> = state
            .pending
            .iter()
            .map(|(&(owner_id, resolution, bucket_time), d)| BucketDelta {
                owner_id,
                resolution,
                bucket_time,
                in_bytes: d.in_bytes,
                out_bytes: d.out_bytes,
            })
            .collect();
        let totals: Vec<AppTotalDelta> = state
            .pending_totals
            .iter()
            .map(|(&app_id, (d, hour))| AppTotalDelta {
                app_id,
                hour: *hour,
                in_bytes: d.in_bytes,
                out_bytes: d.out_bytes,
            })
            .collect();

        self.db
            .add_traffic(&buckets, &totals)
            .map_err(|e| AppError::WriteFailure(format!("statistics write failed: {e:#}")))?;
        state.pending.clear();
        state.pending_totals.clear();
        Ok(())
    }

    pub fn pending_deltas(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fires at most one quota alert for the currently open periods.
    pub fn check_quota(&self) -> Option<QuotaAlert> {
        let mut state = self.lock();
        self.check_quota_locked(&mut state)
    }

    fn check_quota_locked(&self, state: &mut EngineState) -> Option<QuotaAlert> {
        let alert = state.quota.check_quota()?;
        if let Some(bucket) = state.quota.alerted_bucket(alert) {
            if let Err(e) = self.db.meta_set(alert.meta_key(), &bucket.to_string()) {
                tracing::warn!("Cannot persist {alert:?} quota alert: {e:#}");
            }
        }
        tracing::info!("{}", alert.text());
        self.events.emit(&StatEvent::QuotaAlert(alert));
        Some(alert)
    }

    /// Deletes buckets that fell out of the retention windows relative to `now`.
    pub fn prune_old_buckets(&self, now: i64) -> AppResult<usize> {
        let conf = self.lock().conf.clone();
        let hour_cutoff = unix_hour(now, conf.utc_offset_secs) - conf.hour_keep_days as i64 * 24;
        let day_cutoff = unix_day(now, conf.utc_offset_secs) - conf.day_keep_days as i64 * 24;
        let month_cutoff = month_shift(
            unix_month(now, conf.month_start, conf.utc_offset_secs),
            -(conf.month_keep_months.min(i32::MAX as u32) as i32),
        );

        let mut deleted = 0;
        for (resolution, cutoff) in [
            (Resolution::Hour, hour_cutoff),
            (Resolution::Day, day_cutoff),
            (Resolution::Month, month_cutoff),
        ] {
            deleted += self.db.prune_buckets(resolution, cutoff)?;
        }
        if deleted > 0 {
            tracing::info!("Pruned {deleted} traffic buckets past retention");
        }
        Ok(deleted)
    }

    pub fn conf(&self) -> StatConf {
        self.lock().conf.clone()
    }

    pub fn set_conf(&self, conf: StatConf) -> AppResult<()> {
        conf.validate()?;
        let mut state = self.lock();
        if state.conf.month_start != conf.month_start
            || state.conf.utc_offset_secs != conf.utc_offset_secs
        {
            state.quota.forget_periods();
            for kind in [QuotaAlert::Day, QuotaAlert::Month] {
                if let Err(e) = self.db.meta_delete(kind.meta_key()) {
                    tracing::warn!("Cannot reset {kind:?} quota alert mark: {e:#}");
                }
            }
        }
        state.quota.set_limits(conf.quota_day_mb, conf.quota_month_mb);
        state.conf = conf.clone();
        tracing::info!("Statistics configuration updated");
        self.events.emit(&StatEvent::ConfChanged(conf));
        Ok(())
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let state = self.lock();
        StatSnapshot {
            conf: state.conf.clone(),
            quota: state.quota.state(),
        }
    }

    /// Drops all buckets and totals. The app registry and process mappings stay.
    pub fn clear_traffic(&self) -> AppResult<()> {
        let mut state = self.lock();
        self.db.clear_traffic()?;
        state.pending.clear();
        state.pending_totals.clear();
        state.quota.clear();
        tracing::info!("Traffic statistics cleared");
        self.events.emit(&StatEvent::TrafficCleared);
        Ok(())
    }

    /// Removes an app with its buckets; its traffic stays in the global rows.
    pub fn delete_app(&self, app_id: i64) -> AppResult<bool> {
        if app_id == GLOBAL_OWNER {
            return Err(AppError::InvalidInput("app id 0 denotes the global rows".into()));
        }
        let mut state = self.lock();
        self.flush_locked(&mut state)?;
        if !self.db.delete_app(app_id)? {
            return Ok(false);
        }
        state.app_cache.retain(|_, id| *id != app_id);
        state.procs.retain(|_, id| *id != app_id);
        self.events.emit(&StatEvent::AppDeleted { app_id });
        Ok(true)
    }

    pub fn query_buckets(
        &self,
        owner_id: i64,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> AppResult<Vec<TrafficBucket>> {
        let mut state = self.lock();
        if let Err(e) = self.flush_locked(&mut state) {
            tracing::warn!("{e}; query may miss recent traffic");
        }
        Ok(self.db.query_buckets(owner_id, resolution, from, to)?)
    }

    pub fn list_apps(&self) -> AppResult<Vec<AppRecord>> {
        let mut state = self.lock();
        if let Err(e) = self.flush_locked(&mut state) {
            tracing::warn!("{e}; app totals may miss recent traffic");
        }
        Ok(self.db.list_apps()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::log::TrafficSample;
    use crate::core::period::to_naive;
    use crate::db::tests::open_memory_db;
    use chrono::{Datelike, NaiveDate};

    const MIB: u32 = 1024 * 1024;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    fn engine_with(conf: StatConf) -> (StatEngine, Arc<Mutex<Vec<StatEvent>>>) {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        events.subscribe(move |e: &StatEvent| s.lock().unwrap().push(e.clone()));
        (StatEngine::new(open_memory_db(), conf, events).unwrap(), seen)
    }

    fn engine() -> StatEngine {
        engine_with(StatConf::default()).0
    }

    fn sample(proc_id: u32, in_bytes: u32, out_bytes: u32) -> TrafficSample {
        TrafficSample {
            proc_id,
            inactive: false,
            in_bytes,
            out_bytes,
        }
    }

    fn batch(unix_time: i64, samples: Vec<TrafficSample>) -> TrafficBatch {
        TrafficBatch { unix_time, samples }
    }

    fn totals(e: &StatEngine, owner: i64, res: Resolution) -> Vec<(i64, u64, u64)> {
        e.query_buckets(owner, res, i64::MIN, i64::MAX)
            .unwrap()
            .into_iter()
            .map(|b| (b.bucket_time, b.in_bytes, b.out_bytes))
            .collect()
    }

    #[test]
    fn test_accumulation_is_additive() {
        let t = ts(2018, 1, 8, 10);
        let split = engine();
        let app = split.log_process_new(10, "C:\\test\\test.exe").unwrap();
        split.log_traffic(&batch(t, vec![sample(10, 100, 200)])).unwrap();
        split.log_traffic(&batch(t + 60, vec![sample(10, 300, 400)])).unwrap();

        let merged = engine();
        let app2 = merged.log_process_new(10, "C:\\test\\test.exe").unwrap();
        merged.log_traffic(&batch(t, vec![sample(10, 400, 600)])).unwrap();

        for res in Resolution::ALL {
            assert_eq!(totals(&split, app, res), totals(&merged, app2, res));
            assert_eq!(
                totals(&split, GLOBAL_OWNER, res),
                totals(&merged, GLOBAL_OWNER, res)
            );
            assert_eq!(totals(&split, app, res)[0].1, 400);
        }
        assert_eq!(split.list_apps().unwrap()[0].out_bytes, 600);
    }

    #[test]
    fn test_app_ids_are_stable_and_increasing() {
        let (e, seen) = engine_with(StatConf::default());
        let paths = ["C:\\test\\test.exe", "C:\\test\\test2.exe", "C:\\test\\test3.exe"];
        let mut ids = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            ids.push(e.log_process_new((i as u32 + 1) * 10, path).unwrap());
        }
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(e.log_process_new(99, paths[1]).unwrap(), ids[1]);
        assert_eq!(e.list_apps().unwrap().len(), 3);
        let created = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches!(ev, StatEvent::AppCreated { .. }))
            .count();
        assert_eq!(created, 3);
    }

    #[test]
    fn test_app_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.db");
        let events = Arc::new(EventBus::new());
        let first = {
            let e = StatEngine::new(
                Database::open(&path).unwrap(),
                StatConf::default(),
                Arc::clone(&events),
            )
            .unwrap();
            e.log_process_new(1, "/usr/bin/curl").unwrap()
        };
        let e = StatEngine::new(Database::open(&path).unwrap(), StatConf::default(), events)
            .unwrap();
        assert_eq!(e.log_process_new(2, "/usr/bin/curl").unwrap(), first);
        assert!(e.log_process_new(3, "/usr/bin/wget").unwrap() > first);
    }

    #[test]
    fn test_month_bucket_honours_month_start() {
        let conf = StatConf {
            month_start: 10,
            ..StatConf::default()
        };
        let (e, _) = engine_with(conf);
        e.log_traffic(&batch(ts(2018, 1, 8, 0), vec![sample(1, 5, 5)])).unwrap();
        let months = totals(&e, GLOBAL_OWNER, Resolution::Month);
        assert_eq!(months.len(), 1);
        let date = to_naive(months[0].0).date();
        assert_eq!((date.year(), date.month(), date.day()), (2017, 12, 1));
    }

    #[test]
    fn test_unknown_process_counts_globally_only() {
        let e = engine();
        let app = e.log_process_new(10, "a").unwrap();
        e.log_traffic(&batch(ts(2020, 1, 1, 0), vec![sample(10, 1, 1), sample(77, 5, 5)]))
            .unwrap();
        assert_eq!(totals(&e, app, Resolution::Hour)[0].1, 1);
        assert_eq!(totals(&e, GLOBAL_OWNER, Resolution::Hour)[0].1, 6);
    }

    #[test]
    fn test_inactive_sample_ends_process_mapping() {
        let e = engine();
        let a = e.log_process_new(10, "a").unwrap();
        let t = ts(2020, 1, 1, 0);
        e.log_traffic(&batch(
            t,
            vec![TrafficSample {
                inactive: true,
                ..sample(10, 7, 0)
            }],
        ))
        .unwrap();
        assert_eq!(e.active_processes(), 0);
        // The driver may now reuse id 10 for another program.
        let b = e.log_process_new(10, "b").unwrap();
        e.log_traffic(&batch(t, vec![sample(10, 3, 0)])).unwrap();
        assert_eq!(totals(&e, a, Resolution::Day)[0].1, 7);
        assert_eq!(totals(&e, b, Resolution::Day)[0].1, 3);
    }

    #[test]
    fn test_process_end_and_driver_loss_drop_mappings() {
        let e = engine();
        e.log_process_new(1, "a").unwrap();
        e.log_process_new(2, "b").unwrap();
        assert!(e.log_process_end(1));
        assert!(!e.log_process_end(1));
        e.clear_processes();
        assert_eq!(e.active_processes(), 0);
    }

    #[test]
    fn test_day_quota_alerts_once_per_day() {
        let conf = StatConf {
            quota_day_mb: 1,
            ..StatConf::default()
        };
        let (e, seen) = engine_with(conf);
        let day1 = ts(2020, 5, 1, 9);
        e.log_traffic(&batch(day1, vec![sample(1, MIB, 1)])).unwrap();
        e.log_traffic(&batch(day1 + 60, vec![sample(1, MIB, 0)])).unwrap();
        let day2 = ts(2020, 5, 2, 9);
        e.log_traffic(&batch(day2, vec![sample(1, MIB / 2, 0)])).unwrap();
        e.log_traffic(&batch(day2 + 60, vec![sample(1, MIB, 0)])).unwrap();
        e.log_traffic(&batch(day2 + 120, vec![sample(1, MIB, 0)])).unwrap();

        let alerts: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|ev| match ev {
                StatEvent::QuotaAlert(a) => Some(*a),
                _ => None,
            })
            .collect();
        assert_eq!(alerts, vec![QuotaAlert::Day, QuotaAlert::Day]);
        assert!(e.snapshot().quota.day_alerted);
        assert_eq!(e.check_quota(), None);
    }

    #[test]
    fn test_late_batches_neither_rewind_nor_realert() {
        let conf = StatConf {
            quota_day_mb: 1,
            ..StatConf::default()
        };
        let (e, seen) = engine_with(conf);
        let day1 = ts(2020, 5, 1, 9);
        let day2 = ts(2020, 5, 2, 9);
        e.log_traffic(&batch(day1, vec![sample(1, 2 * MIB, 0)])).unwrap();
        e.log_traffic(&batch(day2, vec![sample(1, 2 * MIB, 0)])).unwrap();
        e.log_traffic(&batch(day1 + 10, vec![sample(1, 1, 0)])).unwrap();
        e.log_traffic(&batch(day2 + 10, vec![sample(1, 1, 0)])).unwrap();

        let alerts = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches!(ev, StatEvent::QuotaAlert(QuotaAlert::Day)))
            .count();
        assert_eq!(alerts, 2);
        let quota = e.snapshot().quota;
        assert!(quota.day_alerted);
        assert_eq!(quota.day_bytes, 2 * MIB as u64 + 1);
        // The late byte still lands in its own day.
        let days = totals(&e, GLOBAL_OWNER, Resolution::Day);
        assert_eq!(days[0].1, 2 * MIB as u64 + 1);
        assert_eq!(days[1].1, 2 * MIB as u64 + 1);
    }

    #[test]
    fn test_moving_period_boundaries_resets_alert_marks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.db");
        let conf = StatConf {
            quota_month_mb: 1,
            ..StatConf::default()
        };
        let e = StatEngine::new(
            Database::open(&path).unwrap(),
            conf.clone(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        e.log_traffic(&batch(ts(2021, 4, 2, 12), vec![sample(1, 2 * MIB, 0)]))
            .unwrap();
        assert!(e.snapshot().quota.month_alerted);

        let shifted = StatConf {
            month_start: 15,
            ..conf
        };
        e.set_conf(shifted.clone()).unwrap();
        assert!(!e.snapshot().quota.month_alerted);
        drop(e);

        // The open period is now the March one, older than the old April mark.
        let (events, seen) = {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let s = Arc::clone(&seen);
            let events = Arc::new(EventBus::new());
            events.subscribe(move |e: &StatEvent| s.lock().unwrap().push(e.clone()));
            (events, seen)
        };
        let e = StatEngine::new(Database::open(&path).unwrap(), shifted, events).unwrap();
        e.log_traffic(&batch(ts(2021, 4, 2, 13), vec![sample(1, 2 * MIB, 0)]))
            .unwrap();
        assert_eq!(e.snapshot().quota.month_bytes, 2 * MIB as u64);
        assert!(seen
            .lock()
            .unwrap()
            .contains(&StatEvent::QuotaAlert(QuotaAlert::Month)));
    }

    #[test]
    fn test_quota_alert_not_repeated_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.db");
        let conf = StatConf {
            quota_month_mb: 1,
            ..StatConf::default()
        };
        let t = ts(2021, 3, 15, 12);
        let count_alerts = |seen: &Arc<Mutex<Vec<StatEvent>>>| {
            seen.lock()
                .unwrap()
                .iter()
                .filter(|ev| matches!(ev, StatEvent::QuotaAlert(QuotaAlert::Month)))
                .count()
        };
        for expected in [1, 0] {
            let events = Arc::new(EventBus::new());
            let seen = Arc::new(Mutex::new(Vec::new()));
            let s = Arc::clone(&seen);
            events.subscribe(move |e: &StatEvent| s.lock().unwrap().push(e.clone()));
            let e = StatEngine::new(Database::open(&path).unwrap(), conf.clone(), events).unwrap();
            e.log_traffic(&batch(t, vec![sample(1, 2 * MIB, 0)])).unwrap();
            assert_eq!(count_alerts(&seen), expected);
        }
    }

    #[test]
    fn test_failed_flush_keeps_deltas() {
        let e = engine();
        let t = ts(2020, 1, 1, 0);
        e.db.execute_batch_for_test("ALTER TABLE traffic_hour RENAME TO traffic_hour_off;")
            .unwrap();
        e.log_traffic(&batch(t, vec![sample(1, 10, 20)])).unwrap();
        e.log_traffic(&batch(t, vec![sample(1, 1, 2)])).unwrap();
        assert!(e.pending_deltas() > 0);
        assert_eq!(e.flush().unwrap_err().kind(), "WriteFailure");

        e.db.execute_batch_for_test("ALTER TABLE traffic_hour_off RENAME TO traffic_hour;")
            .unwrap();
        e.flush().unwrap();
        assert_eq!(e.pending_deltas(), 0);
        assert_eq!(totals(&e, GLOBAL_OWNER, Resolution::Hour), vec![(unix_hour(t, 0), 11, 22)]);
        assert_eq!(totals(&e, GLOBAL_OWNER, Resolution::Day)[0].1, 11);
    }

    #[test]
    fn test_prune_respects_each_retention_unit() {
        let conf = StatConf {
            hour_keep_days: 1,
            day_keep_days: 10,
            month_keep_months: 2,
            ..StatConf::default()
        };
        let (e, _) = engine_with(conf);
        let now = ts(2022, 6, 20, 12);
        e.log_traffic(&batch(ts(2022, 6, 18, 0), vec![sample(1, 1, 1)])).unwrap();
        e.log_traffic(&batch(ts(2022, 3, 1, 0), vec![sample(1, 1, 1)])).unwrap();
        e.log_traffic(&batch(now, vec![sample(1, 1, 1)])).unwrap();

        e.prune_old_buckets(now).unwrap();
        assert_eq!(totals(&e, GLOBAL_OWNER, Resolution::Hour).len(), 1);
        // Day buckets of 06-18 and 06-20 stay, 03-01 goes.
        assert_eq!(totals(&e, GLOBAL_OWNER, Resolution::Day).len(), 2);
        // June stays; April cutoff removes March.
        let months = totals(&e, GLOBAL_OWNER, Resolution::Month);
        assert_eq!(months.len(), 1);
        assert_eq!(to_naive(months[0].0).date().month(), 6);
    }

    #[test]
    fn test_conf_clear_and_delete_emit_in_order() {
        let (e, seen) = engine_with(StatConf::default());
        let app = e.log_process_new(1, "a").unwrap();
        e.log_traffic(&batch(ts(2020, 1, 1, 0), vec![sample(1, 1, 1)])).unwrap();
        let conf = StatConf {
            quota_day_mb: 5,
            ..StatConf::default()
        };
        e.set_conf(conf.clone()).unwrap();
        assert!(e
            .set_conf(StatConf {
                month_start: 0,
                ..StatConf::default()
            })
            .is_err());
        e.clear_traffic().unwrap();
        assert!(e.delete_app(app).unwrap());
        assert!(!e.delete_app(app).unwrap());

        assert_eq!(e.conf(), conf);
        assert_eq!(e.snapshot().quota.day_limit_mb, 5);
        let kinds: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|ev| match ev {
                StatEvent::AppCreated { .. } => "created",
                StatEvent::TrafficLogged { .. } => "traffic",
                StatEvent::ConfChanged(_) => "conf",
                StatEvent::TrafficCleared => "cleared",
                StatEvent::AppDeleted { .. } => "deleted",
                StatEvent::QuotaAlert(_) => "alert",
            })
            .collect();
        assert_eq!(kinds, vec!["created", "traffic", "conf", "cleared", "deleted"]);
        assert!(e.list_apps().unwrap().is_empty());
        assert!(totals(&e, GLOBAL_OWNER, Resolution::Hour).is_empty());
    }

    #[test]
    fn test_apply_record_routes_by_kind() {
        let e = engine();
        e.apply_record(&LogRecord::ProcessStarted {
            pid: 4,
            path: "x".into(),
        })
        .unwrap();
        assert_eq!(e.active_processes(), 1);
        e.apply_record(&LogRecord::ProcessEnded { pid: 4 }).unwrap();
        assert_eq!(e.active_processes(), 0);
    }
}
