//! # Target monitor — guarded-process registry and event hub
//!
//! Owns the only mutable registry of guarded PIDs, a bounded metric ring
//! per target, and the global event ring. A background tick samples every
//! guarded process each `sample_interval` seconds, detecting exits exactly
//! once per death (re-armed if the PID comes back). Full process listings
//! are routed through the process tracker so appearance/disappearance
//! events land on the same bus.
//!
//! The impact analyzer is installed after construction and only reaches
//! back into the monitor through `Weak` captures, so the two never form an
//! ownership cycle.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{WardenError, WardenResult};
use crate::event_log::EventLog;
use crate::impact::ImpactAnalyzer;
use crate::ring::RingBuffer;
use crate::sampler::Sampler;
use crate::tracker::ProcessTracker;
use crate::types::{ChangeKind, Event, ImpactConfig, MonitorTarget, ProcessChange, ProcessInfo, ProcessMetrics};

const TRACKER_BUFFER_LEN: usize = 200;

struct TargetState {
    target: MonitorTarget,
    last_metric: Option<ProcessMetrics>,
    exit_reported: bool,
}

pub struct TargetMonitor {
    sampler: Arc<Sampler>,
    log: Arc<EventLog>,
    targets: RwLock<HashMap<i32, TargetState>>,
    metric_rings: RwLock<HashMap<i32, Arc<RingBuffer<ProcessMetrics>>>>,
    events: RingBuffer<Event>,
    tracker: Mutex<ProcessTracker>,
    analyzer: RwLock<Option<Arc<ImpactAnalyzer>>>,
    sample_interval: u64,
    metrics_buffer_len: usize,
    running: Arc<AtomicBool>,
}

impl TargetMonitor {
    pub fn new(
        sampler: Arc<Sampler>,
        log: Arc<EventLog>,
        sample_interval: u64,
        metrics_buffer_len: usize,
        events_buffer_len: usize,
    ) -> Self {
        Self {
            sampler,
            log,
            targets: RwLock::new(HashMap::new()),
            metric_rings: RwLock::new(HashMap::new()),
            events: RingBuffer::new(events_buffer_len.max(1)),
            tracker: Mutex::new(ProcessTracker::new(TRACKER_BUFFER_LEN)),
            analyzer: RwLock::new(None),
            sample_interval: sample_interval.max(1),
            metrics_buffer_len: metrics_buffer_len.max(1),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Builds the impact analyzer wired to this monitor: target and process
    /// providers plus the event callback all capture `Weak` handles, which
    /// keeps teardown order irrelevant.
    pub fn install_analyzer(self: &Arc<Self>, cfg: ImpactConfig) -> Arc<ImpactAnalyzer> {
        let targets_fn = {
            let weak = Arc::downgrade(self);
            Arc::new(move || {
                weak.upgrade()
                    .map(|monitor| monitor.get_targets())
                    .unwrap_or_default()
            }) as crate::impact::TargetsFn
        };
        let processes_fn = {
            let weak = Arc::downgrade(self);
            Arc::new(move || match weak.upgrade() {
                Some(monitor) => monitor.list_all_processes(),
                None => Err(WardenError::Platform("monitor dropped".into())),
            }) as crate::impact::ProcessesFn
        };
        let system_fn = {
            let sampler = self.sampler.clone();
            Arc::new(move || sampler.system_metrics()) as crate::impact::SystemFn
        };

        let analyzer = Arc::new(ImpactAnalyzer::new(
            cfg,
            self.sampler.source().clone(),
            self.log.clone(),
            targets_fn,
            processes_fn,
            system_fn,
        ));

        let callback = {
            let weak = Arc::downgrade(self);
            Arc::new(move |kind: &str, pid: i32, name: &str, message: &str| {
                if let Some(monitor) = weak.upgrade() {
                    monitor.add_impact_event(kind, pid, name, message);
                }
            }) as crate::impact::EventCallback
        };
        analyzer.set_event_callback(callback);

        *self.analyzer.write() = Some(analyzer.clone());
        analyzer
    }

    pub fn analyzer(&self) -> Option<Arc<ImpactAnalyzer>> {
        self.analyzer.read().clone()
    }

    // ── Registry operations ──────────────────────────────────────────────

    /// Registers a guarded target. The PID must not already be guarded and
    /// must belong to a live process; an immediate first sample seeds the
    /// target's metric ring.
    pub fn add(&self, target: MonitorTarget) -> WardenResult<()> {
        {
            let targets = self.targets.read();
            if targets.contains_key(&target.pid) {
                return Err(WardenError::Validation(format!(
                    "target PID {} already monitored",
                    target.pid
                )));
            }
        }
        if !self.sampler.source().is_alive(target.pid) {
            return Err(WardenError::Validation(format!(
                "process PID {} not found",
                target.pid
            )));
        }

        let initial = self.sampler.target_metrics(target.pid).ok();
        let ring = Arc::new(RingBuffer::new(self.metrics_buffer_len));
        if let Some(metric) = &initial {
            ring.push(metric.clone());
        }

        info!(pid = target.pid, name = %target.name, "monitor target added");
        self.log.info(
            crate::event_log::CAT_SERVICE,
            &format!("added monitor target: pid={} name={}", target.pid, target.name),
        );

        self.metric_rings.write().insert(target.pid, ring);
        self.targets.write().insert(
            target.pid,
            TargetState {
                target,
                last_metric: initial,
                exit_reported: false,
            },
        );
        Ok(())
    }

    /// Unregisters a target and purges its ring and its analyzer events.
    pub fn remove(&self, pid: i32) {
        self.targets.write().remove(&pid);
        self.metric_rings.write().remove(&pid);
        if let Some(analyzer) = self.analyzer() {
            analyzer.remove_target_events(pid);
        }
        info!(pid = pid, "monitor target removed");
        self.log.info(
            crate::event_log::CAT_SERVICE,
            &format!("removed monitor target: pid={pid}"),
        );
    }

    pub fn remove_all(&self) {
        self.targets.write().clear();
        self.metric_rings.write().clear();
        if let Some(analyzer) = self.analyzer() {
            analyzer.clear_all();
        }
        info!("all monitor targets removed");
    }

    /// Replaces a guarded target's descriptor (alias, watch lists).
    pub fn update(&self, target: MonitorTarget) -> WardenResult<()> {
        let mut targets = self.targets.write();
        let Some(state) = targets.get_mut(&target.pid) else {
            return Err(WardenError::Validation(format!(
                "target PID {} not found",
                target.pid
            )));
        };
        info!(pid = target.pid, name = %target.name, "monitor target updated");
        state.target = target;
        Ok(())
    }

    /// Guarded targets sorted by PID ascending, independent of insertion
    /// order.
    pub fn get_targets(&self) -> Vec<MonitorTarget> {
        let targets = self.targets.read();
        let mut pids: Vec<i32> = targets.keys().copied().collect();
        pids.sort_unstable();
        pids.iter()
            .map(|pid| targets[pid].target.clone())
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Idempotent; spawns the sampling tick and starts the analyzer.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.sample_tick();
            }
        });
        info!(interval_secs = interval, "target monitor started");
        self.log.info(crate::event_log::CAT_SERVICE, "target monitor started");

        if let Some(analyzer) = self.analyzer() {
            analyzer.start();
        }
    }

    /// Signals the tick to exit and cascades to the analyzer.
    pub fn stop(&self) {
        if let Some(analyzer) = self.analyzer() {
            analyzer.stop();
        }
        if self.running.swap(false, Ordering::Relaxed) {
            info!("target monitor stopped");
            self.log.info(crate::event_log::CAT_SERVICE, "target monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ── Sampling tick ────────────────────────────────────────────────────

    /// One pass over every guarded PID. The PID list is copied out under
    /// the read lock; per-PID probing happens unlocked.
    fn sample_tick(&self) {
        let pids: Vec<i32> = self.targets.read().keys().copied().collect();
        for pid in pids {
            self.sample_one(pid);
        }
    }

    fn sample_one(&self, pid: i32) {
        let ring = self.metric_rings.read().get(&pid).cloned();
        let target_name = match self.targets.read().get(&pid) {
            Some(state) => state.target.name.clone(),
            None => return, // removed mid-tick
        };

        let alive = self.sampler.source().is_alive(pid);
        let metric = if alive {
            match self.sampler.target_metrics(pid) {
                Ok(metric) => metric,
                Err(e) => {
                    warn!(pid = pid, error = %e, "target probe failed");
                    ProcessMetrics {
                        timestamp: chrono::Utc::now(),
                        pid,
                        name: target_name.clone(),
                        cpu_pct: 0.0,
                        rss_bytes: 0,
                        alive: true,
                    }
                }
            }
        } else {
            ProcessMetrics {
                timestamp: chrono::Utc::now(),
                pid,
                name: target_name.clone(),
                cpu_pct: 0.0,
                rss_bytes: 0,
                alive: false,
            }
        };

        if let Some(ring) = ring {
            ring.push(metric.clone());
        }
        self.log.metric(&metric);

        let report_exit = {
            let mut targets = self.targets.write();
            let Some(state) = targets.get_mut(&pid) else {
                return;
            };
            state.last_metric = Some(metric);
            if alive {
                // Re-arm so a PID that comes back can report its next death.
                state.exit_reported = false;
                false
            } else if !state.exit_reported {
                state.exit_reported = true;
                true
            } else {
                false
            }
        };

        if report_exit {
            self.add_event(Event {
                timestamp: chrono::Utc::now(),
                kind: "exit".into(),
                pid,
                name: target_name,
                message: "process exited".into(),
            });
        }
    }

    // ── Events & queries ─────────────────────────────────────────────────

    fn add_event(&self, event: Event) {
        self.log
            .event(&event.kind, event.pid, &event.name, &event.message);
        self.events.push(event);
    }

    /// Entry point for the analyzer's event callback.
    pub fn add_impact_event(&self, kind: &str, pid: i32, name: &str, message: &str) {
        self.add_event(Event {
            timestamp: chrono::Utc::now(),
            kind: kind.to_string(),
            pid,
            name: name.to_string(),
            message: message.to_string(),
        });
    }

    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.events.recent(n)
    }

    pub fn process_changes(&self, n: usize) -> Vec<ProcessChange> {
        self.tracker.lock().recent_changes(n)
    }

    /// Full snapshot; also drives the tracker, publishing every observed
    /// transition as a `new_process`/`process_gone` event.
    pub fn list_all_processes(&self) -> WardenResult<Arc<Vec<ProcessInfo>>> {
        let snapshot = self.sampler.list_all_processes()?;
        let changes = self.tracker.lock().update(&snapshot);
        for change in changes {
            let (kind, message) = match change.kind {
                ChangeKind::New => ("new_process", "process started"),
                ChangeKind::Gone => ("process_gone", "process disappeared"),
            };
            self.add_event(Event {
                timestamp: change.timestamp,
                kind: kind.into(),
                pid: change.pid,
                name: change.name,
                message: message.into(),
            });
        }
        Ok(snapshot)
    }

    pub fn system_metrics(&self) -> WardenResult<crate::types::SystemMetrics> {
        self.sampler.system_metrics()
    }

    /// Last `n` samples from one target's ring, oldest first.
    pub fn metrics(&self, pid: i32, n: usize) -> Vec<ProcessMetrics> {
        self.metric_rings
            .read()
            .get(&pid)
            .map(|ring| ring.recent(n))
            .unwrap_or_default()
    }

    pub fn latest_metrics_per_target(&self) -> HashMap<i32, ProcessMetrics> {
        self.targets
            .read()
            .iter()
            .filter_map(|(pid, state)| state.last_metric.clone().map(|m| (*pid, m)))
            .collect()
    }

    pub fn recent_impacts(&self, n: usize) -> Vec<crate::types::ImpactEvent> {
        self.analyzer()
            .map(|a| a.recent_impacts(n))
            .unwrap_or_default()
    }

    pub fn impact_summary(&self) -> serde_json::Value {
        self.analyzer()
            .map(|a| a.summary())
            .unwrap_or_else(|| serde_json::json!({ "total": 0 }))
    }

    pub fn clear_impacts(&self) {
        if let Some(analyzer) = self.analyzer() {
            analyzer.clear_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_source::{ConnectionEntry, ProcessSource, RawProcess, RawSystemCounters};
    use crate::traffic::TrafficMonitor;
    use std::collections::HashSet;

    struct LiveSet {
        alive: Mutex<HashSet<i32>>,
        fds: i32,
    }

    impl LiveSet {
        fn new(pids: &[i32]) -> Self {
            Self {
                alive: Mutex::new(pids.iter().copied().collect()),
                fds: 0,
            }
        }
        fn with_fds(pids: &[i32], fds: i32) -> Self {
            Self {
                alive: Mutex::new(pids.iter().copied().collect()),
                fds,
            }
        }
        fn kill(&self, pid: i32) {
            self.alive.lock().remove(&pid);
        }
        fn revive(&self, pid: i32) {
            self.alive.lock().insert(pid);
        }
    }

    impl ProcessSource for LiveSet {
        fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
            Ok(self
                .alive
                .lock()
                .iter()
                .map(|pid| RawProcess {
                    pid: *pid,
                    name: format!("proc{pid}"),
                    num_fds: self.fds,
                    ..Default::default()
                })
                .collect())
        }
        fn probe(&self, pid: i32) -> WardenResult<RawProcess> {
            if self.alive.lock().contains(&pid) {
                Ok(RawProcess {
                    pid,
                    name: format!("proc{pid}"),
                    rss_bytes: 1024,
                    num_fds: self.fds,
                    ..Default::default()
                })
            } else {
                Err(WardenError::Platform(format!("process {pid} not found")))
            }
        }
        fn is_alive(&self, pid: i32) -> bool {
            self.alive.lock().contains(&pid)
        }
        fn find_pids_by_name(&self, _name: &str) -> WardenResult<Vec<i32>> {
            Ok(Vec::new())
        }
        fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
            Ok(Vec::new())
        }
        fn open_files(&self, _pid: i32) -> Vec<String> {
            Vec::new()
        }
        fn cpu_count(&self) -> usize {
            1
        }
        fn system_counters(&self) -> WardenResult<RawSystemCounters> {
            Ok(RawSystemCounters::default())
        }
    }

    struct Fixture {
        monitor: Arc<TargetMonitor>,
        source: Arc<LiveSet>,
        _dir: tempfile::TempDir,
    }

    fn fixture(alive: &[i32]) -> Fixture {
        fixture_from(LiveSet::new(alive))
    }

    fn fixture_from(source: LiveSet) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new(dir.path(), false, false).unwrap());
        let source = Arc::new(source);
        let traffic = Arc::new(TrafficMonitor::new(source.clone() as Arc<dyn ProcessSource>));
        let sampler = Arc::new(Sampler::new(
            source.clone() as Arc<dyn ProcessSource>,
            traffic,
            false,
        ));
        let monitor = Arc::new(TargetMonitor::new(sampler, log, 1, 300, 100));
        Fixture {
            monitor,
            source,
            _dir: dir,
        }
    }

    fn target(pid: i32) -> MonitorTarget {
        MonitorTarget {
            pid,
            name: format!("proc{pid}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_validations() {
        let f = fixture(&[100]);
        f.monitor.add(target(100)).unwrap();
        // Duplicate PID.
        assert!(f.monitor.add(target(100)).is_err());
        // Dead PID.
        assert!(f.monitor.add(target(999)).is_err());
        assert_eq!(f.monitor.target_count(), 1);
    }

    #[test]
    fn test_initial_sample_seeds_ring() {
        let f = fixture(&[100]);
        f.monitor.add(target(100)).unwrap();
        assert_eq!(f.monitor.metrics(100, 100).len(), 1);
        assert!(f.monitor.latest_metrics_per_target().contains_key(&100));
    }

    #[test]
    fn test_add_remove_add_round_trip() {
        let f = fixture(&[100]);
        f.monitor.add(target(100)).unwrap();
        f.monitor.remove(100);
        assert!(f.monitor.metrics(100, 10).is_empty());
        f.monitor.add(target(100)).unwrap();
        assert_eq!(f.monitor.metrics(100, 100).len(), 1);
    }

    #[test]
    fn test_targets_sorted_by_pid() {
        let f = fixture(&[300, 100, 200]);
        f.monitor.add(target(300)).unwrap();
        f.monitor.add(target(100)).unwrap();
        f.monitor.add(target(200)).unwrap();
        let pids: Vec<i32> = f.monitor.get_targets().iter().map(|t| t.pid).collect();
        assert_eq!(pids, vec![100, 200, 300]);
    }

    #[test]
    fn test_update_requires_existing_target() {
        let f = fixture(&[100]);
        assert!(f.monitor.update(target(100)).is_err());
        f.monitor.add(target(100)).unwrap();
        let mut updated = target(100);
        updated.alias = "primary".into();
        updated.watch_ports = vec![8080];
        f.monitor.update(updated).unwrap();
        let stored = &f.monitor.get_targets()[0];
        assert_eq!(stored.alias, "primary");
        assert_eq!(stored.watch_ports, vec![8080]);
    }

    #[test]
    fn test_exit_reported_once_and_rearmed() {
        let f = fixture(&[100]);
        f.monitor.add(target(100)).unwrap();

        // Alive tick, then three dead ticks: exactly one exit event.
        f.monitor.sample_tick();
        f.source.kill(100);
        f.monitor.sample_tick();
        f.monitor.sample_tick();
        f.monitor.sample_tick();
        let exits = |events: &[Event]| events.iter().filter(|e| e.kind == "exit").count();
        assert_eq!(exits(&f.monitor.recent_events(100)), 1);

        // Revival re-arms; the second death reports again.
        f.source.revive(100);
        f.monitor.sample_tick();
        f.source.kill(100);
        f.monitor.sample_tick();
        assert_eq!(exits(&f.monitor.recent_events(100)), 2);
    }

    #[test]
    fn test_dead_target_metric_is_flagged() {
        let f = fixture(&[100]);
        f.monitor.add(target(100)).unwrap();
        f.source.kill(100);
        f.monitor.sample_tick();
        let latest = f.monitor.latest_metrics_per_target();
        assert!(!latest[&100].alive);
    }

    #[test]
    fn test_list_all_drives_tracker_with_cold_start() {
        let f = fixture(&[1, 2, 3]);
        // Cold start: no change events.
        f.monitor.list_all_processes().unwrap();
        assert!(f.monitor.process_changes(100).is_empty());
        assert!(f.monitor.recent_events(100).is_empty());

        // One arrival, one departure. Wait out the sampler's 500 ms list
        // cache so the second call really re-enumerates.
        f.source.kill(3);
        f.source.revive(4);
        std::thread::sleep(Duration::from_millis(600));
        f.monitor.list_all_processes().unwrap();

        let changes = f.monitor.process_changes(100);
        assert_eq!(changes.len(), 2);
        let events = f.monitor.recent_events(100);
        assert!(events.iter().any(|e| e.kind == "new_process" && e.pid == 4));
        assert!(events.iter().any(|e| e.kind == "process_gone" && e.pid == 3));
    }

    #[test]
    fn test_impact_events_reach_event_ring() {
        let f = fixture(&[100]);
        f.monitor
            .add_impact_event("impact_cpu", 55, "churner", "[impact high] churner -> g: busy");
        let events = f.monitor.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "impact_cpu");
        assert_eq!(events[0].pid, 55);
    }

    #[test]
    fn test_installed_analyzer_end_to_end() {
        // Every process reports 50 FDs; with the threshold at 10 the
        // non-guarded process becomes an offender through the full
        // monitor → sampler → analyzer wiring.
        let f = fixture_from(LiveSet::with_fds(&[100, 200], 50));
        let analyzer = f.monitor.install_analyzer(ImpactConfig {
            proc_fds_threshold: 10.0,
            proc_cpu_threshold: 0.0,
            proc_memory_threshold: 0.0,
            proc_mem_growth_threshold: 0.0,
            proc_threads_threshold: 0.0,
            proc_open_files_threshold: 0.0,
            proc_disk_read_threshold: 0.0,
            proc_disk_write_threshold: 0.0,
            proc_net_recv_threshold: 0.0,
            proc_net_send_threshold: 0.0,
            ..ImpactConfig::default()
        });
        f.monitor.add(target(100)).unwrap();

        analyzer.analyze();

        let impacts = f.monitor.recent_impacts(0);
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].target_pid, 100);
        assert_eq!(impacts[0].source_pid, 200);
        // The callback delivered the event onto the monitor's ring.
        assert!(f
            .monitor
            .recent_events(10)
            .iter()
            .any(|e| e.kind == "impact_fds" && e.pid == 200));

        // Removing the target purges its analyzer events.
        f.monitor.remove(100);
        assert!(f.monitor.recent_impacts(0).is_empty());
    }
}
