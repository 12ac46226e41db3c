//! # Impact analyzer — offender correlation for guarded targets
//!
//! Periodically correlates system-wide resource pressure and per-process
//! thresholds with the guarded-target set, producing [`ImpactEvent`]s that
//! name the offending process. Two lifecycles coexist in the active map:
//!
//! - **Resource families** (cpu, memory, mem_growth, disk_io, network, fds,
//!   threads, open_files, vms) are instantaneous: every tick clears the
//!   family and re-emits whatever still violates. They never produce
//!   `impact_resolved`.
//! - **Conflicts** (port, file) are maintained: emitted once on first
//!   detection, deleted with a synthetic `impact_resolved` event when the
//!   conflict disappears.
//!
//! Severity: process-triggered events scale with `value / threshold`
//! (≥ 2.0 critical, ≥ 1.5 high, else medium); system-triggered events
//! interpolate per-family bands. System-triggered network events are fixed
//! at `medium` — the one family without bands, kept as the original
//! behavior.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::WardenResult;
use crate::event_log::EventLog;
use crate::file_check::FileChecker;
use crate::port_check::PortChecker;
use crate::proc_source::ProcessSource;
use crate::types::{
    ImpactConfig, ImpactEvent, ImpactKey, ImpactMetrics, ImpactType, MonitorTarget, ProcessInfo,
    Severity, SystemMetrics,
};

/// `(event_type, pid, name, message)` pushed to the event bus on emission
/// and on conflict resolution.
pub type EventCallback = Arc<dyn Fn(&str, i32, &str, &str) + Send + Sync>;
pub type TargetsFn = Arc<dyn Fn() -> Vec<MonitorTarget> + Send + Sync>;
pub type ProcessesFn = Arc<dyn Fn() -> WardenResult<Arc<Vec<ProcessInfo>>> + Send + Sync>;
pub type SystemFn = Arc<dyn Fn() -> WardenResult<SystemMetrics> + Send + Sync>;

const MIB: f64 = 1024.0 * 1024.0;
const DISCOVERY_TTL: Duration = Duration::from_secs(60);

/// Discovery caches and low-frequency check stamps; mutated only by the
/// analysis tick.
#[derive(Default)]
struct PassState {
    last_port_check: Option<Instant>,
    last_file_check: Option<Instant>,
    target_ports: HashMap<i32, Vec<u16>>,
    target_ports_at: Option<Instant>,
    target_files: HashMap<i32, Vec<String>>,
    target_files_at: Option<Instant>,
}

pub struct ImpactAnalyzer {
    config: RwLock<ImpactConfig>,
    active: RwLock<HashMap<ImpactKey, ImpactEvent>>,
    callback: RwLock<Option<EventCallback>>,

    targets: TargetsFn,
    processes: ProcessesFn,
    system: SystemFn,

    port_checker: PortChecker,
    file_checker: FileChecker,
    state: Mutex<PassState>,

    log: Arc<EventLog>,
    running: Arc<AtomicBool>,
}

impl ImpactAnalyzer {
    pub fn new(
        cfg: ImpactConfig,
        source: Arc<dyn ProcessSource>,
        log: Arc<EventLog>,
        targets: TargetsFn,
        processes: ProcessesFn,
        system: SystemFn,
    ) -> Self {
        Self {
            config: RwLock::new(Self::normalized(cfg)),
            active: RwLock::new(HashMap::new()),
            callback: RwLock::new(None),
            targets,
            processes,
            system,
            port_checker: PortChecker::new(source.clone()),
            file_checker: FileChecker::new(source),
            state: Mutex::new(PassState::default()),
            log,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Required cadences and system thresholds get hard defaults; the
    /// per-process thresholds stay as configured because zero means
    /// disabled. Legacy single-value fields migrate once, modern wins.
    fn normalized(mut cfg: ImpactConfig) -> ImpactConfig {
        if cfg.analysis_interval == 0 {
            cfg.analysis_interval = 5;
        }
        if cfg.top_n_processes == 0 {
            cfg.top_n_processes = 10;
        }
        if cfg.history_len == 0 {
            cfg.history_len = 100;
        }
        if cfg.file_check_interval == 0 {
            cfg.file_check_interval = 30;
        }
        if cfg.port_check_interval == 0 {
            cfg.port_check_interval = 30;
        }
        if cfg.cpu_threshold <= 0.0 {
            cfg.cpu_threshold = 80.0;
        }
        if cfg.memory_threshold <= 0.0 {
            cfg.memory_threshold = 85.0;
        }
        if cfg.disk_io_threshold <= 0.0 {
            cfg.disk_io_threshold = 100.0;
        }
        if cfg.network_threshold <= 0.0 {
            cfg.network_threshold = 100.0;
        }

        if cfg.process_cpu_threshold > 0.0 && cfg.proc_cpu_threshold == 0.0 {
            cfg.proc_cpu_threshold = cfg.process_cpu_threshold;
        }
        if cfg.process_memory_threshold > 0.0 && cfg.proc_memory_threshold == 0.0 {
            cfg.proc_memory_threshold = cfg.process_memory_threshold;
        }
        if cfg.process_disk_io_threshold > 0.0
            && cfg.proc_disk_read_threshold == 0.0
            && cfg.proc_disk_write_threshold == 0.0
        {
            cfg.proc_disk_read_threshold = cfg.process_disk_io_threshold;
            cfg.proc_disk_write_threshold = cfg.process_disk_io_threshold;
        }
        if cfg.process_network_threshold > 0.0
            && cfg.proc_net_recv_threshold == 0.0
            && cfg.proc_net_send_threshold == 0.0
        {
            cfg.proc_net_recv_threshold = cfg.process_network_threshold;
            cfg.proc_net_send_threshold = cfg.process_network_threshold;
        }
        cfg
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn start(self: &Arc<Self>) {
        if !self.config.read().enabled {
            return;
        }
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let interval = self.config.read().analysis_interval;
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(analyzer) = weak.upgrade() else { break };
                analyzer.analyze();
            }
        });
        info!(interval_secs = interval, "impact analyzer started");
        self.log.info(
            crate::event_log::CAT_IMPACT,
            &format!("impact analyzer started (interval={interval}s)"),
        );
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!("impact analyzer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_event_callback(&self, cb: EventCallback) {
        *self.callback.write() = Some(cb);
    }

    // ── Config ───────────────────────────────────────────────────────────

    pub fn config(&self) -> ImpactConfig {
        self.config.read().clone()
    }

    /// Runtime threshold replacement. System thresholds and cadences only
    /// accept positive values (their checks cannot be disabled); per-process
    /// thresholds are taken verbatim so zero disables the check.
    pub fn update_config(&self, new: ImpactConfig) {
        let mut cfg = self.config.write();
        if new.cpu_threshold > 0.0 {
            cfg.cpu_threshold = new.cpu_threshold;
        }
        if new.memory_threshold > 0.0 {
            cfg.memory_threshold = new.memory_threshold;
        }
        if new.disk_io_threshold > 0.0 {
            cfg.disk_io_threshold = new.disk_io_threshold;
        }
        if new.network_threshold > 0.0 {
            cfg.network_threshold = new.network_threshold;
        }
        if new.top_n_processes > 0 {
            cfg.top_n_processes = new.top_n_processes;
        }
        if new.analysis_interval > 0 {
            cfg.analysis_interval = new.analysis_interval;
        }
        if new.file_check_interval > 0 {
            cfg.file_check_interval = new.file_check_interval;
        }
        if new.port_check_interval > 0 {
            cfg.port_check_interval = new.port_check_interval;
        }
        cfg.proc_cpu_threshold = new.proc_cpu_threshold;
        cfg.proc_memory_threshold = new.proc_memory_threshold;
        cfg.proc_mem_growth_threshold = new.proc_mem_growth_threshold;
        cfg.proc_vms_threshold = new.proc_vms_threshold;
        cfg.proc_fds_threshold = new.proc_fds_threshold;
        cfg.proc_threads_threshold = new.proc_threads_threshold;
        cfg.proc_open_files_threshold = new.proc_open_files_threshold;
        cfg.proc_disk_read_threshold = new.proc_disk_read_threshold;
        cfg.proc_disk_write_threshold = new.proc_disk_write_threshold;
        cfg.proc_net_recv_threshold = new.proc_net_recv_threshold;
        cfg.proc_net_send_threshold = new.proc_net_send_threshold;

        info!(
            sys_cpu = cfg.cpu_threshold,
            sys_mem = cfg.memory_threshold,
            proc_cpu = cfg.proc_cpu_threshold,
            proc_mem_mb = cfg.proc_memory_threshold,
            "impact thresholds updated"
        );
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Active impacts sorted oldest-first, last `n` (0 = all).
    pub fn recent_impacts(&self, n: usize) -> Vec<ImpactEvent> {
        let mut events: Vec<ImpactEvent> = self.active.read().values().cloned().collect();
        events.sort_by_key(|e| e.timestamp);
        if n > 0 && events.len() > n {
            events.split_off(events.len() - n)
        } else {
            events
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        let active = self.active.read();
        let mut by_type: HashMap<&str, usize> = HashMap::new();
        let mut by_severity: HashMap<&str, usize> = HashMap::new();
        let mut by_target: HashMap<String, usize> = HashMap::new();
        for event in active.values() {
            *by_type.entry(event.impact_type.as_str()).or_insert(0) += 1;
            *by_severity.entry(event.severity.as_str()).or_insert(0) += 1;
            *by_target.entry(event.target_name.clone()).or_insert(0) += 1;
        }
        serde_json::json!({
            "total": active.len(),
            "by_type": by_type,
            "by_severity": by_severity,
            "by_target": by_target,
        })
    }

    /// Deletes every active impact scoped to a removed target.
    pub fn remove_target_events(&self, target_pid: i32) {
        self.active
            .write()
            .retain(|key, _| key.target_pid != target_pid);
        info!(pid = target_pid, "impact events purged for removed target");
    }

    pub fn clear_all(&self) {
        self.active.write().clear();
    }

    // ── Analysis tick ────────────────────────────────────────────────────

    /// One full correlation pass. Called by the background loop; public so
    /// callers with their own scheduling (and tests) can drive it.
    pub fn analyze(&self) {
        let targets = (self.targets)();
        if targets.is_empty() {
            self.active.write().clear();
            return;
        }

        let sys = match (self.system)() {
            Ok(sys) => sys,
            Err(e) => {
                warn!(error = %e, "system metrics unavailable, skipping analysis tick");
                return;
            }
        };
        let procs = match (self.processes)() {
            Ok(procs) => procs,
            Err(e) => {
                warn!(error = %e, "process enumeration failed, skipping analysis tick");
                return;
            }
        };

        let proc_map: HashMap<i32, &ProcessInfo> = procs.iter().map(|p| (p.pid, p)).collect();
        let guarded: HashSet<i32> = targets.iter().map(|t| t.pid).collect();
        let cfg = self.config.read().clone();

        self.analyze_cpu(&cfg, &sys, &procs, &targets, &proc_map, &guarded);
        self.analyze_memory(&cfg, &sys, &procs, &targets, &proc_map, &guarded);
        self.analyze_disk_io(&cfg, &sys, &procs, &targets, &proc_map, &guarded);
        self.analyze_network(&cfg, &sys, &procs, &targets, &proc_map, &guarded);
        self.analyze_other(&cfg, &sys, &procs, &targets, &proc_map, &guarded);

        let now = Instant::now();
        let (port_due, file_due) = {
            let state = self.state.lock();
            (
                state.last_port_check.map_or(true, |t| {
                    now.duration_since(t) >= Duration::from_secs(cfg.port_check_interval)
                }),
                state.last_file_check.map_or(true, |t| {
                    now.duration_since(t) >= Duration::from_secs(cfg.file_check_interval)
                }),
            )
        };
        if port_due {
            self.analyze_port_conflicts(&targets, &guarded);
            self.state.lock().last_port_check = Some(now);
        }
        if file_due {
            self.analyze_file_conflicts(&targets, &guarded);
            self.state.lock().last_file_check = Some(now);
        }

        self.cleanup_orphaned(&guarded);
    }

    fn cleanup_orphaned(&self, guarded: &HashSet<i32>) {
        self.active
            .write()
            .retain(|key, _| guarded.contains(&key.target_pid));
    }

    fn clear_events_of_type(&self, impact_type: ImpactType) {
        self.active
            .write()
            .retain(|key, _| key.impact_type != impact_type);
    }

    // ── Resource families ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn analyze_cpu(
        &self,
        cfg: &ImpactConfig,
        sys: &SystemMetrics,
        procs: &[ProcessInfo],
        targets: &[MonitorTarget],
        proc_map: &HashMap<i32, &ProcessInfo>,
        guarded: &HashSet<i32>,
    ) {
        self.clear_events_of_type(ImpactType::Cpu);

        let system_triggered = sys.cpu_percent >= cfg.cpu_threshold;
        let top = top_by(procs, cfg.top_n_processes, |p| p.cpu_pct);

        for target in targets {
            let Some(target_proc) = proc_map.get(&target.pid) else {
                continue;
            };
            for proc_ in &top {
                if guarded.contains(&proc_.pid) {
                    continue;
                }
                let process_triggered =
                    cfg.proc_cpu_threshold > 0.0 && proc_.cpu_pct >= cfg.proc_cpu_threshold;
                if !system_triggered && !process_triggered {
                    continue;
                }
                // System-only trigger still requires a real consumer.
                if system_triggered && !process_triggered && proc_.cpu_pct < 10.0 {
                    continue;
                }

                let (severity, description) = if process_triggered {
                    (
                        ratio_severity(proc_.cpu_pct, cfg.proc_cpu_threshold),
                        format!(
                            "process {} (PID {}) CPU usage {:.1}% exceeds threshold {:.0}%",
                            proc_.name, proc_.pid, proc_.cpu_pct, cfg.proc_cpu_threshold
                        ),
                    )
                } else {
                    (
                        banded_severity(sys.cpu_percent, 80.0, 90.0, 95.0),
                        format!(
                            "system CPU {:.1}% over threshold, process {} (PID {}) using {:.1}%",
                            sys.cpu_percent, proc_.name, proc_.pid, proc_.cpu_pct
                        ),
                    )
                };

                self.record_impact(
                    ImpactEvent {
                        timestamp: chrono::Utc::now(),
                        target_pid: target.pid,
                        target_name: target.display_name().to_string(),
                        impact_type: ImpactType::Cpu,
                        severity,
                        source_pid: proc_.pid,
                        source_name: proc_.name.clone(),
                        description,
                        metrics: ImpactMetrics {
                            system_cpu: sys.cpu_percent,
                            system_memory: sys.memory_percent,
                            target_cpu: target_proc.cpu_pct,
                            target_memory: target_proc.rss_bytes,
                            source_cpu: proc_.cpu_pct,
                            source_memory: proc_.rss_bytes,
                            ..Default::default()
                        },
                        suggestion: cpu_suggestion(severity, &proc_.name, proc_.cpu_pct),
                    },
                    String::new(),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_memory(
        &self,
        cfg: &ImpactConfig,
        sys: &SystemMetrics,
        procs: &[ProcessInfo],
        targets: &[MonitorTarget],
        proc_map: &HashMap<i32, &ProcessInfo>,
        guarded: &HashSet<i32>,
    ) {
        self.clear_events_of_type(ImpactType::Memory);

        let system_triggered = sys.memory_percent >= cfg.memory_threshold;
        let proc_threshold_bytes = cfg.proc_memory_threshold * MIB;
        let top = top_by(procs, cfg.top_n_processes, |p| p.rss_bytes as f64);

        for target in targets {
            let Some(target_proc) = proc_map.get(&target.pid) else {
                continue;
            };
            for proc_ in &top {
                if guarded.contains(&proc_.pid) {
                    continue;
                }
                let process_triggered = cfg.proc_memory_threshold > 0.0
                    && proc_.rss_bytes as f64 >= proc_threshold_bytes;
                if !system_triggered && !process_triggered {
                    continue;
                }
                if system_triggered && !process_triggered && (proc_.rss_bytes as f64) < 100.0 * MIB
                {
                    continue;
                }

                let (severity, description) = if process_triggered {
                    (
                        ratio_severity(proc_.rss_bytes as f64, proc_threshold_bytes),
                        format!(
                            "process {} (PID {}) memory {} exceeds threshold {:.0} MB",
                            proc_.name,
                            proc_.pid,
                            format_bytes(proc_.rss_bytes),
                            cfg.proc_memory_threshold
                        ),
                    )
                } else {
                    (
                        banded_severity(sys.memory_percent, 85.0, 92.0, 98.0),
                        format!(
                            "system memory {:.1}% over threshold, process {} (PID {}) using {}",
                            sys.memory_percent,
                            proc_.name,
                            proc_.pid,
                            format_bytes(proc_.rss_bytes)
                        ),
                    )
                };

                self.record_impact(
                    ImpactEvent {
                        timestamp: chrono::Utc::now(),
                        target_pid: target.pid,
                        target_name: target.display_name().to_string(),
                        impact_type: ImpactType::Memory,
                        severity,
                        source_pid: proc_.pid,
                        source_name: proc_.name.clone(),
                        description,
                        metrics: ImpactMetrics {
                            system_cpu: sys.cpu_percent,
                            system_memory: sys.memory_percent,
                            target_cpu: target_proc.cpu_pct,
                            target_memory: target_proc.rss_bytes,
                            source_cpu: proc_.cpu_pct,
                            source_memory: proc_.rss_bytes,
                            ..Default::default()
                        },
                        suggestion: memory_suggestion(
                            severity,
                            &proc_.name,
                            proc_.rss_bytes,
                            proc_.rss_growth_rate,
                        ),
                    },
                    String::new(),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_disk_io(
        &self,
        cfg: &ImpactConfig,
        sys: &SystemMetrics,
        procs: &[ProcessInfo],
        targets: &[MonitorTarget],
        proc_map: &HashMap<i32, &ProcessInfo>,
        guarded: &HashSet<i32>,
    ) {
        self.clear_events_of_type(ImpactType::DiskIo);

        let system_threshold = cfg.disk_io_threshold * MIB;
        let total_io = sys.disk_read_rate + sys.disk_write_rate;
        let system_triggered = total_io >= system_threshold;
        let read_threshold = cfg.proc_disk_read_threshold * MIB;
        let write_threshold = cfg.proc_disk_write_threshold * MIB;
        let top = top_by(procs, cfg.top_n_processes, |p| {
            p.disk_read_rate + p.disk_write_rate
        });

        for target in targets {
            let Some(target_proc) = proc_map.get(&target.pid) else {
                continue;
            };
            for proc_ in &top {
                if guarded.contains(&proc_.pid) {
                    continue;
                }
                let read_triggered =
                    cfg.proc_disk_read_threshold > 0.0 && proc_.disk_read_rate >= read_threshold;
                let write_triggered =
                    cfg.proc_disk_write_threshold > 0.0 && proc_.disk_write_rate >= write_threshold;
                let process_triggered = read_triggered || write_triggered;
                let proc_io = proc_.disk_read_rate + proc_.disk_write_rate;

                if !system_triggered && !process_triggered {
                    continue;
                }
                if system_triggered && !process_triggered && proc_io < 10.0 * MIB {
                    continue;
                }

                let (severity, description) = if read_triggered {
                    (
                        ratio_severity(proc_.disk_read_rate, read_threshold),
                        format!(
                            "process {} (PID {}) disk read {:.1} MB/s exceeds threshold {:.0} MB/s",
                            proc_.name,
                            proc_.pid,
                            proc_.disk_read_rate / MIB,
                            cfg.proc_disk_read_threshold
                        ),
                    )
                } else if write_triggered {
                    (
                        ratio_severity(proc_.disk_write_rate, write_threshold),
                        format!(
                            "process {} (PID {}) disk write {:.1} MB/s exceeds threshold {:.0} MB/s",
                            proc_.name,
                            proc_.pid,
                            proc_.disk_write_rate / MIB,
                            cfg.proc_disk_write_threshold
                        ),
                    )
                } else {
                    (
                        banded_severity(total_io / MIB, 100.0, 200.0, 500.0),
                        format!(
                            "system disk I/O {:.1} MB/s over threshold, process {} (PID {}) at {:.1} MB/s",
                            total_io / MIB,
                            proc_.name,
                            proc_.pid,
                            proc_io / MIB
                        ),
                    )
                };

                self.record_impact(
                    ImpactEvent {
                        timestamp: chrono::Utc::now(),
                        target_pid: target.pid,
                        target_name: target.display_name().to_string(),
                        impact_type: ImpactType::DiskIo,
                        severity,
                        source_pid: proc_.pid,
                        source_name: proc_.name.clone(),
                        description,
                        metrics: ImpactMetrics {
                            system_cpu: sys.cpu_percent,
                            system_memory: sys.memory_percent,
                            target_cpu: target_proc.cpu_pct,
                            target_memory: target_proc.rss_bytes,
                            source_cpu: proc_.cpu_pct,
                            source_memory: proc_.rss_bytes,
                            source_disk_io: proc_io,
                            ..Default::default()
                        },
                        suggestion: format!(
                            "process {} is a heavy disk consumer and may delay the target's I/O; review its workload",
                            proc_.name
                        ),
                    },
                    String::new(),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_network(
        &self,
        cfg: &ImpactConfig,
        sys: &SystemMetrics,
        procs: &[ProcessInfo],
        targets: &[MonitorTarget],
        proc_map: &HashMap<i32, &ProcessInfo>,
        guarded: &HashSet<i32>,
    ) {
        self.clear_events_of_type(ImpactType::Network);

        let system_threshold = cfg.network_threshold * MIB;
        let total_net = sys.net_recv_rate + sys.net_send_rate;
        let system_triggered = total_net >= system_threshold;
        let recv_threshold = cfg.proc_net_recv_threshold * MIB;
        let send_threshold = cfg.proc_net_send_threshold * MIB;
        let top = top_by(procs, cfg.top_n_processes, |p| {
            p.net_recv_rate + p.net_send_rate
        });

        for target in targets {
            let Some(target_proc) = proc_map.get(&target.pid) else {
                continue;
            };
            for proc_ in &top {
                if guarded.contains(&proc_.pid) {
                    continue;
                }
                let recv_triggered =
                    cfg.proc_net_recv_threshold > 0.0 && proc_.net_recv_rate >= recv_threshold;
                let send_triggered =
                    cfg.proc_net_send_threshold > 0.0 && proc_.net_send_rate >= send_threshold;
                let process_triggered = recv_triggered || send_triggered;
                let proc_net = proc_.net_recv_rate + proc_.net_send_rate;

                if !system_triggered && !process_triggered {
                    continue;
                }
                if system_triggered && !process_triggered && proc_net < 10.0 * MIB {
                    continue;
                }

                let (severity, description) = if recv_triggered {
                    (
                        ratio_severity(proc_.net_recv_rate, recv_threshold),
                        format!(
                            "process {} (PID {}) network recv {:.1} MB/s exceeds threshold {:.0} MB/s",
                            proc_.name,
                            proc_.pid,
                            proc_.net_recv_rate / MIB,
                            cfg.proc_net_recv_threshold
                        ),
                    )
                } else if send_triggered {
                    (
                        ratio_severity(proc_.net_send_rate, send_threshold),
                        format!(
                            "process {} (PID {}) network send {:.1} MB/s exceeds threshold {:.0} MB/s",
                            proc_.name,
                            proc_.pid,
                            proc_.net_send_rate / MIB,
                            cfg.proc_net_send_threshold
                        ),
                    )
                } else {
                    // System-triggered network has no severity bands.
                    (
                        Severity::Medium,
                        format!(
                            "system network traffic {:.1} MB/s over threshold, process {} (PID {}) at {:.1} MB/s",
                            total_net / MIB,
                            proc_.name,
                            proc_.pid,
                            proc_net / MIB
                        ),
                    )
                };

                self.record_impact(
                    ImpactEvent {
                        timestamp: chrono::Utc::now(),
                        target_pid: target.pid,
                        target_name: target.display_name().to_string(),
                        impact_type: ImpactType::Network,
                        severity,
                        source_pid: proc_.pid,
                        source_name: proc_.name.clone(),
                        description,
                        metrics: ImpactMetrics {
                            system_cpu: sys.cpu_percent,
                            system_memory: sys.memory_percent,
                            target_cpu: target_proc.cpu_pct,
                            target_memory: target_proc.rss_bytes,
                            source_cpu: proc_.cpu_pct,
                            source_memory: proc_.rss_bytes,
                            source_net_io: proc_net,
                            ..Default::default()
                        },
                        suggestion: format!(
                            "process {} is a heavy network consumer and may crowd out the target's traffic",
                            proc_.name
                        ),
                    },
                    String::new(),
                );
            }
        }
    }

    /// mem_growth, fds, threads, open_files and vms: purely per-process
    /// checks, evaluated over the full process list rather than a top-N.
    #[allow(clippy::too_many_arguments)]
    fn analyze_other(
        &self,
        cfg: &ImpactConfig,
        sys: &SystemMetrics,
        procs: &[ProcessInfo],
        targets: &[MonitorTarget],
        proc_map: &HashMap<i32, &ProcessInfo>,
        guarded: &HashSet<i32>,
    ) {
        for t in [
            ImpactType::MemGrowth,
            ImpactType::Fds,
            ImpactType::Threads,
            ImpactType::OpenFiles,
            ImpactType::Vms,
        ] {
            self.clear_events_of_type(t);
        }

        let growth_threshold = cfg.proc_mem_growth_threshold * MIB;
        let vms_threshold = cfg.proc_vms_threshold * MIB;

        for target in targets {
            if !proc_map.contains_key(&target.pid) {
                continue;
            }
            for proc_ in procs {
                if guarded.contains(&proc_.pid) {
                    continue;
                }

                if cfg.proc_mem_growth_threshold > 0.0 && proc_.rss_growth_rate >= growth_threshold
                {
                    self.record_simple(
                        target,
                        sys,
                        proc_,
                        ImpactType::MemGrowth,
                        ratio_severity(proc_.rss_growth_rate, growth_threshold),
                        format!(
                            "process {} (PID {}) memory growth {:.1} MB/s exceeds threshold {:.0} MB/s",
                            proc_.name,
                            proc_.pid,
                            proc_.rss_growth_rate / MIB,
                            cfg.proc_mem_growth_threshold
                        ),
                        format!(
                            "process {} keeps allocating memory and may be leaking; investigate",
                            proc_.name
                        ),
                    );
                }

                if cfg.proc_fds_threshold > 0.0 && proc_.num_fds as f64 >= cfg.proc_fds_threshold {
                    self.record_simple(
                        target,
                        sys,
                        proc_,
                        ImpactType::Fds,
                        ratio_severity(proc_.num_fds as f64, cfg.proc_fds_threshold),
                        format!(
                            "process {} (PID {}) handle count {} exceeds threshold {:.0}",
                            proc_.name, proc_.pid, proc_.num_fds, cfg.proc_fds_threshold
                        ),
                        format!(
                            "process {} holds an unusual number of handles; check for descriptor leaks",
                            proc_.name
                        ),
                    );
                }

                if cfg.proc_threads_threshold > 0.0
                    && proc_.num_threads as f64 >= cfg.proc_threads_threshold
                {
                    self.record_simple(
                        target,
                        sys,
                        proc_,
                        ImpactType::Threads,
                        ratio_severity(proc_.num_threads as f64, cfg.proc_threads_threshold),
                        format!(
                            "process {} (PID {}) thread count {} exceeds threshold {:.0}",
                            proc_.name, proc_.pid, proc_.num_threads, cfg.proc_threads_threshold
                        ),
                        format!(
                            "process {} runs an unusual number of threads and may degrade scheduling",
                            proc_.name
                        ),
                    );
                }

                if cfg.proc_open_files_threshold > 0.0
                    && proc_.open_files as f64 >= cfg.proc_open_files_threshold
                {
                    self.record_simple(
                        target,
                        sys,
                        proc_,
                        ImpactType::OpenFiles,
                        ratio_severity(proc_.open_files as f64, cfg.proc_open_files_threshold),
                        format!(
                            "process {} (PID {}) open file count {} exceeds threshold {:.0}",
                            proc_.name, proc_.pid, proc_.open_files, cfg.proc_open_files_threshold
                        ),
                        format!("process {} holds many files open", proc_.name),
                    );
                }

                if cfg.proc_vms_threshold > 0.0 && proc_.vms as f64 >= vms_threshold {
                    self.record_simple(
                        target,
                        sys,
                        proc_,
                        ImpactType::Vms,
                        ratio_severity(proc_.vms as f64, vms_threshold),
                        format!(
                            "process {} (PID {}) virtual memory {} exceeds threshold {:.0} MB",
                            proc_.name,
                            proc_.pid,
                            format_bytes(proc_.vms),
                            cfg.proc_vms_threshold
                        ),
                        format!("process {} has a very large virtual address space", proc_.name),
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_simple(
        &self,
        target: &MonitorTarget,
        sys: &SystemMetrics,
        proc_: &ProcessInfo,
        impact_type: ImpactType,
        severity: Severity,
        description: String,
        suggestion: String,
    ) {
        let source_memory = if impact_type == ImpactType::Vms {
            proc_.vms
        } else {
            proc_.rss_bytes
        };
        self.record_impact(
            ImpactEvent {
                timestamp: chrono::Utc::now(),
                target_pid: target.pid,
                target_name: target.display_name().to_string(),
                impact_type,
                severity,
                source_pid: proc_.pid,
                source_name: proc_.name.clone(),
                description,
                metrics: ImpactMetrics {
                    system_cpu: sys.cpu_percent,
                    system_memory: sys.memory_percent,
                    source_memory,
                    ..Default::default()
                },
                suggestion,
            },
            String::new(),
        );
    }

    // ── Conflict passes ──────────────────────────────────────────────────

    fn watch_ports_for(&self, target: &MonitorTarget) -> Vec<u16> {
        let mut ports: HashSet<u16> = target.watch_ports.iter().copied().collect();
        if let Some(discovered) = self.state.lock().target_ports.get(&target.pid) {
            ports.extend(discovered.iter().copied());
        }
        let mut ports: Vec<u16> = ports.into_iter().collect();
        ports.sort_unstable();
        ports
    }

    fn watch_files_for(&self, target: &MonitorTarget) -> Vec<String> {
        let mut files: HashSet<String> = target.watch_files.iter().cloned().collect();
        if let Some(discovered) = self.state.lock().target_files.get(&target.pid) {
            files.extend(discovered.iter().cloned());
        }
        files.into_iter().collect()
    }

    fn analyze_port_conflicts(&self, targets: &[MonitorTarget], guarded: &HashSet<i32>) {
        // Refresh the auto-discovered listener cache at most once a minute.
        let discovery_due = {
            let state = self.state.lock();
            state
                .target_ports_at
                .map_or(true, |t| t.elapsed() > DISCOVERY_TTL)
        };
        if discovery_due {
            let mut discovered = HashMap::new();
            for target in targets {
                let ports = self.port_checker.listening_ports(target.pid);
                if !ports.is_empty() {
                    discovered.insert(target.pid, ports);
                }
            }
            let mut state = self.state.lock();
            state.target_ports = discovered;
            state.target_ports_at = Some(Instant::now());
        }

        let Some(conns) = self.port_checker.snapshot() else {
            return;
        };

        let mut current: HashSet<(i32, i32, u16)> = HashSet::new();
        for target in targets {
            let watch = self.watch_ports_for(target);
            if watch.is_empty() {
                continue;
            }
            for port in watch {
                for conflict in self.port_checker.conflicts_in(&conns, port, guarded) {
                    current.insert((target.pid, conflict.pid, port));
                    let severity = if conflict.status == "LISTEN" {
                        Severity::Critical
                    } else {
                        Severity::Medium
                    };
                    let state_desc = if conflict.status == "LISTEN" {
                        "is bound by another process"
                    } else {
                        "has a foreign connection"
                    };
                    let suggestion = if conflict.status == "LISTEN" {
                        format!(
                            "port {} is bound by {} (PID {}); resolve the listener clash or reconfigure",
                            port, conflict.name, conflict.pid
                        )
                    } else {
                        format!(
                            "process {} (PID {}) is connected to the target's port {}",
                            conflict.name, conflict.pid, port
                        )
                    };
                    self.record_impact(
                        ImpactEvent {
                            timestamp: chrono::Utc::now(),
                            target_pid: target.pid,
                            target_name: target.display_name().to_string(),
                            impact_type: ImpactType::Port,
                            severity,
                            source_pid: conflict.pid,
                            source_name: conflict.name.clone(),
                            description: format!(
                                "port {} {}, process {} (PID {})",
                                port, state_desc, conflict.name, conflict.pid
                            ),
                            metrics: ImpactMetrics {
                                conflict_port: port,
                                ..Default::default()
                            },
                            suggestion,
                        },
                        format!("port:{port}"),
                    );
                }
            }
        }

        self.retire_stale_conflicts(ImpactType::Port, |key| {
            key.detail
                .strip_prefix("port:")
                .and_then(|p| p.parse::<u16>().ok())
                .map(|port| (key.target_pid, key.source_pid, port))
                .map_or(true, |tuple| !current.contains(&tuple))
        });
    }

    fn analyze_file_conflicts(&self, targets: &[MonitorTarget], guarded: &HashSet<i32>) {
        let discovery_due = {
            let state = self.state.lock();
            state
                .target_files_at
                .map_or(true, |t| t.elapsed() > DISCOVERY_TTL)
        };
        if discovery_due {
            let mut discovered = HashMap::new();
            for target in targets {
                let files = self.file_checker.files_opened_by(target.pid);
                if !files.is_empty() {
                    discovered.insert(target.pid, files);
                }
            }
            let mut state = self.state.lock();
            state.target_files = discovered;
            state.target_files_at = Some(Instant::now());
        }

        self.file_checker.refresh();

        let mut current: HashSet<(i32, i32, String)> = HashSet::new();
        for target in targets {
            let watch = self.watch_files_for(target);
            if watch.is_empty() {
                continue;
            }
            for conflict in self.file_checker.find_conflicts(target.pid, &watch, guarded) {
                current.insert((target.pid, conflict.pid, conflict.path.clone()));
                self.record_impact(
                    ImpactEvent {
                        timestamp: chrono::Utc::now(),
                        target_pid: target.pid,
                        target_name: target.display_name().to_string(),
                        impact_type: ImpactType::File,
                        severity: Severity::High,
                        source_pid: conflict.pid,
                        source_name: conflict.name.clone(),
                        description: format!(
                            "file {} is also open in process {} (PID {})",
                            conflict.path, conflict.name, conflict.pid
                        ),
                        metrics: ImpactMetrics {
                            conflict_file: conflict.path.clone(),
                            ..Default::default()
                        },
                        suggestion: format!(
                            "file {} is shared between processes and may break the target's exclusive access",
                            conflict.path
                        ),
                    },
                    format!("file:{}", conflict.path),
                );
            }
        }

        self.retire_stale_conflicts(ImpactType::File, |key| {
            key.detail
                .strip_prefix("file:")
                .map(|path| (key.target_pid, key.source_pid, path.to_string()))
                .map_or(true, |tuple| !current.contains(&tuple))
        });
    }

    /// Deletes maintained conflicts whose tuple vanished and emits a
    /// synthetic `impact_resolved` for each, outside the map lock.
    fn retire_stale_conflicts(
        &self,
        impact_type: ImpactType,
        is_stale: impl Fn(&ImpactKey) -> bool,
    ) {
        let removed: Vec<ImpactEvent> = {
            let mut active = self.active.write();
            let stale: Vec<ImpactKey> = active
                .keys()
                .filter(|key| key.impact_type == impact_type && is_stale(key))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|key| active.remove(&key))
                .collect()
        };
        for event in removed {
            self.record_removed(&event);
        }
    }

    // ── Recording ────────────────────────────────────────────────────────

    /// Upserts into the active map, then — only for first insertions — logs
    /// and notifies. The callback runs after the map update and outside the
    /// lock so subscribers can re-enter analyzer queries.
    fn record_impact(&self, event: ImpactEvent, detail: String) {
        let key = ImpactKey {
            target_pid: event.target_pid,
            impact_type: event.impact_type,
            source_pid: event.source_pid,
            detail,
        };

        let (existed, callback) = {
            let mut active = self.active.write();
            let existed = active.insert(key, event.clone()).is_some();
            (existed, self.callback.read().clone())
        };

        if !existed {
            self.log.impact(
                event.impact_type.as_str(),
                event.severity.as_str(),
                &event.target_name,
                &event.source_name,
                &event.description,
            );
            if let Some(cb) = callback {
                let kind = format!("impact_{}", event.impact_type.as_str());
                let message = format!(
                    "[impact {}] {} -> {}: {}",
                    event.severity, event.source_name, event.target_name, event.description
                );
                cb(&kind, event.source_pid, &event.source_name, &message);
            }
        }
    }

    fn record_removed(&self, event: &ImpactEvent) {
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            let message = format!(
                "[impact resolved] {} no longer affects {} ({})",
                event.source_name,
                event.target_name,
                impact_type_label(event.impact_type)
            );
            cb(
                "impact_resolved",
                event.source_pid,
                &event.source_name,
                &message,
            );
        }
    }
}

// ── Severity & formatting helpers ────────────────────────────────────────────

fn banded_severity(value: f64, low: f64, medium: f64, high: f64) -> Severity {
    if value >= high {
        Severity::Critical
    } else if value >= medium {
        Severity::High
    } else if value >= low {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn ratio_severity(value: f64, threshold: f64) -> Severity {
    let ratio = value / threshold;
    if ratio >= 2.0 {
        Severity::Critical
    } else if ratio >= 1.5 {
        Severity::High
    } else {
        Severity::Medium
    }
}

fn top_by(procs: &[ProcessInfo], n: usize, key: impl Fn(&ProcessInfo) -> f64) -> Vec<ProcessInfo> {
    let mut sorted = procs.to_vec();
    sorted.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(n);
    sorted
}

fn impact_type_label(t: ImpactType) -> &'static str {
    match t {
        ImpactType::Cpu => "CPU contention",
        ImpactType::Memory => "memory pressure",
        ImpactType::MemGrowth => "memory growth",
        ImpactType::DiskIo => "disk I/O",
        ImpactType::Network => "network bandwidth",
        ImpactType::Port => "port contention",
        ImpactType::File => "file contention",
        ImpactType::Fds => "handle count",
        ImpactType::Threads => "thread count",
        ImpactType::OpenFiles => "open file count",
        ImpactType::Vms => "virtual memory",
    }
}

fn cpu_suggestion(severity: Severity, name: &str, cpu_pct: f64) -> String {
    match severity {
        Severity::Critical => format!(
            "CPU is saturated; process {name} at {cpu_pct:.1}% needs immediate attention or the host needs more cores"
        ),
        Severity::High => format!(
            "process {name} consumes a lot of CPU ({cpu_pct:.1}%) and may starve the target; verify it is healthy"
        ),
        _ => format!("keep an eye on process {name}, CPU usage {cpu_pct:.1}%"),
    }
}

fn memory_suggestion(severity: Severity, name: &str, rss: u64, growth_rate: f64) -> String {
    if growth_rate > MIB {
        return format!(
            "process {name} memory keeps growing (+{:.1} MB/s), a leak is likely; investigate",
            growth_rate / MIB
        );
    }
    match severity {
        Severity::Critical => format!(
            "memory is nearly exhausted; process {name} holds {} with OOM risk, act now",
            format_bytes(rss)
        ),
        Severity::High => format!(
            "memory pressure is high; process {name} holds {}, check whether it can be trimmed",
            format_bytes(rss)
        ),
        _ => format!("watch the memory use of process {name} ({})", format_bytes(rss)),
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    const UNITS: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", bytes as f64 / div as f64, UNITS[exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_source::{ConnectionEntry, RawProcess, RawSystemCounters};

    struct Scripted {
        conns: Mutex<Vec<ConnectionEntry>>,
        open_files: Mutex<HashMap<i32, Vec<String>>>,
        names: HashMap<i32, String>,
    }

    impl Scripted {
        fn empty() -> Self {
            Self {
                conns: Mutex::new(Vec::new()),
                open_files: Mutex::new(HashMap::new()),
                names: HashMap::new(),
            }
        }
    }

    impl ProcessSource for Scripted {
        fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
            let mut pids: HashSet<i32> = self.open_files.lock().keys().copied().collect();
            pids.extend(self.conns.lock().iter().map(|c| c.pid));
            Ok(pids
                .into_iter()
                .filter(|pid| *pid > 0)
                .map(|pid| RawProcess {
                    pid,
                    name: self
                        .names
                        .get(&pid)
                        .cloned()
                        .unwrap_or_else(|| format!("proc{pid}")),
                    ..Default::default()
                })
                .collect())
        }
        fn probe(&self, pid: i32) -> WardenResult<RawProcess> {
            Ok(RawProcess {
                pid,
                name: self
                    .names
                    .get(&pid)
                    .cloned()
                    .unwrap_or_else(|| format!("proc{pid}")),
                ..Default::default()
            })
        }
        fn is_alive(&self, _pid: i32) -> bool {
            true
        }
        fn find_pids_by_name(&self, _name: &str) -> WardenResult<Vec<i32>> {
            Ok(Vec::new())
        }
        fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
            Ok(self.conns.lock().clone())
        }
        fn open_files(&self, pid: i32) -> Vec<String> {
            self.open_files.lock().get(&pid).cloned().unwrap_or_default()
        }
        fn cpu_count(&self) -> usize {
            1
        }
        fn system_counters(&self) -> WardenResult<RawSystemCounters> {
            Ok(RawSystemCounters::default())
        }
    }

    struct Harness {
        analyzer: Arc<ImpactAnalyzer>,
        procs: Arc<Mutex<Vec<ProcessInfo>>>,
        sys: Arc<Mutex<SystemMetrics>>,
        targets: Arc<Mutex<Vec<MonitorTarget>>>,
        events: Arc<Mutex<Vec<(String, i32, String)>>>,
        source: Arc<Scripted>,
        _dir: tempfile::TempDir,
    }

    fn harness(cfg: ImpactConfig, source: Scripted) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new(dir.path(), false, false).unwrap());
        let source = Arc::new(source);

        let procs: Arc<Mutex<Vec<ProcessInfo>>> = Arc::new(Mutex::new(Vec::new()));
        let sys: Arc<Mutex<SystemMetrics>> = Arc::new(Mutex::new(SystemMetrics::default()));
        let targets: Arc<Mutex<Vec<MonitorTarget>>> = Arc::new(Mutex::new(Vec::new()));
        let events: Arc<Mutex<Vec<(String, i32, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let analyzer = {
            let procs = procs.clone();
            let sys = sys.clone();
            let targets = targets.clone();
            Arc::new(ImpactAnalyzer::new(
                cfg,
                source.clone() as Arc<dyn ProcessSource>,
                log,
                Arc::new(move || targets.lock().clone()),
                Arc::new(move || Ok(Arc::new(procs.lock().clone()))),
                Arc::new(move || Ok(sys.lock().clone())),
            ))
        };
        {
            let events = events.clone();
            analyzer.set_event_callback(Arc::new(
                move |kind: &str, pid: i32, _name: &str, message: &str| {
                    events.lock().push((kind.to_string(), pid, message.to_string()));
                },
            ));
        }

        Harness {
            analyzer,
            procs,
            sys,
            targets,
            events,
            source,
            _dir: dir,
        }
    }

    fn proc(pid: i32, name: &str, cpu: f64) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.into(),
            cpu_pct: cpu,
            ..Default::default()
        }
    }

    fn target(pid: i32, name: &str) -> MonitorTarget {
        MonitorTarget {
            pid,
            name: name.into(),
            ..Default::default()
        }
    }

    fn base_cfg() -> ImpactConfig {
        // Only the checks under test are armed.
        ImpactConfig {
            proc_cpu_threshold: 0.0,
            proc_memory_threshold: 0.0,
            proc_mem_growth_threshold: 0.0,
            proc_fds_threshold: 0.0,
            proc_threads_threshold: 0.0,
            proc_open_files_threshold: 0.0,
            proc_disk_read_threshold: 0.0,
            proc_disk_write_threshold: 0.0,
            proc_net_recv_threshold: 0.0,
            proc_net_send_threshold: 0.0,
            ..ImpactConfig::default()
        }
    }

    #[test]
    fn test_cpu_pressure_scenario() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());

        *h.targets.lock() = vec![target(100, "guarded")];
        h.sys.lock().cpu_percent = 85.0;
        *h.procs.lock() = vec![
            proc(100, "guarded", 2.0),
            proc(201, "churner", 60.0),
            proc(202, "helper", 15.0),
        ];

        h.analyzer.analyze();

        let impacts = h.analyzer.recent_impacts(0);
        let cpu: Vec<&ImpactEvent> = impacts
            .iter()
            .filter(|e| e.impact_type == ImpactType::Cpu)
            .collect();
        assert_eq!(cpu.len(), 2);

        let churner = cpu.iter().find(|e| e.source_pid == 201).unwrap();
        // 60 / 50 = 1.2x the process threshold: medium, process-level text.
        assert_eq!(churner.severity, Severity::Medium);
        assert!(churner.description.contains("exceeds threshold"));

        let helper = cpu.iter().find(|e| e.source_pid == 202).unwrap();
        // Only the system threshold fired; 85% sits in the first band.
        assert_eq!(helper.severity, Severity::Medium);
        assert!(helper.description.contains("system CPU"));

        // Guarded targets never appear as offenders.
        assert!(impacts.iter().all(|e| e.source_pid != 100));
    }

    #[test]
    fn test_cpu_noise_floor_on_system_trigger() {
        let h = harness(base_cfg(), Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        h.sys.lock().cpu_percent = 95.0;
        *h.procs.lock() = vec![proc(100, "guarded", 1.0), proc(300, "idleproc", 4.0)];

        h.analyzer.analyze();
        // 4% CPU is below the 10% floor: nothing to report.
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_ratio_severity_ladder() {
        assert_eq!(ratio_severity(60.0, 50.0), Severity::Medium);
        assert_eq!(ratio_severity(75.0, 50.0), Severity::High);
        assert_eq!(ratio_severity(100.0, 50.0), Severity::Critical);
        assert_eq!(banded_severity(85.0, 80.0, 90.0, 95.0), Severity::Medium);
        assert_eq!(banded_severity(93.0, 80.0, 90.0, 95.0), Severity::High);
        assert_eq!(banded_severity(99.0, 80.0, 90.0, 95.0), Severity::Critical);
        assert_eq!(banded_severity(10.0, 80.0, 90.0, 95.0), Severity::Low);
    }

    #[test]
    fn test_clear_and_refill_is_idempotent() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 1.0), proc(201, "churner", 80.0)];

        h.analyzer.analyze();
        h.analyzer.analyze();
        h.analyzer.analyze();

        let cpu_count = h
            .analyzer
            .recent_impacts(0)
            .iter()
            .filter(|e| e.impact_type == ImpactType::Cpu)
            .count();
        assert_eq!(cpu_count, 1);
        // The callback fired only on the first insertion of each tick's key;
        // clear-and-refill of the same key re-notifies per tick.
        let kinds: Vec<String> = h.events.lock().iter().map(|(k, _, _)| k.clone()).collect();
        assert!(kinds.iter().all(|k| k == "impact_cpu"));
    }

    #[test]
    fn test_no_targets_clears_active() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 1.0), proc(201, "churner", 80.0)];

        h.analyzer.analyze();
        assert!(!h.analyzer.recent_impacts(0).is_empty());

        h.targets.lock().clear();
        h.analyzer.analyze();
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_remove_target_events() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "a"), target(110, "b")];
        *h.procs.lock() = vec![
            proc(100, "a", 1.0),
            proc(110, "b", 1.0),
            proc(201, "churner", 80.0),
        ];

        h.analyzer.analyze();
        assert_eq!(h.analyzer.recent_impacts(0).len(), 2);

        h.analyzer.remove_target_events(100);
        let remaining = h.analyzer.recent_impacts(0);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target_pid, 110);
    }

    #[test]
    fn test_guarded_targets_never_offend_each_other() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "a"), target(110, "b")];
        // Target b burns CPU, but guarded processes are exempt offenders.
        *h.procs.lock() = vec![proc(100, "a", 1.0), proc(110, "b", 99.0)];

        h.analyzer.analyze();
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_fds_threshold() {
        let mut cfg = base_cfg();
        cfg.proc_fds_threshold = 100.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        let mut hog = proc(400, "fdhog", 0.0);
        hog.num_fds = 250;
        *h.procs.lock() = vec![proc(100, "guarded", 0.0), hog];

        h.analyzer.analyze();
        let impacts = h.analyzer.recent_impacts(0);
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].impact_type, ImpactType::Fds);
        // 250/100 = 2.5x: critical.
        assert_eq!(impacts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_negative_mem_growth_never_triggers() {
        let mut cfg = base_cfg();
        cfg.proc_mem_growth_threshold = 10.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        let mut shrinking = proc(500, "shrinker", 0.0);
        shrinking.rss_growth_rate = -50.0 * MIB;
        *h.procs.lock() = vec![proc(100, "guarded", 0.0), shrinking];

        h.analyzer.analyze();
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_port_conflict_lifecycle() {
        let source = Scripted::empty();
        *source.conns.lock() = vec![
            ConnectionEntry {
                pid: 100,
                local_port: 8080,
                remote_port: 0,
                status: "LISTEN".into(),
            },
            ConnectionEntry {
                pid: 200,
                local_port: 8080,
                remote_port: 0,
                status: "LISTEN".into(),
            },
        ];
        let h = harness(base_cfg(), source);
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 0.0), proc(200, "squatter", 0.0)];

        h.analyzer.analyze();
        let impacts = h.analyzer.recent_impacts(0);
        let port_events: Vec<&ImpactEvent> = impacts
            .iter()
            .filter(|e| e.impact_type == ImpactType::Port)
            .collect();
        assert_eq!(port_events.len(), 1);
        assert_eq!(port_events[0].source_pid, 200);
        assert_eq!(port_events[0].severity, Severity::Critical);
        assert_eq!(port_events[0].metrics.conflict_port, 8080);
        assert!(h
            .events
            .lock()
            .iter()
            .any(|(kind, pid, _)| kind == "impact_port" && *pid == 200));

        // The squatter's listener goes away; force the next port pass.
        h.source.conns.lock().retain(|c| c.pid != 200);
        {
            let mut state = h.analyzer.state.lock();
            state.last_port_check = Some(Instant::now() - Duration::from_secs(120));
            // Keep the discovery cache so the watch set still contains 8080.
        }
        h.analyzer.analyze();

        assert!(h
            .analyzer
            .recent_impacts(0)
            .iter()
            .all(|e| e.impact_type != ImpactType::Port));
        assert!(h
            .events
            .lock()
            .iter()
            .any(|(kind, pid, _)| kind == "impact_resolved" && *pid == 200));
    }

    #[test]
    fn test_established_port_conflict_is_medium() {
        let source = Scripted::empty();
        *source.conns.lock() = vec![ConnectionEntry {
            pid: 300,
            local_port: 45000,
            remote_port: 9000,
            status: "ESTABLISHED".into(),
        }];
        let h = harness(base_cfg(), source);
        let mut t = target(100, "guarded");
        t.watch_ports = vec![9000];
        *h.targets.lock() = vec![t];
        *h.procs.lock() = vec![proc(100, "guarded", 0.0), proc(300, "client", 0.0)];

        h.analyzer.analyze();
        let impacts = h.analyzer.recent_impacts(0);
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].severity, Severity::Medium);
    }

    #[test]
    fn test_file_conflict_pass() {
        let source = Scripted::empty();
        source
            .open_files
            .lock()
            .insert(100, vec!["/data/plant.db".into()]);
        source
            .open_files
            .lock()
            .insert(600, vec!["/data/plant.db".into()]);
        let h = harness(base_cfg(), source);
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 0.0), proc(600, "reader", 0.0)];

        h.analyzer.analyze();
        let impacts = h.analyzer.recent_impacts(0);
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].impact_type, ImpactType::File);
        assert_eq!(impacts[0].severity, Severity::High);
        assert_eq!(impacts[0].metrics.conflict_file, "/data/plant.db");
        assert_eq!(impacts[0].source_pid, 600);
    }

    #[test]
    fn test_config_hot_reload_changes_behavior() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 1.0), proc(201, "worker", 60.0)];

        h.analyzer.analyze();
        assert_eq!(h.analyzer.recent_impacts(0).len(), 1);

        let mut new_cfg = h.analyzer.config();
        new_cfg.proc_cpu_threshold = 70.0;
        h.analyzer.update_config(new_cfg);

        h.analyzer.analyze();
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_legacy_config_migration() {
        let cfg = ImpactConfig {
            proc_cpu_threshold: 0.0,
            process_cpu_threshold: 42.0,
            proc_disk_read_threshold: 0.0,
            proc_disk_write_threshold: 0.0,
            process_disk_io_threshold: 25.0,
            // Modern field set: legacy must lose.
            proc_memory_threshold: 512.0,
            process_memory_threshold: 9999.0,
            ..ImpactConfig::default()
        };
        let normalized = ImpactAnalyzer::normalized(cfg);
        assert_eq!(normalized.proc_cpu_threshold, 42.0);
        assert_eq!(normalized.proc_disk_read_threshold, 25.0);
        assert_eq!(normalized.proc_disk_write_threshold, 25.0);
        assert_eq!(normalized.proc_memory_threshold, 512.0);
    }

    #[test]
    fn test_summary_shape() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        *h.procs.lock() = vec![proc(100, "guarded", 1.0), proc(201, "churner", 120.0)];

        h.analyzer.analyze();
        let summary = h.analyzer.summary();
        assert_eq!(summary["total"], 1);
        assert_eq!(summary["by_type"]["cpu"], 1);
        assert_eq!(summary["by_severity"]["critical"], 1);
        assert_eq!(summary["by_target"]["guarded"], 1);
    }

    #[test]
    fn test_missing_target_process_skips_target() {
        let mut cfg = base_cfg();
        cfg.proc_cpu_threshold = 50.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        // Target absent from the snapshot: the tick must not panic and must
        // not attribute anything.
        *h.procs.lock() = vec![proc(201, "churner", 99.0)];

        h.analyzer.analyze();
        assert!(h.analyzer.recent_impacts(0).is_empty());
    }

    #[test]
    fn test_recent_impacts_oldest_first_and_capped() {
        let mut cfg = base_cfg();
        cfg.proc_fds_threshold = 10.0;
        let h = harness(cfg, Scripted::empty());
        *h.targets.lock() = vec![target(100, "guarded")];
        let mut offenders = vec![proc(100, "guarded", 0.0)];
        for pid in 200..205 {
            let mut p = proc(pid, &format!("hog{pid}"), 0.0);
            p.num_fds = 100;
            offenders.push(p);
        }
        *h.procs.lock() = offenders;

        h.analyzer.analyze();
        let all = h.analyzer.recent_impacts(0);
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let capped = h.analyzer.recent_impacts(2);
        assert_eq!(capped.len(), 2);
        assert_eq!(
            capped.last().unwrap().timestamp,
            all.last().unwrap().timestamp
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
