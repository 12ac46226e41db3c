//! # Sampling aggregator
//!
//! Turns the raw monotonic counters of the process source into per-second
//! rates and full [`ProcessInfo`] / [`SystemMetrics`] snapshots. Holds the
//! per-PID sample state (disk I/O, RSS, CPU time) that the rate deltas are
//! computed against, a 500 ms process-list cache to absorb caller bursts,
//! and a 3 s listening-port cache.
//!
//! Rate rules: a delta shorter than 100 ms returns the previously computed
//! rate without touching the baseline (500 ms floor for RSS growth, which
//! may go negative on release). The system CPU percentages are derived from
//! component-time deltas; a non-positive total delta retains the previous
//! values.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::WardenResult;
use crate::proc_source::{ProcessSource, RawProcess, RawSystemCounters};
use crate::traffic::TrafficMonitor;
use crate::types::{ProcessInfo, ProcessMetrics, SystemMetrics};

const MIN_RATE_DELTA: f64 = 0.1;
const MIN_RSS_DELTA: f64 = 0.5;
const LIST_CACHE_TTL: Duration = Duration::from_millis(500);
const PORT_CACHE_TTL: Duration = Duration::from_secs(3);

struct IoSample {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
    t: Instant,
    last_read_rate: f64,
    last_write_rate: f64,
    last_read_ops: f64,
    last_write_ops: f64,
}

struct RssSample {
    rss: u64,
    t: Instant,
    growth_rate: f64,
}

struct CpuSample {
    cpu_secs: f64,
    t: Instant,
    last_pct: f64,
}

#[derive(Default)]
struct SystemSample {
    // Previous component totals, seconds.
    cpu_user: f64,
    cpu_nice: f64,
    cpu_system: f64,
    cpu_idle: f64,
    cpu_iowait: f64,
    cpu_irq: f64,
    cpu_softirq: f64,
    cpu_steal: f64,
    // Published percentages.
    pct_total: f64,
    pct_user: f64,
    pct_system: f64,
    pct_iowait: f64,
    pct_idle: f64,
    // Previous monotonic counters.
    swap_in: u64,
    swap_out: u64,
    disk_read_bytes: u64,
    disk_write_bytes: u64,
    disk_read_ops: u64,
    disk_write_ops: u64,
    // Published rates.
    swap_in_rate: f64,
    swap_out_rate: f64,
    disk_read_rate: f64,
    disk_write_rate: f64,
    disk_read_ops_rate: f64,
    disk_write_ops_rate: f64,
    t: Option<Instant>,
}

pub struct Sampler {
    source: Arc<dyn ProcessSource>,
    traffic: Arc<TrafficMonitor>,
    /// When set, per-process CPU percent is normalized so that 100 %
    /// represents all cores (the Windows convention); otherwise percentages
    /// are single-core relative and may exceed 100 on multithreaded
    /// processes (the POSIX convention).
    normalize_cpu_by_cores: bool,

    io_samples: Mutex<HashMap<i32, IoSample>>,
    rss_samples: Mutex<HashMap<i32, RssSample>>,
    cpu_samples: Mutex<HashMap<i32, CpuSample>>,
    system: Mutex<SystemSample>,

    list_cache: Mutex<Option<(Instant, Arc<Vec<ProcessInfo>>)>>,
    port_cache: Mutex<Option<(Instant, HashMap<i32, Vec<u16>>)>>,

    running: Arc<AtomicBool>,
}

impl Sampler {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        traffic: Arc<TrafficMonitor>,
        normalize_cpu_by_cores: bool,
    ) -> Self {
        Self {
            source,
            traffic,
            normalize_cpu_by_cores,
            io_samples: Mutex::new(HashMap::new()),
            rss_samples: Mutex::new(HashMap::new()),
            cpu_samples: Mutex::new(HashMap::new()),
            system: Mutex::new(SystemSample::default()),
            list_cache: Mutex::new(None),
            port_cache: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn source(&self) -> &Arc<dyn ProcessSource> {
        &self.source
    }

    pub fn traffic(&self) -> &Arc<TrafficMonitor> {
        &self.traffic
    }

    /// Spawns the 1 Hz system-counter tick.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(sampler) = weak.upgrade() else { break };
                if let Err(e) = sampler.collect_system_sample() {
                    warn!(error = %e, "system counter sample failed");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    // ── System metrics ───────────────────────────────────────────────────

    fn collect_system_sample(&self) -> WardenResult<()> {
        let counters = self.source.system_counters()?;
        let now = Instant::now();
        let mut sample = self.system.lock();
        sample.update_from(&counters, now);
        Ok(())
    }

    pub fn system_metrics(&self) -> WardenResult<SystemMetrics> {
        let counters = self.source.system_counters()?;
        let net = self.traffic.system_stats();
        let sample = self.system.lock();

        Ok(SystemMetrics {
            cpu_percent: sample.pct_total,
            cpu_user: sample.pct_user,
            cpu_system: sample.pct_system,
            cpu_iowait: sample.pct_iowait,
            cpu_idle: sample.pct_idle,
            load_avg_1: counters.load_avg_1,
            load_avg_5: counters.load_avg_5,
            load_avg_15: counters.load_avg_15,
            memory_total: counters.mem_total,
            memory_used: counters.mem_used,
            memory_available: counters.mem_available,
            memory_percent: counters.mem_percent,
            swap_total: counters.swap_total,
            swap_used: counters.swap_used,
            swap_percent: counters.swap_percent,
            swap_in_rate: sample.swap_in_rate,
            swap_out_rate: sample.swap_out_rate,
            net_bytes_recv: net.recv_bytes,
            net_bytes_sent: net.send_bytes,
            net_recv_rate: net.recv_rate,
            net_send_rate: net.send_rate,
            disk_read_rate: sample.disk_read_rate,
            disk_write_rate: sample.disk_write_rate,
            disk_read_ops: sample.disk_read_ops_rate,
            disk_write_ops: sample.disk_write_ops_rate,
            process_count: counters.process_count,
            thread_count: counters.thread_count,
        })
    }

    // ── Process snapshots ────────────────────────────────────────────────

    /// Full snapshot with rates. Calls within 500 ms of the previous
    /// enumeration share its result.
    pub fn list_all_processes(&self) -> WardenResult<Arc<Vec<ProcessInfo>>> {
        if let Some((stamp, cached)) = self.list_cache.lock().as_ref() {
            if stamp.elapsed() < LIST_CACHE_TTL {
                return Ok(cached.clone());
            }
        }

        let raw = self.source.list_all()?;
        let listen_ports = self.listening_ports_by_pid();
        let net = self.traffic.per_pid_stats();

        let mut live = HashSet::with_capacity(raw.len());
        let mut out = Vec::with_capacity(raw.len());
        for proc_ in &raw {
            live.insert(proc_.pid);
            out.push(self.build_info(proc_, &listen_ports, &net));
        }

        self.gc(&live);

        let snapshot = Arc::new(out);
        *self.list_cache.lock() = Some((Instant::now(), snapshot.clone()));
        debug!(processes = snapshot.len(), "process snapshot built");
        Ok(snapshot)
    }

    /// One guarded-target sample; also feeds the shared CPU sample state so
    /// the percent is a real delta even between full enumerations.
    pub fn target_metrics(&self, pid: i32) -> WardenResult<ProcessMetrics> {
        let raw = self.source.probe(pid)?;
        let cpu_pct = self.calc_cpu_pct(pid, raw.cpu_time_secs);
        Ok(ProcessMetrics {
            timestamp: chrono::Utc::now(),
            pid,
            name: raw.name,
            cpu_pct,
            rss_bytes: raw.rss_bytes,
            alive: true,
        })
    }

    fn build_info(
        &self,
        raw: &RawProcess,
        listen_ports: &HashMap<i32, Vec<u16>>,
        net: &HashMap<i32, crate::traffic::NetStats>,
    ) -> ProcessInfo {
        let (read_rate, write_rate, read_ops, write_ops) = self.calc_disk_io(raw);
        let rss_growth_rate = self.calc_rss_growth(raw.pid, raw.rss_bytes);
        let cpu_pct = self.calc_cpu_pct(raw.pid, raw.cpu_time_secs);
        let net_stats = net.get(&raw.pid).copied().unwrap_or_default();

        let uptime = if raw.created_at_ms > 0 {
            (chrono::Utc::now().timestamp_millis() - raw.created_at_ms) / 1000
        } else {
            0
        };

        ProcessInfo {
            pid: raw.pid,
            name: raw.name.clone(),
            cpu_pct,
            rss_bytes: raw.rss_bytes,
            rss_growth_rate,
            vms: raw.vms_bytes,
            paged_pool: raw.paged_pool,
            non_paged_pool: raw.non_paged_pool,
            status: raw.status.clone(),
            username: raw.username.clone(),
            num_fds: raw.num_fds,
            num_threads: raw.num_threads,
            priority: raw.priority,
            nice: raw.nice,
            disk_io: read_rate + write_rate,
            disk_read_rate: read_rate,
            disk_write_rate: write_rate,
            disk_read_ops: read_ops,
            disk_write_ops: write_ops,
            net_recv_rate: net_stats.recv_rate,
            net_send_rate: net_stats.send_rate,
            uptime,
            created_at: raw.created_at_ms,
            cmdline: raw.cmdline.clone(),
            // FD count doubles as the open-files figure; a per-path
            // enumeration here would be far too hot for a 1 Hz path.
            open_files: raw.num_fds,
            listen_ports: listen_ports.get(&raw.pid).cloned().unwrap_or_default(),
        }
    }

    fn listening_ports_by_pid(&self) -> HashMap<i32, Vec<u16>> {
        {
            let cache = self.port_cache.lock();
            if let Some((stamp, map)) = cache.as_ref() {
                if stamp.elapsed() < PORT_CACHE_TTL {
                    return map.clone();
                }
            }
        }

        let mut map: HashMap<i32, Vec<u16>> = HashMap::new();
        if let Ok(conns) = self.source.all_connections() {
            for conn in conns {
                if conn.status == "LISTEN" && conn.pid > 0 {
                    map.entry(conn.pid).or_default().push(conn.local_port);
                }
            }
        }
        for ports in map.values_mut() {
            ports.sort_unstable();
            ports.dedup();
        }
        *self.port_cache.lock() = Some((Instant::now(), map.clone()));
        map
    }

    // ── Rate-delta state ─────────────────────────────────────────────────

    fn calc_disk_io(&self, raw: &RawProcess) -> (f64, f64, f64, f64) {
        let now = Instant::now();
        let mut samples = self.io_samples.lock();
        let Some(sample) = samples.get_mut(&raw.pid) else {
            samples.insert(
                raw.pid,
                IoSample {
                    read_bytes: raw.disk_read_bytes,
                    write_bytes: raw.disk_write_bytes,
                    read_ops: raw.disk_read_ops,
                    write_ops: raw.disk_write_ops,
                    t: now,
                    last_read_rate: 0.0,
                    last_write_rate: 0.0,
                    last_read_ops: 0.0,
                    last_write_ops: 0.0,
                },
            );
            return (0.0, 0.0, 0.0, 0.0);
        };

        let dt = now.duration_since(sample.t).as_secs_f64();
        if dt < MIN_RATE_DELTA {
            return (
                sample.last_read_rate,
                sample.last_write_rate,
                sample.last_read_ops,
                sample.last_write_ops,
            );
        }

        let read_rate = raw.disk_read_bytes.saturating_sub(sample.read_bytes) as f64 / dt;
        let write_rate = raw.disk_write_bytes.saturating_sub(sample.write_bytes) as f64 / dt;
        let read_ops = raw.disk_read_ops.saturating_sub(sample.read_ops) as f64 / dt;
        let write_ops = raw.disk_write_ops.saturating_sub(sample.write_ops) as f64 / dt;

        sample.read_bytes = raw.disk_read_bytes;
        sample.write_bytes = raw.disk_write_bytes;
        sample.read_ops = raw.disk_read_ops;
        sample.write_ops = raw.disk_write_ops;
        sample.t = now;
        sample.last_read_rate = read_rate;
        sample.last_write_rate = write_rate;
        sample.last_read_ops = read_ops;
        sample.last_write_ops = write_ops;

        (read_rate, write_rate, read_ops, write_ops)
    }

    fn calc_rss_growth(&self, pid: i32, rss: u64) -> f64 {
        let now = Instant::now();
        let mut samples = self.rss_samples.lock();
        let Some(sample) = samples.get_mut(&pid) else {
            samples.insert(
                pid,
                RssSample {
                    rss,
                    t: now,
                    growth_rate: 0.0,
                },
            );
            return 0.0;
        };

        let dt = now.duration_since(sample.t).as_secs_f64();
        if dt < MIN_RSS_DELTA {
            return sample.growth_rate;
        }

        // Signed: shrinking RSS reports a negative rate.
        let growth = (rss as i64 - sample.rss as i64) as f64 / dt;
        sample.rss = rss;
        sample.t = now;
        sample.growth_rate = growth;
        growth
    }

    fn calc_cpu_pct(&self, pid: i32, cpu_secs: f64) -> f64 {
        let now = Instant::now();
        let mut samples = self.cpu_samples.lock();
        let Some(sample) = samples.get_mut(&pid) else {
            samples.insert(
                pid,
                CpuSample {
                    cpu_secs,
                    t: now,
                    last_pct: 0.0,
                },
            );
            return 0.0;
        };

        let dt = now.duration_since(sample.t).as_secs_f64();
        if dt < MIN_RATE_DELTA {
            return sample.last_pct;
        }

        let mut pct = ((cpu_secs - sample.cpu_secs).max(0.0) / dt) * 100.0;
        if self.normalize_cpu_by_cores {
            pct /= self.source.cpu_count().max(1) as f64;
        }
        sample.cpu_secs = cpu_secs;
        sample.t = now;
        sample.last_pct = pct;
        pct
    }

    /// Drops sample state for PIDs missing from the live set and forwards
    /// the set to the traffic attributor.
    fn gc(&self, live: &HashSet<i32>) {
        self.io_samples.lock().retain(|pid, _| live.contains(pid));
        self.rss_samples.lock().retain(|pid, _| live.contains(pid));
        self.cpu_samples.lock().retain(|pid, _| live.contains(pid));
        self.traffic.cleanup(live);
    }
}

impl SystemSample {
    fn update_from(&mut self, counters: &RawSystemCounters, now: Instant) {
        if let Some(prev_t) = self.t {
            let dt = now.duration_since(prev_t).as_secs_f64();
            // Sub-100ms resample: keep rates, skip the baseline update.
            if dt < MIN_RATE_DELTA {
                return;
            }

            let d_user = counters.cpu_user - self.cpu_user;
            let d_nice = counters.cpu_nice - self.cpu_nice;
            let d_system = counters.cpu_system - self.cpu_system;
            let d_idle = counters.cpu_idle - self.cpu_idle;
            let d_iowait = counters.cpu_iowait - self.cpu_iowait;
            let d_irq = counters.cpu_irq - self.cpu_irq;
            let d_softirq = counters.cpu_softirq - self.cpu_softirq;
            let d_steal = counters.cpu_steal - self.cpu_steal;
            let d_total =
                d_user + d_nice + d_system + d_idle + d_iowait + d_irq + d_softirq + d_steal;
            // A non-positive total delta (counter reset, first tick on a
            // degraded platform) keeps the previous percentages.
            if d_total > 0.0 {
                self.pct_user = d_user / d_total * 100.0;
                self.pct_system = d_system / d_total * 100.0;
                self.pct_iowait = d_iowait / d_total * 100.0;
                self.pct_idle = d_idle / d_total * 100.0;
                self.pct_total = 100.0 - self.pct_idle;
            }

            self.swap_in_rate = counters.swap_in_bytes.saturating_sub(self.swap_in) as f64 / dt;
            self.swap_out_rate = counters.swap_out_bytes.saturating_sub(self.swap_out) as f64 / dt;
            self.disk_read_rate =
                counters.disk_read_bytes.saturating_sub(self.disk_read_bytes) as f64 / dt;
            self.disk_write_rate =
                counters.disk_write_bytes.saturating_sub(self.disk_write_bytes) as f64 / dt;
            self.disk_read_ops_rate =
                counters.disk_read_ops.saturating_sub(self.disk_read_ops) as f64 / dt;
            self.disk_write_ops_rate =
                counters.disk_write_ops.saturating_sub(self.disk_write_ops) as f64 / dt;
        }

        self.cpu_user = counters.cpu_user;
        self.cpu_nice = counters.cpu_nice;
        self.cpu_system = counters.cpu_system;
        self.cpu_idle = counters.cpu_idle;
        self.cpu_iowait = counters.cpu_iowait;
        self.cpu_irq = counters.cpu_irq;
        self.cpu_softirq = counters.cpu_softirq;
        self.cpu_steal = counters.cpu_steal;
        self.swap_in = counters.swap_in_bytes;
        self.swap_out = counters.swap_out_bytes;
        self.disk_read_bytes = counters.disk_read_bytes;
        self.disk_write_bytes = counters.disk_write_bytes;
        self.disk_read_ops = counters.disk_read_ops;
        self.disk_write_ops = counters.disk_write_ops;
        self.t = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenResult;
    use crate::proc_source::{ConnectionEntry, RawSystemCounters};

    /// Scripted source: fixed process table, mutable from tests.
    struct ScriptedSource {
        procs: Mutex<Vec<RawProcess>>,
        counters: Mutex<RawSystemCounters>,
        list_calls: std::sync::atomic::AtomicUsize,
        cpus: usize,
    }

    impl ScriptedSource {
        fn new(cpus: usize) -> Self {
            Self {
                procs: Mutex::new(Vec::new()),
                counters: Mutex::new(RawSystemCounters::default()),
                list_calls: std::sync::atomic::AtomicUsize::new(0),
                cpus,
            }
        }

        fn set_proc(&self, raw: RawProcess) {
            let mut procs = self.procs.lock();
            procs.retain(|p| p.pid != raw.pid);
            procs.push(raw);
        }

        fn remove_proc(&self, pid: i32) {
            self.procs.lock().retain(|p| p.pid != pid);
        }
    }

    impl ProcessSource for ScriptedSource {
        fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.procs.lock().clone())
        }
        fn probe(&self, pid: i32) -> WardenResult<RawProcess> {
            self.procs
                .lock()
                .iter()
                .find(|p| p.pid == pid)
                .cloned()
                .ok_or_else(|| crate::error::WardenError::Platform("gone".into()))
        }
        fn is_alive(&self, pid: i32) -> bool {
            self.procs.lock().iter().any(|p| p.pid == pid)
        }
        fn find_pids_by_name(&self, name: &str) -> WardenResult<Vec<i32>> {
            Ok(self
                .procs
                .lock()
                .iter()
                .filter(|p| p.name == name)
                .map(|p| p.pid)
                .collect())
        }
        fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
            Ok(Vec::new())
        }
        fn open_files(&self, _pid: i32) -> Vec<String> {
            Vec::new()
        }
        fn cpu_count(&self) -> usize {
            self.cpus
        }
        fn system_counters(&self) -> WardenResult<RawSystemCounters> {
            Ok(self.counters.lock().clone())
        }
    }

    fn sampler_over(source: Arc<ScriptedSource>, normalize: bool) -> Sampler {
        let traffic = Arc::new(TrafficMonitor::new(source.clone()));
        Sampler::new(source, traffic, normalize)
    }

    fn proc_with_io(pid: i32, read_bytes: u64) -> RawProcess {
        RawProcess {
            pid,
            name: format!("proc{pid}"),
            disk_read_bytes: read_bytes,
            ..Default::default()
        }
    }

    fn rewind_io_baseline(sampler: &Sampler, pid: i32, by: Duration) {
        sampler.io_samples.lock().get_mut(&pid).unwrap().t -= by;
    }

    #[test]
    fn test_disk_rate_replay() {
        // Counters 0, 100, 300 at one-second spacing must yield rates
        // (first sample omitted), 100, 200.
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);

        let first = sampler.calc_disk_io(&proc_with_io(1, 0));
        assert_eq!(first, (0.0, 0.0, 0.0, 0.0));

        rewind_io_baseline(&sampler, 1, Duration::from_secs(1));
        let (rate, _, _, _) = sampler.calc_disk_io(&proc_with_io(1, 100));
        assert!((rate - 100.0).abs() < 2.0, "rate was {rate}");

        rewind_io_baseline(&sampler, 1, Duration::from_secs(1));
        let (rate, _, _, _) = sampler.calc_disk_io(&proc_with_io(1, 300));
        assert!((rate - 200.0).abs() < 4.0, "rate was {rate}");
    }

    #[test]
    fn test_sub_100ms_delta_returns_cached_rate() {
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);

        sampler.calc_disk_io(&proc_with_io(1, 0));
        rewind_io_baseline(&sampler, 1, Duration::from_secs(1));
        let (rate, _, _, _) = sampler.calc_disk_io(&proc_with_io(1, 500));
        assert!(rate > 400.0);

        // Immediate resample: cached rate, baseline untouched.
        let (again, _, _, _) = sampler.calc_disk_io(&proc_with_io(1, 99_999));
        assert_eq!(again, rate);
        assert_eq!(sampler.io_samples.lock().get(&1).unwrap().read_bytes, 500);
    }

    #[test]
    fn test_rss_growth_signed() {
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);

        assert_eq!(sampler.calc_rss_growth(5, 1_000_000), 0.0);
        sampler.rss_samples.lock().get_mut(&5).unwrap().t -= Duration::from_secs(1);
        let growth = sampler.calc_rss_growth(5, 2_000_000);
        assert!((growth - 1_000_000.0).abs() < 20_000.0);

        sampler.rss_samples.lock().get_mut(&5).unwrap().t -= Duration::from_secs(1);
        let release = sampler.calc_rss_growth(5, 500_000);
        assert!(release < 0.0, "release must be negative, got {release}");
    }

    #[test]
    fn test_cpu_policy_normalization() {
        let source = Arc::new(ScriptedSource::new(4));
        let normalized = sampler_over(source.clone(), true);
        let single_core = sampler_over(source.clone(), false);

        for sampler in [&normalized, &single_core] {
            assert_eq!(sampler.calc_cpu_pct(9, 10.0), 0.0);
            sampler.cpu_samples.lock().get_mut(&9).unwrap().t -= Duration::from_secs(1);
        }
        // One CPU-second consumed over one wall second.
        let pct_norm = normalized.calc_cpu_pct(9, 11.0);
        let pct_posix = single_core.calc_cpu_pct(9, 11.0);
        assert!((pct_norm - 25.0).abs() < 1.0, "got {pct_norm}");
        assert!((pct_posix - 100.0).abs() < 3.0, "got {pct_posix}");
    }

    #[test]
    fn test_gc_drops_vanished_pids() {
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);

        source.set_proc(proc_with_io(1, 0));
        source.set_proc(proc_with_io(2, 0));
        sampler.list_all_processes().unwrap();
        assert_eq!(sampler.io_samples.lock().len(), 2);

        source.remove_proc(2);
        // Push past the list cache TTL.
        *sampler.list_cache.lock() = None;
        sampler.list_all_processes().unwrap();
        let samples = sampler.io_samples.lock();
        assert!(samples.contains_key(&1));
        assert!(!samples.contains_key(&2));
    }

    #[test]
    fn test_list_cache_deduplicates_bursts() {
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);
        source.set_proc(proc_with_io(1, 0));

        sampler.list_all_processes().unwrap();
        sampler.list_all_processes().unwrap();
        sampler.list_all_processes().unwrap();
        assert_eq!(source.list_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_system_cpu_percentages() {
        let mut sample = SystemSample::default();
        let t0 = Instant::now();
        let mut counters = RawSystemCounters {
            cpu_user: 100.0,
            cpu_system: 50.0,
            cpu_idle: 850.0,
            ..Default::default()
        };
        sample.update_from(&counters, t0);

        // +6 user, +2 system, +12 idle over one second: total delta 20.
        counters.cpu_user = 106.0;
        counters.cpu_system = 52.0;
        counters.cpu_idle = 862.0;
        sample.update_from(&counters, t0 + Duration::from_secs(1));

        assert!((sample.pct_user - 30.0).abs() < 1e-9);
        assert!((sample.pct_system - 10.0).abs() < 1e-9);
        assert!((sample.pct_idle - 60.0).abs() < 1e-9);
        assert!((sample.pct_total - 40.0).abs() < 1e-9);

        // Zero total delta retains the previous percentages.
        sample.update_from(&counters, t0 + Duration::from_secs(2));
        assert!((sample.pct_total - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_process_info_fields_flow_through() {
        let source = Arc::new(ScriptedSource::new(1));
        let sampler = sampler_over(source.clone(), false);
        source.set_proc(RawProcess {
            pid: 7,
            name: "ctrl".into(),
            cmdline: "/usr/bin/ctrl --prod".into(),
            username: "ops".into(),
            status: "Sleeping".into(),
            rss_bytes: 42 * 1024 * 1024,
            vms_bytes: 100 * 1024 * 1024,
            num_threads: 12,
            num_fds: 33,
            ..Default::default()
        });

        let snap = sampler.list_all_processes().unwrap();
        let info = snap.iter().find(|p| p.pid == 7).unwrap();
        assert_eq!(info.name, "ctrl");
        assert_eq!(info.username, "ops");
        assert_eq!(info.num_threads, 12);
        assert_eq!(info.open_files, 33);
        assert_eq!(info.rss_bytes, 42 * 1024 * 1024);
    }
}
