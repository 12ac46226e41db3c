//! # Traffic attributor — per-process network accounting
//!
//! Assigns network bytes to the local process that sent or received them.
//! The preferred implementation captures raw frames on every non-loopback
//! interface via pnet and joins transport ports against a `port → PID` map
//! rebuilt every 2 s from the OS connection table. Where capture cannot be
//! opened (no privilege, no suitable device) the monitor degrades to a
//! stats-only mode: interface aggregate counters feed the system row and
//! the per-process split is proportional to live connection counts — an
//! approximation, callers must not assume per-packet granularity there.
//!
//! Invariant: the system byte totals equal the sum of the per-process bytes
//! credited since startup — both counters are bumped by the same packet in
//! the same critical section.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::proc_source::ProcessSource;

const PORT_MAP_REFRESH: Duration = Duration::from_secs(2);
const RATE_TICK: Duration = Duration::from_secs(1);
const FALLBACK_CONN_REFRESH: Duration = Duration::from_secs(3);

/// Byte totals and per-second rates for one attribution row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetStats {
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub recv_rate: f64,
    pub send_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficMode {
    /// Per-packet capture attribution.
    Capture,
    /// Interface-counter totals with connection-count proportional split.
    Fallback,
}

#[derive(Debug)]
struct Counter {
    recv_bytes: u64,
    send_bytes: u64,
    prev_recv: u64,
    prev_send: u64,
    prev_t: Instant,
    recv_rate: f64,
    send_rate: f64,
}

impl Counter {
    fn new() -> Self {
        Self {
            recv_bytes: 0,
            send_bytes: 0,
            prev_recv: 0,
            prev_send: 0,
            prev_t: Instant::now(),
            recv_rate: 0.0,
            send_rate: 0.0,
        }
    }

    fn advance(&mut self, now: Instant) {
        let dt = now.duration_since(self.prev_t).as_secs_f64();
        if dt > 0.0 {
            self.recv_rate = self.recv_bytes.saturating_sub(self.prev_recv) as f64 / dt;
            self.send_rate = self.send_bytes.saturating_sub(self.prev_send) as f64 / dt;
        }
        self.prev_recv = self.recv_bytes;
        self.prev_send = self.send_bytes;
        self.prev_t = now;
    }

    fn stats(&self) -> NetStats {
        NetStats {
            recv_bytes: self.recv_bytes,
            send_bytes: self.send_bytes,
            recv_rate: self.recv_rate,
            send_rate: self.send_rate,
        }
    }
}

pub struct TrafficMonitor {
    source: Arc<dyn ProcessSource>,
    port_map: RwLock<HashMap<u16, i32>>,
    stats: RwLock<HashMap<i32, Counter>>,
    system: RwLock<Counter>,
    conn_counts: RwLock<HashMap<i32, usize>>,
    mode: RwLock<TrafficMode>,
    running: Arc<AtomicBool>,
}

impl TrafficMonitor {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self {
            source,
            port_map: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
            system: RwLock::new(Counter::new()),
            conn_counts: RwLock::new(HashMap::new()),
            mode: RwLock::new(TrafficMode::Capture),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens capture on every usable interface and spawns the port-map and
    /// rate loops. Degrades to fallback mode when no device can be opened;
    /// individual device failures are logged and skipped.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }

        let opened = self.start_capture_threads();
        if opened == 0 {
            *self.mode.write() = TrafficMode::Fallback;
            info!("traffic attribution running in stats-only fallback mode");
            self.spawn_fallback_loops();
        } else {
            info!(devices = opened, "packet capture attribution started");
            self.spawn_capture_loops();
        }
    }

    /// Signals every loop to stop; capture threads exit at their next read
    /// timeout and their channel handles drop with them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> TrafficMode {
        *self.mode.read()
    }

    pub fn system_stats(&self) -> NetStats {
        self.system.read().stats()
    }

    pub fn pid_stats(&self, pid: i32) -> NetStats {
        self.stats
            .read()
            .get(&pid)
            .map(Counter::stats)
            .unwrap_or_default()
    }

    pub fn per_pid_stats(&self) -> HashMap<i32, NetStats> {
        self.stats
            .read()
            .iter()
            .map(|(pid, c)| (*pid, c.stats()))
            .collect()
    }

    /// Drops attribution rows for PIDs the enumerator no longer sees.
    pub fn cleanup(&self, live_pids: &HashSet<i32>) {
        self.stats.write().retain(|pid, _| live_pids.contains(pid));
    }

    // ── Capture mode ─────────────────────────────────────────────────────

    fn start_capture_threads(self: &Arc<Self>) -> usize {
        let mut opened = 0;
        for iface in pnet::datalink::interfaces() {
            if iface.is_loopback() || iface.ips.is_empty() {
                continue;
            }
            let config = pnet::datalink::Config {
                read_timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            };
            let mut rx = match pnet::datalink::channel(&iface, config) {
                Ok(pnet::datalink::Channel::Ethernet(_tx, rx)) => rx,
                Ok(_) => {
                    warn!(device = %iface.name, "unsupported channel type, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(device = %iface.name, error = %e, "capture open failed, skipping");
                    continue;
                }
            };

            opened += 1;
            let monitor = Arc::downgrade(self);
            let running = self.running.clone();
            let device = iface.name.clone();
            std::thread::spawn(move || {
                info!(device = %device, "capture loop started");
                while running.load(Ordering::Relaxed) {
                    match rx.next() {
                        Ok(frame) => {
                            let Some(monitor) = monitor.upgrade() else {
                                break;
                            };
                            if let Some((src_port, dst_port)) = parse_transport_ports(frame) {
                                monitor.credit_packet(src_port, dst_port, frame.len() as u64);
                            }
                        }
                        // Read timeouts are the shutdown poll; real errors on a
                        // live device are transient (ring overruns) either way.
                        Err(_) => continue,
                    }
                }
                info!(device = %device, "capture loop stopped");
            });
        }
        opened
    }

    fn spawn_capture_loops(self: &Arc<Self>) {
        // Port map refresher.
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PORT_MAP_REFRESH);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.refresh_port_map();
            }
        });

        // Rate computer.
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RATE_TICK);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.tick_rates(Instant::now());
            }
        });
    }

    /// Credits one packet against the port map. Both directions are
    /// evaluated independently: a local-to-local packet counts as a send
    /// for the source process and a receive for the destination process.
    fn credit_packet(&self, src_port: u16, dst_port: u16, length: u64) {
        let (sender, receiver) = {
            let map = self.port_map.read();
            (map.get(&src_port).copied(), map.get(&dst_port).copied())
        };
        if sender.is_none() && receiver.is_none() {
            return;
        }

        let mut stats = self.stats.write();
        let mut system = self.system.write();
        if let Some(pid) = sender {
            system.send_bytes += length;
            stats.entry(pid).or_insert_with(Counter::new).send_bytes += length;
        }
        if let Some(pid) = receiver {
            system.recv_bytes += length;
            stats.entry(pid).or_insert_with(Counter::new).recv_bytes += length;
        }
    }

    /// Full replacement of the port → PID map from the OS connection table.
    /// Kernel-owned rows (PID 0) are never mapped.
    fn refresh_port_map(&self) {
        let Ok(conns) = self.source.all_connections() else {
            return;
        };
        let mut map = HashMap::with_capacity(conns.len());
        for conn in conns {
            if conn.pid > 0 && conn.local_port > 0 {
                map.insert(conn.local_port, conn.pid);
            }
        }
        *self.port_map.write() = map;
    }

    fn tick_rates(&self, now: Instant) {
        self.system.write().advance(now);
        for counter in self.stats.write().values_mut() {
            counter.advance(now);
        }
    }

    // ── Fallback mode ────────────────────────────────────────────────────

    fn spawn_fallback_loops(self: &Arc<Self>) {
        // Connection-count refresher for the proportional split.
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FALLBACK_CONN_REFRESH);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.refresh_conn_counts();
            }
        });

        // Interface counter tick; owns the sysinfo network list.
        let weak = Arc::downgrade(self);
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut networks = sysinfo::Networks::new_with_refreshed_list();
            let mut prev: Option<(u64, u64)> = None;
            let mut ticker = tokio::time::interval(RATE_TICK);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                networks.refresh(true);
                let recv: u64 = networks.values().map(|n| n.total_received()).sum();
                let sent: u64 = networks.values().map(|n| n.total_transmitted()).sum();
                if let Some((prev_recv, prev_sent)) = prev {
                    monitor.apportion_fallback_delta(
                        recv.saturating_sub(prev_recv),
                        sent.saturating_sub(prev_sent),
                    );
                }
                prev = Some((recv, sent));
            }
        });
    }

    fn refresh_conn_counts(&self) {
        let Ok(conns) = self.source.all_connections() else {
            return;
        };
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for conn in conns {
            if conn.pid > 0 {
                *counts.entry(conn.pid).or_insert(0) += 1;
            }
        }
        *self.conn_counts.write() = counts;
    }

    /// Splits one tick's interface delta across processes in proportion to
    /// their connection counts, then advances everyone's rates. Processes
    /// without sockets receive nothing even if they move bytes through raw
    /// sockets — a documented limit of this mode.
    fn apportion_fallback_delta(&self, recv_delta: u64, send_delta: u64) {
        let now = Instant::now();
        let counts = self.conn_counts.read().clone();
        let total: usize = counts.values().sum();

        let mut stats = self.stats.write();
        let mut system = self.system.write();
        system.recv_bytes += recv_delta;
        system.send_bytes += send_delta;
        if total > 0 {
            for (pid, count) in &counts {
                let share = *count as f64 / total as f64;
                let entry = stats.entry(*pid).or_insert_with(Counter::new);
                entry.recv_bytes += (recv_delta as f64 * share) as u64;
                entry.send_bytes += (send_delta as f64 * share) as u64;
            }
        }
        system.advance(now);
        for counter in stats.values_mut() {
            counter.advance(now);
        }
    }
}

/// Extracts `(src_port, dst_port)` from an Ethernet frame carrying
/// IPv4/IPv6 + TCP/UDP. Anything else is dropped — the transport filter
/// lives here because datalink channels have no BPF hook.
fn parse_transport_ports(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 14 {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    let (protocol, transport_start) = match ethertype {
        // IPv4: header length from IHL.
        0x0800 => {
            if data.len() < 14 + 20 {
                return None;
            }
            let ihl = ((data[14] & 0x0F) as usize) * 4;
            if ihl < 20 {
                return None;
            }
            (data[14 + 9], 14 + ihl)
        }
        // IPv6: fixed 40-byte header, extension headers not walked.
        0x86DD => {
            if data.len() < 14 + 40 {
                return None;
            }
            (data[14 + 6], 14 + 40)
        }
        _ => return None,
    };

    // TCP or UDP only.
    if protocol != 6 && protocol != 17 {
        return None;
    }
    if data.len() < transport_start + 4 {
        return None;
    }
    let src = u16::from_be_bytes([data[transport_start], data[transport_start + 1]]);
    let dst = u16::from_be_bytes([data[transport_start + 2], data[transport_start + 3]]);
    Some((src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenResult;
    use crate::proc_source::{ConnectionEntry, RawProcess, RawSystemCounters};

    struct FixedConns(Vec<ConnectionEntry>);

    impl ProcessSource for FixedConns {
        fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
            Ok(Vec::new())
        }
        fn probe(&self, _pid: i32) -> WardenResult<RawProcess> {
            Ok(RawProcess::default())
        }
        fn is_alive(&self, _pid: i32) -> bool {
            true
        }
        fn find_pids_by_name(&self, _name: &str) -> WardenResult<Vec<i32>> {
            Ok(Vec::new())
        }
        fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
            Ok(self.0.clone())
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

    fn monitor_with_ports(entries: Vec<(i32, u16)>) -> Arc<TrafficMonitor> {
        let conns = entries
            .into_iter()
            .map(|(pid, port)| ConnectionEntry {
                pid,
                local_port: port,
                remote_port: 0,
                status: "LISTEN".into(),
            })
            .collect();
        let monitor = Arc::new(TrafficMonitor::new(Arc::new(FixedConns(conns))));
        monitor.refresh_port_map();
        monitor
    }

    #[test]
    fn test_credit_rules_both_directions() {
        let monitor = monitor_with_ports(vec![(100, 8080), (200, 9090)]);

        // 8080 -> remote: send for pid 100 only.
        monitor.credit_packet(8080, 443, 1000);
        // remote -> 9090: recv for pid 200 only.
        monitor.credit_packet(55555, 9090, 500);
        // 8080 -> 9090 local-to-local: both fire.
        monitor.credit_packet(8080, 9090, 64);

        let p100 = monitor.pid_stats(100);
        let p200 = monitor.pid_stats(200);
        assert_eq!(p100.send_bytes, 1064);
        assert_eq!(p100.recv_bytes, 0);
        assert_eq!(p200.recv_bytes, 564);
        assert_eq!(p200.send_bytes, 0);
    }

    #[test]
    fn test_system_totals_equal_per_pid_sums() {
        let monitor = monitor_with_ports(vec![(1, 80), (2, 81), (3, 82)]);
        monitor.credit_packet(80, 7, 100);
        monitor.credit_packet(7, 81, 250);
        monitor.credit_packet(80, 82, 10);
        monitor.credit_packet(9999, 9998, 5000); // unmapped, no credit

        let sys = monitor.system_stats();
        let per_pid = monitor.per_pid_stats();
        let recv_sum: u64 = per_pid.values().map(|s| s.recv_bytes).sum();
        let send_sum: u64 = per_pid.values().map(|s| s.send_bytes).sum();
        assert_eq!(sys.recv_bytes, recv_sum);
        assert_eq!(sys.send_bytes, send_sum);
        assert_eq!(sys.recv_bytes, 260);
        assert_eq!(sys.send_bytes, 110);
    }

    #[test]
    fn test_kernel_rows_never_mapped() {
        let monitor = monitor_with_ports(vec![(0, 53), (10, 8080)]);
        monitor.credit_packet(53, 12345, 400);
        assert_eq!(monitor.system_stats().send_bytes, 0);
        assert!(monitor.per_pid_stats().is_empty());
    }

    #[test]
    fn test_rate_computation_advances_baseline() {
        let monitor = monitor_with_ports(vec![(100, 8080)]);
        monitor.credit_packet(8080, 1, 4096);

        // Rewind the baselines one second to make the delta deterministic.
        let t0 = Instant::now() - Duration::from_secs(1);
        monitor.system.write().prev_t = t0;
        monitor.stats.write().get_mut(&100).unwrap().prev_t = t0;
        monitor.tick_rates(Instant::now());

        let stats = monitor.pid_stats(100);
        assert!((stats.send_rate - 4096.0).abs() < 64.0);

        // Second tick with no new bytes drives the rate back toward zero.
        let t1 = Instant::now() - Duration::from_secs(1);
        monitor.stats.write().get_mut(&100).unwrap().prev_t = t1;
        monitor.tick_rates(Instant::now());
        assert!(monitor.pid_stats(100).send_rate < 1.0);
    }

    #[test]
    fn test_cleanup_drops_dead_rows() {
        let monitor = monitor_with_ports(vec![(1, 80), (2, 81)]);
        monitor.credit_packet(80, 7, 1);
        monitor.credit_packet(81, 7, 1);
        assert_eq!(monitor.per_pid_stats().len(), 2);

        let live: HashSet<i32> = [2].into_iter().collect();
        monitor.cleanup(&live);
        let remaining = monitor.per_pid_stats();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key(&2));
    }

    #[test]
    fn test_fallback_proportional_split() {
        let monitor = monitor_with_ports(vec![]);
        *monitor.conn_counts.write() = [(10, 3), (20, 1)].into_iter().collect();
        monitor.apportion_fallback_delta(4000, 800);

        let sys = monitor.system_stats();
        assert_eq!(sys.recv_bytes, 4000);
        assert_eq!(sys.send_bytes, 800);
        assert_eq!(monitor.pid_stats(10).recv_bytes, 3000);
        assert_eq!(monitor.pid_stats(20).recv_bytes, 1000);
        assert_eq!(monitor.pid_stats(10).send_bytes, 600);
        assert_eq!(monitor.pid_stats(20).send_bytes, 200);
    }

    #[test]
    fn test_parse_transport_ports_ipv4_tcp() {
        // Minimal Ethernet + IPv4 + TCP frame.
        let mut frame = vec![0u8; 14 + 20 + 20];
        frame[12] = 0x08;
        frame[13] = 0x00; // IPv4
        frame[14] = 0x45; // version 4, IHL 5
        frame[14 + 9] = 6; // TCP
        frame[34] = 0x1F;
        frame[35] = 0x90; // src 8080
        frame[36] = 0x01;
        frame[37] = 0xBB; // dst 443
        assert_eq!(parse_transport_ports(&frame), Some((8080, 443)));

        // Non-TCP/UDP protocol is filtered.
        frame[14 + 9] = 1; // ICMP
        assert_eq!(parse_transport_ports(&frame), None);

        // Non-IP ethertype is filtered.
        frame[13] = 0x06; // ARP
        assert_eq!(parse_transport_ports(&frame), None);
    }
}
