//! # Platform process source
//!
//! Capability interface over the OS process table: enumeration with raw
//! monotonic counters, liveness probes, name lookup, socket enumeration and
//! per-process open-file tables. Consumers never compute against the OS
//! directly — the sampler, checkers, and analyzer all go through
//! [`ProcessSource`] so tests can substitute a scripted implementation.
//!
//! [`HostProcessSource`] uses `sysinfo` for the portable process table and
//! reads `/proc` directly for the counters sysinfo does not expose (CPU
//! jiffies, thread/FD counts, per-process I/O, socket inodes, system-wide
//! CPU/disk/swap counters). On non-Linux builds those supplements degrade
//! to zero values; the agent remains functional with reduced fidelity.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System, Users};

use crate::error::{WardenError, WardenResult};

// ── Raw records ──────────────────────────────────────────────────────────────

/// One process as read from the OS, counters still monotonic (no rates).
#[derive(Debug, Clone, Default)]
pub struct RawProcess {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
    pub username: String,
    pub status: String,
    /// user + system CPU time, seconds, monotonic per process.
    pub cpu_time_secs: f64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub paged_pool: u64,
    pub non_paged_pool: u64,
    pub num_threads: i32,
    pub num_fds: i32,
    pub priority: i32,
    pub nice: i32,
    /// Monotonic totals from the per-process I/O accounting.
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_read_ops: u64,
    pub disk_write_ops: u64,
    /// Process creation time, epoch milliseconds.
    pub created_at_ms: i64,
}

/// One socket as reported by the OS connection table.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub pid: i32,
    pub local_port: u16,
    pub remote_port: u16,
    /// `LISTEN`, `ESTABLISHED`, …; `NONE` for UDP sockets.
    pub status: String,
}

/// System-wide monotonic counters plus instantaneous totals.
#[derive(Debug, Clone, Default)]
pub struct RawSystemCounters {
    // CPU component times, seconds, monotonic.
    pub cpu_user: f64,
    pub cpu_nice: f64,
    pub cpu_system: f64,
    pub cpu_idle: f64,
    pub cpu_iowait: f64,
    pub cpu_irq: f64,
    pub cpu_softirq: f64,
    pub cpu_steal: f64,

    // Monotonic swap traffic, bytes.
    pub swap_in_bytes: u64,
    pub swap_out_bytes: u64,

    // Monotonic disk totals across devices.
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_read_ops: u64,
    pub disk_write_ops: u64,

    // Instantaneous.
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_available: u64,
    pub mem_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_percent: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub process_count: u32,
    pub thread_count: u32,
}

// ── Capability interface ─────────────────────────────────────────────────────

pub trait ProcessSource: Send + Sync {
    /// Enumerates every visible process. Per-PID read failures zero the
    /// affected fields; they never fail the whole enumeration.
    fn list_all(&self) -> WardenResult<Vec<RawProcess>>;

    /// Single-PID variant of `list_all`.
    fn probe(&self, pid: i32) -> WardenResult<RawProcess>;

    fn is_alive(&self, pid: i32) -> bool;

    fn find_pids_by_name(&self, name: &str) -> WardenResult<Vec<i32>>;

    /// Fails when zero or more than one process matches `name`.
    fn find_single_by_name(&self, name: &str) -> WardenResult<i32> {
        let pids = self.find_pids_by_name(name)?;
        match pids.len() {
            0 => Err(WardenError::Validation(format!("process {name} not found"))),
            1 => Ok(pids[0]),
            _ => Err(WardenError::Validation(format!(
                "multiple processes named {name}: {pids:?}, specify a pid"
            ))),
        }
    }

    /// All TCP/UDP sockets with their owning PIDs (0 = kernel-owned).
    fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>>;

    fn listening_ports(&self, pid: i32) -> Vec<u16> {
        match self.all_connections() {
            Ok(conns) => conns
                .into_iter()
                .filter(|c| c.pid == pid && c.status == "LISTEN")
                .map(|c| c.local_port)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Regular files the process holds open: absolute, forward-slash paths
    /// with special filesystems already filtered out.
    fn open_files(&self, pid: i32) -> Vec<String>;

    fn cpu_count(&self) -> usize;

    fn system_counters(&self) -> WardenResult<RawSystemCounters>;
}

// ── Path normalization (shared with the file-conflict checker) ───────────────

/// Absolute path with forward slashes, or the input when it cannot be made
/// absolute.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let abs = std::path::Path::new(path);
    let abs = if abs.is_absolute() {
        abs.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(abs))
            .unwrap_or_else(|_| abs.to_path_buf())
    };
    abs.to_string_lossy().replace('\\', "/")
}

/// Paths on pseudo-filesystems and OS-internal locations are never indexed
/// for conflict detection.
pub fn is_special_path(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    if path.starts_with("/proc/")
        || path.starts_with("/sys/")
        || path.starts_with("/dev/")
        || path.contains("socket:")
        || path.contains("pipe:")
        || path.contains("anon_inode:")
    {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    lower.contains("\\device\\")
        || lower.contains("/device/")
        || lower.contains("\\windows\\system32\\")
        || lower.contains("/windows/system32/")
        || lower.contains("\\windows\\syswow64\\")
        || lower.contains("/windows/syswow64/")
}

// ── Host implementation ──────────────────────────────────────────────────────

pub struct HostProcessSource {
    sys: Mutex<System>,
    users: Users,
    clock_ticks: u64,
    #[allow(dead_code)]
    page_size: u64,
    cpus: usize,
}

impl HostProcessSource {
    pub fn new() -> Self {
        let clock_ticks = sysconf(libc::_SC_CLK_TCK, 100);
        let page_size = sysconf(libc::_SC_PAGESIZE, 4096);
        let cpus = sysconf(libc::_SC_NPROCESSORS_ONLN, 1) as usize;
        Self {
            sys: Mutex::new(System::new_all()),
            users: Users::new_with_refreshed_list(),
            clock_ticks,
            page_size,
            cpus,
        }
    }

    fn username_of(&self, proc_: &sysinfo::Process) -> String {
        proc_
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|u| u.name().to_string())
            .unwrap_or_default()
    }

    fn raw_from(&self, pid: i32, proc_: &sysinfo::Process) -> RawProcess {
        let mut cmdline = proc_
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if cmdline.is_empty() {
            if let Some(exe) = proc_.exe() {
                cmdline = exe.to_string_lossy().replace('\\', "/");
            }
        }

        let mut raw = RawProcess {
            pid,
            name: proc_.name().to_string_lossy().into_owned(),
            cmdline,
            username: self.username_of(proc_),
            status: proc_.status().to_string(),
            rss_bytes: proc_.memory(),
            vms_bytes: proc_.virtual_memory(),
            created_at_ms: proc_.start_time() as i64 * 1000,
            ..Default::default()
        };

        self.fill_platform_fields(&mut raw);
        raw
    }

    #[cfg(target_os = "linux")]
    fn fill_platform_fields(&self, raw: &mut RawProcess) {
        if let Some(stat) = read_proc_stat(raw.pid) {
            raw.cpu_time_secs = (stat.utime + stat.stime) as f64 / self.clock_ticks as f64;
            raw.num_threads = stat.num_threads;
            raw.priority = stat.priority;
            raw.nice = stat.nice;
        }
        raw.num_fds = count_fds(raw.pid);
        if let Some(io) = read_proc_io(raw.pid) {
            raw.disk_read_bytes = io.read_bytes;
            raw.disk_write_bytes = io.write_bytes;
            raw.disk_read_ops = io.read_ops;
            raw.disk_write_ops = io.write_ops;
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn fill_platform_fields(&self, _raw: &mut RawProcess) {
        // CPU jiffies, FD/thread counts and per-process I/O accounting are
        // /proc-only; other platforms report zeros here.
    }
}

impl Default for HostProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for HostProcessSource {
    fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut out = Vec::with_capacity(sys.processes().len());
        for (pid, proc_) in sys.processes() {
            out.push(self.raw_from(pid.as_u32() as i32, proc_));
        }
        Ok(out)
    }

    fn probe(&self, pid: i32) -> WardenResult<RawProcess> {
        let sysinfo_pid = Pid::from_u32(pid as u32);
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
        match sys.process(sysinfo_pid) {
            Some(proc_) => Ok(self.raw_from(pid, proc_)),
            None => Err(WardenError::Platform(format!("process {pid} not found"))),
        }
    }

    #[cfg(target_os = "linux")]
    fn is_alive(&self, pid: i32) -> bool {
        pid > 0 && std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    fn is_alive(&self, pid: i32) -> bool {
        let sysinfo_pid = Pid::from_u32(pid as u32);
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
        sys.process(sysinfo_pid).is_some()
    }

    fn find_pids_by_name(&self, name: &str) -> WardenResult<Vec<i32>> {
        let wanted = name.trim_end_matches(".exe").to_ascii_lowercase();
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut pids: Vec<i32> = sys
            .processes()
            .iter()
            .filter(|(_, p)| {
                p.name()
                    .to_string_lossy()
                    .trim_end_matches(".exe")
                    .eq_ignore_ascii_case(&wanted)
            })
            .map(|(pid, _)| pid.as_u32() as i32)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    #[cfg(target_os = "linux")]
    fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
        Ok(linux_connections())
    }

    #[cfg(not(target_os = "linux"))]
    fn all_connections(&self) -> WardenResult<Vec<ConnectionEntry>> {
        Ok(Vec::new())
    }

    #[cfg(target_os = "linux")]
    fn open_files(&self, pid: i32) -> Vec<String> {
        let mut out = Vec::new();
        let fd_dir = format!("/proc/{pid}/fd");
        let Ok(entries) = std::fs::read_dir(&fd_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let Ok(link) = std::fs::read_link(entry.path()) else {
                continue;
            };
            let path = normalize_path(&link.to_string_lossy());
            if path.is_empty() || is_special_path(&path) {
                continue;
            }
            out.push(path);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    #[cfg(not(target_os = "linux"))]
    fn open_files(&self, _pid: i32) -> Vec<String> {
        Vec::new()
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    #[cfg(target_os = "linux")]
    fn system_counters(&self) -> WardenResult<RawSystemCounters> {
        let mut counters = RawSystemCounters::default();
        read_stat_cpu(&mut counters, self.clock_ticks)?;
        read_meminfo(&mut counters);
        read_vmstat(&mut counters, self.page_size);
        read_diskstats(&mut counters);
        read_loadavg(&mut counters);
        counters.process_count = count_proc_entries();
        Ok(counters)
    }

    #[cfg(not(target_os = "linux"))]
    fn system_counters(&self) -> WardenResult<RawSystemCounters> {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let mut counters = RawSystemCounters::default();
        counters.mem_total = sys.total_memory();
        counters.mem_available = sys.available_memory();
        counters.mem_used = counters.mem_total.saturating_sub(counters.mem_available);
        if counters.mem_total > 0 {
            counters.mem_percent = counters.mem_used as f64 / counters.mem_total as f64 * 100.0;
        }
        counters.swap_total = sys.total_swap();
        counters.swap_used = sys.used_swap();
        if counters.swap_total > 0 {
            counters.swap_percent = counters.swap_used as f64 / counters.swap_total as f64 * 100.0;
        }
        let load = System::load_average();
        counters.load_avg_1 = load.one;
        counters.load_avg_5 = load.five;
        counters.load_avg_15 = load.fifteen;
        Ok(counters)
    }
}

fn sysconf(name: libc::c_int, fallback: u64) -> u64 {
    let v = unsafe { libc::sysconf(name) };
    if v <= 0 {
        fallback
    } else {
        v as u64
    }
}

/// The host-appropriate process source.
pub fn platform_source() -> Arc<dyn ProcessSource> {
    Arc::new(HostProcessSource::new())
}

// ── Linux /proc parsing ──────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
struct ProcStat {
    utime: u64,
    stime: u64,
    num_threads: i32,
    priority: i32,
    nice: i32,
}

#[cfg(target_os = "linux")]
fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 2 (comm) may contain spaces; everything after the closing paren
    // is fixed-position.
    let rest = content.get(content.rfind(')')? + 2..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // `rest` starts at stat field 3 (state), so stat field N is fields[N-3].
    if fields.len() < 20 {
        return None;
    }
    Some(ProcStat {
        utime: fields[11].parse().unwrap_or(0),
        stime: fields[12].parse().unwrap_or(0),
        priority: fields[15].parse().unwrap_or(0),
        nice: fields[16].parse().unwrap_or(0),
        num_threads: fields[17].parse().unwrap_or(0),
    })
}

#[cfg(target_os = "linux")]
struct ProcIo {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
}

#[cfg(target_os = "linux")]
fn read_proc_io(pid: i32) -> Option<ProcIo> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/io")).ok()?;
    let mut io = ProcIo {
        read_bytes: 0,
        write_bytes: 0,
        read_ops: 0,
        write_ops: 0,
    };
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value: u64 = value.trim().parse().unwrap_or(0);
        match key {
            "read_bytes" => io.read_bytes = value,
            "write_bytes" => io.write_bytes = value,
            "syscr" => io.read_ops = value,
            "syscw" => io.write_ops = value,
            _ => {}
        }
    }
    Some(io)
}

#[cfg(target_os = "linux")]
fn count_fds(pid: i32) -> i32 {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .map(|entries| entries.count() as i32)
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn count_proc_entries() -> u32 {
    std::fs::read_dir("/proc")
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
                })
                .count() as u32
        })
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn read_stat_cpu(counters: &mut RawSystemCounters, clock_ticks: u64) -> WardenResult<()> {
    let content = std::fs::read_to_string("/proc/stat")
        .map_err(|e| WardenError::Platform(format!("/proc/stat: {e}")))?;
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| WardenError::Platform("/proc/stat has no cpu line".into()))?;
    let jiffies: Vec<f64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>().unwrap_or(0) as f64 / clock_ticks as f64)
        .collect();
    let get = |i: usize| jiffies.get(i).copied().unwrap_or(0.0);
    counters.cpu_user = get(0);
    counters.cpu_nice = get(1);
    counters.cpu_system = get(2);
    counters.cpu_idle = get(3);
    counters.cpu_iowait = get(4);
    counters.cpu_irq = get(5);
    counters.cpu_softirq = get(6);
    counters.cpu_steal = get(7);
    Ok(())
}

#[cfg(target_os = "linux")]
fn read_meminfo(counters: &mut RawSystemCounters) {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return;
    };
    let kib = |key: &str| -> u64 {
        content
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };
    counters.mem_total = kib("MemTotal:");
    counters.mem_available = kib("MemAvailable:");
    counters.mem_used = counters.mem_total.saturating_sub(counters.mem_available);
    if counters.mem_total > 0 {
        counters.mem_percent = counters.mem_used as f64 / counters.mem_total as f64 * 100.0;
    }
    counters.swap_total = kib("SwapTotal:");
    let swap_free = kib("SwapFree:");
    counters.swap_used = counters.swap_total.saturating_sub(swap_free);
    if counters.swap_total > 0 {
        counters.swap_percent = counters.swap_used as f64 / counters.swap_total as f64 * 100.0;
    }
}

#[cfg(target_os = "linux")]
fn read_vmstat(counters: &mut RawSystemCounters, page_size: u64) {
    let Ok(content) = std::fs::read_to_string("/proc/vmstat") else {
        return;
    };
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("pswpin"), Some(v)) => {
                counters.swap_in_bytes = v.parse::<u64>().unwrap_or(0) * page_size;
            }
            (Some("pswpout"), Some(v)) => {
                counters.swap_out_bytes = v.parse::<u64>().unwrap_or(0) * page_size;
            }
            _ => {}
        }
    }
}

#[cfg(target_os = "linux")]
fn read_diskstats(counters: &mut RawSystemCounters) {
    let Ok(content) = std::fs::read_to_string("/proc/diskstats") else {
        return;
    };
    const SECTOR: u64 = 512;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let num = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        counters.disk_read_ops += num(3);
        counters.disk_read_bytes += num(5) * SECTOR;
        counters.disk_write_ops += num(7);
        counters.disk_write_bytes += num(9) * SECTOR;
    }
}

#[cfg(target_os = "linux")]
fn read_loadavg(counters: &mut RawSystemCounters) {
    let Ok(content) = std::fs::read_to_string("/proc/loadavg") else {
        return;
    };
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() >= 4 {
        counters.load_avg_1 = fields[0].parse().unwrap_or(0.0);
        counters.load_avg_5 = fields[1].parse().unwrap_or(0.0);
        counters.load_avg_15 = fields[2].parse().unwrap_or(0.0);
        // Fourth field is "running/total" scheduling entities.
        if let Some((_, total)) = fields[3].split_once('/') {
            counters.thread_count = total.parse().unwrap_or(0);
        }
    }
}

/// TCP state nibble from /proc/net/tcp, per include/net/tcp_states.h.
#[cfg(target_os = "linux")]
fn tcp_state_name(hex: &str) -> &'static str {
    match hex {
        "01" => "ESTABLISHED",
        "02" => "SYN_SENT",
        "03" => "SYN_RECV",
        "04" => "FIN_WAIT1",
        "05" => "FIN_WAIT2",
        "06" => "TIME_WAIT",
        "07" => "CLOSE",
        "08" => "CLOSE_WAIT",
        "09" => "LAST_ACK",
        "0A" => "LISTEN",
        "0B" => "CLOSING",
        _ => "UNKNOWN",
    }
}

#[cfg(target_os = "linux")]
fn linux_connections() -> Vec<ConnectionEntry> {
    let inode_to_pid = socket_inode_owners();
    let mut out = Vec::new();
    for (path, is_tcp) in [
        ("/proc/net/tcp", true),
        ("/proc/net/tcp6", true),
        ("/proc/net/udp", false),
        ("/proc/net/udp6", false),
    ] {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let local_port = hex_port(fields[1]);
            let remote_port = hex_port(fields[2]);
            if local_port == 0 {
                continue;
            }
            let status = if is_tcp {
                tcp_state_name(fields[3]).to_string()
            } else {
                "NONE".to_string()
            };
            let inode: u64 = fields[9].parse().unwrap_or(0);
            let pid = inode_to_pid.get(&inode).copied().unwrap_or(0);
            out.push(ConnectionEntry {
                pid,
                local_port,
                remote_port,
                status,
            });
        }
    }
    out
}

#[cfg(target_os = "linux")]
fn hex_port(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, port)| u16::from_str_radix(port, 16).ok())
        .unwrap_or(0)
}

/// Joins socket inodes to owning PIDs by walking every /proc/<pid>/fd.
#[cfg(target_os = "linux")]
fn socket_inode_owners() -> HashMap<u64, i32> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return map;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let link = link.to_string_lossy();
            if let Some(inode) = link
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            {
                map.insert(inode, pid);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_forward_slashes() {
        assert_eq!(normalize_path("/var/log/app.log"), "/var/log/app.log");
        assert!(!normalize_path("C:\\data\\file.db").contains('\\'));
    }

    #[test]
    fn test_special_path_filter() {
        assert!(is_special_path("/proc/123/maps"));
        assert!(is_special_path("/sys/kernel/debug"));
        assert!(is_special_path("/dev/null"));
        assert!(is_special_path("socket:[4242]"));
        assert!(is_special_path("pipe:[77]"));
        assert!(is_special_path("anon_inode:[eventpoll]"));
        assert!(is_special_path("C:/Windows/System32/kernel32.dll"));
        assert!(!is_special_path("/var/lib/warden/state.db"));
        assert!(!is_special_path("/home/op/data.csv"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_source_sees_self() {
        let source = HostProcessSource::new();
        let me = std::process::id() as i32;
        assert!(source.is_alive(me));
        let raw = source.probe(me).expect("probe self");
        assert_eq!(raw.pid, me);
        assert!(raw.num_threads >= 1);
        assert!(raw.num_fds >= 1);
        assert!(raw.cpu_time_secs >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_counters_monotonic_fields_present() {
        let source = HostProcessSource::new();
        let counters = source.system_counters().expect("system counters");
        assert!(counters.mem_total > 0);
        assert!(counters.cpu_user + counters.cpu_system + counters.cpu_idle > 0.0);
        assert!(counters.process_count > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_enumeration_includes_self() {
        let source = HostProcessSource::new();
        let all = source.list_all().expect("list all");
        let me = std::process::id() as i32;
        assert!(all.iter().any(|p| p.pid == me));
    }

    #[test]
    fn test_find_single_by_name_errors() {
        struct TwoProcs;
        impl ProcessSource for TwoProcs {
            fn list_all(&self) -> WardenResult<Vec<RawProcess>> {
                Ok(Vec::new())
            }
            fn probe(&self, _pid: i32) -> WardenResult<RawProcess> {
                Err(WardenError::Platform("unsupported".into()))
            }
            fn is_alive(&self, _pid: i32) -> bool {
                false
            }
            fn find_pids_by_name(&self, name: &str) -> WardenResult<Vec<i32>> {
                Ok(match name {
                    "dup" => vec![1, 2],
                    "one" => vec![7],
                    _ => vec![],
                })
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

        let s = TwoProcs;
        assert_eq!(s.find_single_by_name("one").unwrap(), 7);
        assert!(s.find_single_by_name("dup").is_err());
        assert!(s.find_single_by_name("missing").is_err());
    }
}
