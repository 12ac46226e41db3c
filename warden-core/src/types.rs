//! Shared data model for all Warden subsystems.
//!
//! Field names mirror the JSON wire format served by the HTTP API and
//! written to the JSONL event log, so everything here derives serde with
//! `snake_case` names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Process & system snapshots ───────────────────────────────────────────────

/// One OS process at sample time, with per-second rates already computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    pub cpu_pct: f64,
    pub rss_bytes: u64,
    /// Signed: negative means the process released memory.
    pub rss_growth_rate: f64,
    pub vms: u64,
    pub paged_pool: u64,
    pub non_paged_pool: u64,
    pub status: String,
    pub username: String,
    pub num_fds: i32,
    pub num_threads: i32,
    pub priority: i32,
    pub nice: i32,
    /// read + write rate, kept for older API consumers.
    pub disk_io: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub disk_read_ops: f64,
    pub disk_write_ops: f64,
    pub net_recv_rate: f64,
    pub net_send_rate: f64,
    /// Seconds since process creation.
    pub uptime: i64,
    /// Process creation time, epoch milliseconds.
    pub created_at: i64,
    pub cmdline: String,
    pub open_files: i32,
    pub listen_ports: Vec<u16>,
}

/// System-wide scalar snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub cpu_iowait: f64,
    pub cpu_idle: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_percent: f64,
    pub swap_in_rate: f64,
    pub swap_out_rate: f64,
    pub net_bytes_recv: u64,
    pub net_bytes_sent: u64,
    pub net_recv_rate: f64,
    pub net_send_rate: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub disk_read_ops: f64,
    pub disk_write_ops: f64,
    pub process_count: u32,
    pub thread_count: u32,
}

// ── Guarded targets ──────────────────────────────────────────────────────────

/// A process the operator has registered for continuous monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub pid: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmdline: String,
    /// Ports to watch for contention, in addition to auto-discovered listeners.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch_ports: Vec<u16>,
    /// File paths to watch for contention, in addition to auto-discovered open files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch_files: Vec<String>,
}

impl MonitorTarget {
    /// Alias when set, otherwise the process name.
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }
}

/// One sample of a guarded target, retained in its per-target ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub name: String,
    pub cpu_pct: f64,
    pub rss_bytes: u64,
    pub alive: bool,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Entry in the global event ring: `exit`, `new_process`, `process_gone`,
/// `impact_<type>`, `impact_resolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub pid: i32,
    pub name: String,
    pub message: String,
}

/// Kind of a tracker-observed process transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Gone,
}

/// Entry in the process tracker's ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessChange {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
}

// ── Impact analysis ──────────────────────────────────────────────────────────

/// Resource dimension or conflict kind of an impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactType {
    Cpu,
    Memory,
    MemGrowth,
    DiskIo,
    Network,
    Port,
    File,
    Fds,
    Threads,
    OpenFiles,
    Vms,
}

impl ImpactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactType::Cpu => "cpu",
            ImpactType::Memory => "memory",
            ImpactType::MemGrowth => "mem_growth",
            ImpactType::DiskIo => "disk_io",
            ImpactType::Network => "network",
            ImpactType::Port => "port",
            ImpactType::File => "file",
            ImpactType::Fds => "fds",
            ImpactType::Threads => "threads",
            ImpactType::OpenFiles => "open_files",
            ImpactType::Vms => "vms",
        }
    }
}

impl std::fmt::Display for ImpactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric bundle attached to an impact event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactMetrics {
    pub system_cpu: f64,
    pub system_memory: f64,
    pub target_cpu: f64,
    pub target_memory: u64,
    pub source_cpu: f64,
    pub source_memory: u64,
    pub source_disk_io: f64,
    pub source_net_io: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conflict_file: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub conflict_port: u16,
}

fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

/// A recorded correlation between an offender and a guarded target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactEvent {
    pub timestamp: DateTime<Utc>,
    pub target_pid: i32,
    pub target_name: String,
    pub impact_type: ImpactType,
    pub severity: Severity,
    pub source_pid: i32,
    pub source_name: String,
    pub description: String,
    pub metrics: ImpactMetrics,
    pub suggestion: String,
}

/// Composite identity of an active impact. `detail` is empty for resource
/// pressure, `port:<n>` for port conflicts, `file:<path>` for file conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImpactKey {
    pub target_pid: i32,
    pub impact_type: ImpactType,
    pub source_pid: i32,
    pub detail: String,
}

/// Impact analyzer thresholds. A zero value disables the individual check;
/// intervals and system thresholds have hard defaults applied at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImpactConfig {
    pub enabled: bool,
    /// Seconds between analysis ticks.
    pub analysis_interval: u64,
    pub top_n_processes: usize,
    pub history_len: usize,

    // System-level thresholds.
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// MB/s across all disks.
    pub disk_io_threshold: f64,
    /// MB/s across all interfaces.
    pub network_threshold: f64,

    // Per-process thresholds (0 disables).
    pub proc_cpu_threshold: f64,
    /// MB of resident memory.
    pub proc_memory_threshold: f64,
    /// MB/s of RSS growth.
    pub proc_mem_growth_threshold: f64,
    /// MB of virtual memory.
    pub proc_vms_threshold: f64,
    pub proc_fds_threshold: f64,
    pub proc_threads_threshold: f64,
    pub proc_open_files_threshold: f64,
    pub proc_disk_read_threshold: f64,
    pub proc_disk_write_threshold: f64,
    pub proc_net_recv_threshold: f64,
    pub proc_net_send_threshold: f64,

    // Conflict check cadences, seconds.
    pub file_check_interval: u64,
    pub port_check_interval: u64,

    // Legacy single-value fields from older config files. Applied only when
    // the corresponding modern field is zero (modern wins).
    #[serde(skip_serializing_if = "is_zero")]
    pub process_cpu_threshold: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub process_memory_threshold: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub process_disk_io_threshold: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub process_network_threshold: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_interval: 5,
            top_n_processes: 10,
            history_len: 100,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_io_threshold: 100.0,
            network_threshold: 100.0,
            proc_cpu_threshold: 50.0,
            proc_memory_threshold: 1000.0,
            proc_mem_growth_threshold: 10.0,
            proc_vms_threshold: 0.0,
            proc_fds_threshold: 1000.0,
            proc_threads_threshold: 500.0,
            proc_open_files_threshold: 500.0,
            proc_disk_read_threshold: 50.0,
            proc_disk_write_threshold: 50.0,
            proc_net_recv_threshold: 50.0,
            proc_net_send_threshold: 50.0,
            file_check_interval: 30,
            port_check_interval: 30,
            process_cpu_threshold: 0.0,
            process_memory_threshold: 0.0,
            process_disk_io_threshold: 0.0,
            process_network_threshold: 0.0,
        }
    }
}
