//! # Configuration — JSON file load/save with defaults
//!
//! A missing file means defaults; unknown keys are rejected so typos in a
//! hand-edited config surface at startup rather than silently disabling a
//! check. Saves are pretty-printed with two-space indentation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::{WardenError, WardenResult};
use crate::types::{ImpactConfig, MonitorTarget};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub targets: Vec<MonitorTarget>,
    pub sampling: SamplingConfig,
    pub impact: ImpactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub dir: String,
    /// trace, debug, info, warn, error.
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub events_to_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".into(),
            level: "info".into(),
            console_output: true,
            file_output: true,
            events_to_console: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    pub interval_seconds: u64,
    pub metrics_buffer_len: usize,
    pub events_buffer_len: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            metrics_buffer_len: 300,
            events_buffer_len: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            targets: Vec::new(),
            sampling: SamplingConfig::default(),
            impact: ImpactConfig::default(),
        }
    }
}

impl Config {
    /// Loads from `path`; a missing file yields the defaults, a malformed
    /// or unknown-keyed file is an error.
    pub fn load(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| WardenError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Pretty-printed two-space JSON, newline-terminated.
    pub fn save(&self, path: impl AsRef<Path>) -> WardenResult<()> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Writes a starter config with two placeholder targets; `pid: 0` means
    /// resolve-by-name at startup.
    pub fn generate_example(path: impl AsRef<Path>) -> WardenResult<()> {
        let mut cfg = Self::default();
        cfg.targets = vec![
            MonitorTarget {
                pid: 0,
                name: "nginx".into(),
                alias: "web frontend".into(),
                watch_ports: vec![80, 443],
                ..Default::default()
            },
            MonitorTarget {
                pid: 0,
                name: "mysqld".into(),
                alias: "database".into(),
                watch_ports: vec![3306],
                watch_files: vec!["/etc/mysql/my.cnf".into()],
                ..Default::default()
            },
        ];
        cfg.save(path)
    }
}

// ── Dynamic impact-threshold keys ────────────────────────────────────────────

/// Value shape of a settable impact key. The `config set <key> <value>`
/// surface is stringly typed at the edge; this schema validates type and
/// range at the boundary so the analyzer only ever sees typed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpactKeyKind {
    /// true/false.
    Bool,
    /// Whole seconds, 1..=3600.
    Seconds,
    /// Positive count, 1..=1000.
    Count,
    /// System percentage, 0 < v <= 100.
    Percent,
    /// Per-process threshold (percent, MB, MB/s, or count depending on the
    /// key) or system MB/s rate; non-negative, zero disables the check.
    Threshold,
}

const IMPACT_KEYS: &[(&str, ImpactKeyKind)] = &[
    ("enabled", ImpactKeyKind::Bool),
    ("analysis_interval", ImpactKeyKind::Seconds),
    ("port_check_interval", ImpactKeyKind::Seconds),
    ("file_check_interval", ImpactKeyKind::Seconds),
    ("top_n_processes", ImpactKeyKind::Count),
    ("cpu_threshold", ImpactKeyKind::Percent),
    ("memory_threshold", ImpactKeyKind::Percent),
    ("disk_io_threshold", ImpactKeyKind::Threshold),
    ("network_threshold", ImpactKeyKind::Threshold),
    ("proc_cpu_threshold", ImpactKeyKind::Threshold),
    ("proc_memory_threshold", ImpactKeyKind::Threshold),
    ("proc_mem_growth_threshold", ImpactKeyKind::Threshold),
    ("proc_vms_threshold", ImpactKeyKind::Threshold),
    ("proc_fds_threshold", ImpactKeyKind::Threshold),
    ("proc_threads_threshold", ImpactKeyKind::Threshold),
    ("proc_open_files_threshold", ImpactKeyKind::Threshold),
    ("proc_disk_read_threshold", ImpactKeyKind::Threshold),
    ("proc_disk_write_threshold", ImpactKeyKind::Threshold),
    ("proc_net_recv_threshold", ImpactKeyKind::Threshold),
    ("proc_net_send_threshold", ImpactKeyKind::Threshold),
];

/// Every settable impact key with its value kind, for help output.
pub fn impact_keys() -> &'static [(&'static str, ImpactKeyKind)] {
    IMPACT_KEYS
}

/// Parses and applies one `key=value` pair onto an [`ImpactConfig`].
/// Unknown keys, malformed values, and out-of-range values are all
/// validation errors; the config is untouched on failure.
pub fn set_impact_key(cfg: &mut ImpactConfig, key: &str, value: &str) -> WardenResult<()> {
    let kind = IMPACT_KEYS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| WardenError::Validation(format!("unknown impact config key: {key}")))?;

    let parse_f64 = |value: &str| -> WardenResult<f64> {
        value
            .parse::<f64>()
            .map_err(|_| WardenError::Validation(format!("{key}: not a number: {value}")))
    };

    match kind {
        ImpactKeyKind::Bool => {
            let parsed = match value {
                "true" | "on" | "1" => true,
                "false" | "off" | "0" => false,
                _ => {
                    return Err(WardenError::Validation(format!(
                        "{key}: expected true/false, got {value}"
                    )))
                }
            };
            cfg.enabled = parsed;
        }
        ImpactKeyKind::Seconds => {
            let parsed: u64 = value
                .parse()
                .map_err(|_| WardenError::Validation(format!("{key}: not an integer: {value}")))?;
            if !(1..=3600).contains(&parsed) {
                return Err(WardenError::Validation(format!(
                    "{key}: must be between 1 and 3600 seconds"
                )));
            }
            match key {
                "analysis_interval" => cfg.analysis_interval = parsed,
                "port_check_interval" => cfg.port_check_interval = parsed,
                _ => cfg.file_check_interval = parsed,
            }
        }
        ImpactKeyKind::Count => {
            let parsed: usize = value
                .parse()
                .map_err(|_| WardenError::Validation(format!("{key}: not an integer: {value}")))?;
            if !(1..=1000).contains(&parsed) {
                return Err(WardenError::Validation(format!(
                    "{key}: must be between 1 and 1000"
                )));
            }
            cfg.top_n_processes = parsed;
        }
        ImpactKeyKind::Percent => {
            let parsed = parse_f64(value)?;
            if !(parsed > 0.0 && parsed <= 100.0) {
                return Err(WardenError::Validation(format!(
                    "{key}: must be within (0, 100]"
                )));
            }
            match key {
                "cpu_threshold" => cfg.cpu_threshold = parsed,
                _ => cfg.memory_threshold = parsed,
            }
        }
        ImpactKeyKind::Threshold => {
            let parsed = parse_f64(value)?;
            if parsed < 0.0 || !parsed.is_finite() {
                return Err(WardenError::Validation(format!(
                    "{key}: must be a non-negative number"
                )));
            }
            match key {
                "disk_io_threshold" => cfg.disk_io_threshold = parsed,
                "network_threshold" => cfg.network_threshold = parsed,
                "proc_cpu_threshold" => cfg.proc_cpu_threshold = parsed,
                "proc_memory_threshold" => cfg.proc_memory_threshold = parsed,
                "proc_mem_growth_threshold" => cfg.proc_mem_growth_threshold = parsed,
                "proc_vms_threshold" => cfg.proc_vms_threshold = parsed,
                "proc_fds_threshold" => cfg.proc_fds_threshold = parsed,
                "proc_threads_threshold" => cfg.proc_threads_threshold = parsed,
                "proc_open_files_threshold" => cfg.proc_open_files_threshold = parsed,
                "proc_disk_read_threshold" => cfg.proc_disk_read_threshold = parsed,
                "proc_disk_write_threshold" => cfg.proc_disk_write_threshold = parsed,
                "proc_net_recv_threshold" => cfg.proc_net_recv_threshold = parsed,
                _ => cfg.proc_net_send_threshold = parsed,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.sampling.interval_seconds, 1);
        assert!(cfg.targets.is_empty());
        assert_eq!(cfg.impact.cpu_threshold, 80.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");

        let mut cfg = Config::default();
        cfg.server.addr = "127.0.0.1:9900".into();
        cfg.sampling.interval_seconds = 5;
        cfg.impact.proc_cpu_threshold = 65.0;
        cfg.targets.push(MonitorTarget {
            pid: 4242,
            name: "scada".into(),
            alias: "plant controller".into(),
            watch_ports: vec![502],
            ..Default::default()
        });
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.addr, "127.0.0.1:9900");
        assert_eq!(loaded.sampling.interval_seconds, 5);
        assert_eq!(loaded.impact.proc_cpu_threshold, 65.0);
        assert_eq!(loaded.targets, cfg.targets);
    }

    #[test]
    fn test_partial_file_backfills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"server": {"addr": "127.0.0.1:7000"}}"#).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.addr, "127.0.0.1:7000");
        assert!(cfg.server.enabled);
        assert_eq!(cfg.logging.dir, "./logs");
        assert_eq!(cfg.sampling.metrics_buffer_len, 300);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.json");
        std::fs::write(&path, r#"{"samplnig": {"interval_seconds": 2}}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_pretty_two_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fmt.json");
        Config::default().save(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\n  \"server\""));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_generate_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.json");
        Config::generate_example(&path).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.targets.len(), 2);
        assert_eq!(cfg.targets[0].pid, 0);
        assert!(!cfg.targets[0].watch_ports.is_empty());
    }

    #[test]
    fn test_set_impact_key_typed_values() {
        let mut cfg = ImpactConfig::default();
        set_impact_key(&mut cfg, "enabled", "off").unwrap();
        assert!(!cfg.enabled);
        set_impact_key(&mut cfg, "analysis_interval", "15").unwrap();
        assert_eq!(cfg.analysis_interval, 15);
        set_impact_key(&mut cfg, "cpu_threshold", "92.5").unwrap();
        assert_eq!(cfg.cpu_threshold, 92.5);
        set_impact_key(&mut cfg, "proc_cpu_threshold", "0").unwrap();
        assert_eq!(cfg.proc_cpu_threshold, 0.0); // zero disables
        set_impact_key(&mut cfg, "top_n_processes", "20").unwrap();
        assert_eq!(cfg.top_n_processes, 20);
    }

    #[test]
    fn test_set_impact_key_rejects_bad_input() {
        let mut cfg = ImpactConfig::default();
        let before = cfg.clone();

        assert!(set_impact_key(&mut cfg, "not_a_key", "1").is_err());
        assert!(set_impact_key(&mut cfg, "cpu_threshold", "150").is_err());
        assert!(set_impact_key(&mut cfg, "cpu_threshold", "0").is_err());
        assert!(set_impact_key(&mut cfg, "analysis_interval", "0").is_err());
        assert!(set_impact_key(&mut cfg, "analysis_interval", "9000").is_err());
        assert!(set_impact_key(&mut cfg, "proc_memory_threshold", "-5").is_err());
        assert!(set_impact_key(&mut cfg, "proc_memory_threshold", "lots").is_err());
        assert!(set_impact_key(&mut cfg, "enabled", "maybe").is_err());

        // Failed sets leave the config untouched.
        assert_eq!(cfg.cpu_threshold, before.cpu_threshold);
        assert_eq!(cfg.analysis_interval, before.analysis_interval);
        assert!(cfg.enabled);
    }

    #[test]
    fn test_impact_keys_cover_every_threshold() {
        let keys = impact_keys();
        assert!(keys.len() >= 20);
        // Every listed key must be settable against a default config.
        let mut cfg = ImpactConfig::default();
        for (key, kind) in keys {
            let value = match kind {
                ImpactKeyKind::Bool => "true",
                ImpactKeyKind::Seconds => "30",
                ImpactKeyKind::Count => "10",
                ImpactKeyKind::Percent => "80",
                ImpactKeyKind::Threshold => "50",
            };
            set_impact_key(&mut cfg, key, value)
                .unwrap_or_else(|e| panic!("{key}: {e}"));
        }
    }
}
