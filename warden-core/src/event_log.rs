//! # Event Log — append-only JSONL record sink
//!
//! Every durable record the agent produces — service lifecycle, target
//! events, impact findings, metric dumps — goes through this sink as one
//! JSON object per line in `monitor_YYYYMMDD_HHMMSS.jsonl`. Writes are
//! serialized under a single mutex; a failed write is swallowed so a full
//! disk never takes the agent down, and `reopen` starts a fresh file for
//! rotation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::WardenResult;

pub const LEVEL_INFO: &str = "INFO";
pub const LEVEL_WARN: &str = "WARN";
pub const LEVEL_ERROR: &str = "ERROR";
pub const LEVEL_DEBUG: &str = "DEBUG";

pub const CAT_SERVICE: &str = "SERVICE";
pub const CAT_EVENT: &str = "EVENT";
pub const CAT_IMPACT: &str = "IMPACT";
pub const CAT_METRIC: &str = "METRIC";
pub const CAT_LOG: &str = "LOG";

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    timestamp: DateTime<Utc>,
    level: &'a str,
    category: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Reduced record shape used for metric dumps.
#[derive(Debug, Serialize)]
struct DataRecord<'a> {
    timestamp: DateTime<Utc>,
    category: &'a str,
    data: serde_json::Value,
}

struct Sink {
    file: Option<File>,
}

/// JSONL log sink with an optional console tee.
pub struct EventLog {
    dir: PathBuf,
    sink: Mutex<Sink>,
    console: bool,
    file_output: bool,
}

impl EventLog {
    /// Opens a fresh timestamped log file under `dir` (created if missing).
    pub fn new(dir: impl AsRef<Path>, file_output: bool, console: bool) -> WardenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file = if file_output {
            Some(Self::open_file(&dir)?)
        } else {
            None
        };
        Ok(Self {
            dir,
            sink: Mutex::new(Sink { file }),
            console,
            file_output,
        })
    }

    fn open_file(dir: &Path) -> std::io::Result<File> {
        let name = format!("monitor_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
    }

    /// Closes the current file and opens a fresh one (rotation hook).
    pub fn reopen(&self) -> WardenResult<()> {
        if !self.file_output {
            return Ok(());
        }
        let file = Self::open_file(&self.dir)?;
        self.sink.lock().file = Some(file);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one record. File errors are swallowed: the sink remains
    /// usable and a later `reopen` is expected to recover.
    pub fn log(&self, level: &str, category: &str, message: &str, data: Option<serde_json::Value>) {
        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            category,
            message,
            data,
        };

        let mut sink = self.sink.lock();
        if let Some(file) = sink.file.as_mut() {
            if let Ok(mut line) = serde_json::to_vec(&record) {
                line.push(b'\n');
                let _ = file.write_all(&line);
            }
        }
        if self.console {
            println!(
                "{} [{}] [{}] {}",
                record.timestamp.format("%Y/%m/%d %H:%M:%S"),
                level,
                category,
                message
            );
        }
    }

    /// Writes a `{timestamp, category, data}` record (no level/message).
    pub fn log_data(&self, category: &str, data: serde_json::Value) {
        let record = DataRecord {
            timestamp: Utc::now(),
            category,
            data,
        };
        let mut sink = self.sink.lock();
        if let Some(file) = sink.file.as_mut() {
            if let Ok(mut line) = serde_json::to_vec(&record) {
                line.push(b'\n');
                let _ = file.write_all(&line);
            }
        }
    }

    pub fn info(&self, category: &str, message: &str) {
        self.log(LEVEL_INFO, category, message, None);
    }

    pub fn warn(&self, category: &str, message: &str) {
        self.log(LEVEL_WARN, category, message, None);
    }

    pub fn error(&self, category: &str, message: &str) {
        self.log(LEVEL_ERROR, category, message, None);
    }

    /// Target / tracker event record.
    pub fn event(&self, kind: &str, pid: i32, name: &str, message: &str) {
        self.log(
            LEVEL_INFO,
            CAT_EVENT,
            &format!("{kind}: {message} (pid={pid}, name={name})"),
            Some(serde_json::json!({
                "event_type": kind,
                "pid": pid,
                "name": name,
            })),
        );
    }

    /// Impact finding record.
    pub fn impact(&self, impact_type: &str, severity: &str, target: &str, source: &str, detail: &str) {
        self.log(
            LEVEL_INFO,
            CAT_IMPACT,
            &format!("[{impact_type}] [{severity}] target: {target}, source: {source} - {detail}"),
            Some(serde_json::json!({
                "impact_type": impact_type,
                "severity": severity,
                "target": target,
                "source": source,
            })),
        );
    }

    /// Metric dump using the reduced record shape.
    pub fn metric(&self, data: impl Serialize) {
        if let Ok(value) = serde_json::to_value(data) {
            self.log_data(CAT_METRIC, value);
        }
    }
}

/// Adapts the sink to `std::io::Write` so byte-stream producers can be
/// pointed at it; each flush becomes one `INFO`/`LOG` record with the
/// trailing newline stripped.
pub struct EventLogWriter {
    log: std::sync::Arc<EventLog>,
}

impl EventLogWriter {
    pub fn new(log: std::sync::Arc<EventLog>) -> Self {
        Self { log }
    }
}

impl Write for EventLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut msg = String::from_utf8_lossy(buf).into_owned();
        if msg.ends_with('\n') {
            msg.pop();
        }
        self.log.info(CAT_LOG, &msg);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
