//! # Warden Core — host telemetry agent subsystems
//!
//! Warden continuously samples OS processes, attributes per-process network
//! traffic via packet capture, detects process state transitions, and
//! correlates system-wide resource pressure with the specific offender
//! processes that may impact a set of *guarded* targets. This crate holds
//! everything but the binary: the platform process source, the traffic
//! attributor, the sampling aggregator, the target monitor, the conflict
//! checkers, the impact analyzer, the JSONL event log, configuration, and
//! the HTTP API.

pub mod config;
pub mod error;
pub mod event_log;
pub mod file_check;
pub mod impact;
pub mod monitor;
pub mod port_check;
pub mod proc_source;
pub mod ring;
pub mod sampler;
pub mod server;
pub mod tracker;
pub mod traffic;
pub mod types;

pub use config::Config;
pub use error::{WardenError, WardenResult};
pub use event_log::EventLog;
pub use impact::ImpactAnalyzer;
pub use monitor::TargetMonitor;
pub use proc_source::{platform_source, ProcessSource};
pub use sampler::Sampler;
pub use traffic::TrafficMonitor;
