//! Query subcommands: thin HTTP clients against a running agent, with
//! column-formatted console output.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use reqwest::Client;
use std::collections::HashMap;

use warden_core::config::set_impact_key;
use warden_core::types::{
    Event, ImpactConfig, ImpactEvent, MonitorTarget, ProcessChange, ProcessInfo, ProcessMetrics,
    Severity, SystemMetrics,
};

pub struct Api {
    client: Client,
    base: String,
}

impl Api {
    pub fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("is the agent running? GET {url}"))?;
        if !response.status().is_success() {
            bail!("GET {url}: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("is the agent running? POST {url}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail: serde_json::Value = response.json().await.unwrap_or_default();
            bail!(
                "POST {url}: {status} {}",
                detail["error"].as_str().unwrap_or("")
            );
        }
        Ok(())
    }
}

// ── Formatting helpers ───────────────────────────────────────────────────

fn human_bytes(bytes: u64) -> String {
    const UNIT: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes < UNIT {
        return format!("{bytes:.0} B");
    }
    let exp = (bytes.ln() / UNIT.ln()).floor() as usize;
    let exp = exp.min(6);
    const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
    format!("{:.1} {}", bytes / UNIT.powi(exp as i32), UNITS[exp - 1])
}

fn human_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes(bytes_per_sec.max(0.0) as u64))
}

fn severity_colored(severity: Severity) -> colored::ColoredString {
    let text = severity.as_str().to_uppercase();
    match severity {
        Severity::Critical => text.red().bold(),
        Severity::High => text.yellow().bold(),
        Severity::Medium => text.yellow(),
        Severity::Low => text.dimmed(),
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────

pub async fn processes(api: &Api, sort: &str, n: usize) -> Result<()> {
    let mut procs: Vec<ProcessInfo> = api.get("/api/processes").await?;
    match sort {
        "memory" => procs.sort_by(|a, b| b.rss_bytes.cmp(&a.rss_bytes)),
        "disk" => procs.sort_by(|a, b| {
            (b.disk_read_rate + b.disk_write_rate)
                .total_cmp(&(a.disk_read_rate + a.disk_write_rate))
        }),
        "network" => procs.sort_by(|a, b| {
            (b.net_recv_rate + b.net_send_rate).total_cmp(&(a.net_recv_rate + a.net_send_rate))
        }),
        _ => procs.sort_by(|a, b| b.cpu_pct.total_cmp(&a.cpu_pct)),
    }
    procs.truncate(n);

    println!(
        "{:<8} {:<22} {:>6} {:>10} {:>12} {:>12} {:>8} {:>8} NAME",
        "PID", "USER", "CPU%", "RSS", "DISK", "NET", "FDS", "THREADS"
    );
    for p in &procs {
        println!(
            "{:<8} {:<22} {:>6.1} {:>10} {:>12} {:>12} {:>8} {:>8} {}",
            p.pid,
            truncate(&p.username, 22),
            p.cpu_pct,
            human_bytes(p.rss_bytes),
            human_rate(p.disk_read_rate + p.disk_write_rate),
            human_rate(p.net_recv_rate + p.net_send_rate),
            p.num_fds,
            p.num_threads,
            p.name,
        );
    }
    Ok(())
}

pub async fn system(api: &Api) -> Result<()> {
    let sys: SystemMetrics = api.get("/api/system").await?;
    println!(
        "cpu      total {:>5.1}%  user {:>5.1}%  system {:>5.1}%  iowait {:>5.1}%  idle {:>5.1}%",
        sys.cpu_percent, sys.cpu_user, sys.cpu_system, sys.cpu_iowait, sys.cpu_idle
    );
    println!(
        "load     {:.2} / {:.2} / {:.2}",
        sys.load_avg_1, sys.load_avg_5, sys.load_avg_15
    );
    println!(
        "memory   {} used of {} ({:.1}%), {} available",
        human_bytes(sys.memory_used),
        human_bytes(sys.memory_total),
        sys.memory_percent,
        human_bytes(sys.memory_available)
    );
    println!(
        "swap     {} used of {} ({:.1}%), in {} out {}",
        human_bytes(sys.swap_used),
        human_bytes(sys.swap_total),
        sys.swap_percent,
        human_rate(sys.swap_in_rate),
        human_rate(sys.swap_out_rate)
    );
    println!(
        "disk     read {} ({:.0} ops/s)  write {} ({:.0} ops/s)",
        human_rate(sys.disk_read_rate),
        sys.disk_read_ops,
        human_rate(sys.disk_write_rate),
        sys.disk_write_ops
    );
    println!(
        "network  recv {}  sent {}  (totals {} / {})",
        human_rate(sys.net_recv_rate),
        human_rate(sys.net_send_rate),
        human_bytes(sys.net_bytes_recv),
        human_bytes(sys.net_bytes_sent)
    );
    println!(
        "tasks    {} processes, {} threads",
        sys.process_count, sys.thread_count
    );
    Ok(())
}

pub async fn targets(api: &Api) -> Result<()> {
    let targets: Vec<MonitorTarget> = api.get("/api/monitor/targets").await?;
    if targets.is_empty() {
        println!("no guarded targets");
        return Ok(());
    }
    let latest: HashMap<i32, ProcessMetrics> =
        api.get("/api/metrics/latest").await.unwrap_or_default();

    println!(
        "{:<8} {:<20} {:<20} {:>6} {:>10} {:<6} WATCH",
        "PID", "NAME", "ALIAS", "CPU%", "RSS", "ALIVE"
    );
    for t in &targets {
        let (cpu, rss, alive) = latest
            .get(&t.pid)
            .map(|m| (m.cpu_pct, m.rss_bytes, m.alive))
            .unwrap_or((0.0, 0, false));
        let mut watch = Vec::new();
        if !t.watch_ports.is_empty() {
            watch.push(format!("ports {:?}", t.watch_ports));
        }
        if !t.watch_files.is_empty() {
            watch.push(format!("{} files", t.watch_files.len()));
        }
        println!(
            "{:<8} {:<20} {:<20} {:>6.1} {:>10} {:<6} {}",
            t.pid,
            truncate(&t.name, 20),
            truncate(&t.alias, 20),
            cpu,
            human_bytes(rss),
            alive,
            watch.join(", "),
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn add_target(
    api: &Api,
    pid: i32,
    name: &str,
    alias: &str,
    ports: &[u16],
    files: &[String],
) -> Result<()> {
    api.post(
        "/api/monitor/add",
        serde_json::json!({
            "pid": pid,
            "name": name,
            "alias": alias,
            "watch_ports": ports,
            "watch_files": files,
        }),
    )
    .await?;
    println!("target {pid} added");
    Ok(())
}

pub async fn remove_target(api: &Api, pid: i32) -> Result<()> {
    api.post("/api/monitor/remove", serde_json::json!({ "pid": pid }))
        .await?;
    println!("target {pid} removed");
    Ok(())
}

pub async fn events(api: &Api, n: usize) -> Result<()> {
    let events: Vec<Event> = api.get(&format!("/api/events?n={n}")).await?;
    if events.is_empty() {
        println!("no events");
        return Ok(());
    }
    for e in &events {
        println!(
            "{} {:<16} pid={:<7} {}",
            e.timestamp.format("%H:%M:%S"),
            e.kind,
            e.pid,
            e.message
        );
    }
    Ok(())
}

pub async fn changes(api: &Api, n: usize) -> Result<()> {
    let changes: Vec<ProcessChange> = api.get(&format!("/api/process-changes?n={n}")).await?;
    if changes.is_empty() {
        println!("no process changes");
        return Ok(());
    }
    for c in &changes {
        let kind = serde_json::to_value(c.kind)?;
        println!(
            "{} {:<5} pid={:<7} {} {}",
            c.timestamp.format("%H:%M:%S"),
            kind.as_str().unwrap_or("?"),
            c.pid,
            c.name,
            c.cmdline.dimmed()
        );
    }
    Ok(())
}

pub async fn impacts(api: &Api, n: usize) -> Result<()> {
    let impacts: Vec<ImpactEvent> = api.get(&format!("/api/impacts?n={n}")).await?;
    if impacts.is_empty() {
        println!("no active impacts");
        return Ok(());
    }
    for i in &impacts {
        println!(
            "{} {:<10} {:<9} {} -> {}: {}",
            i.timestamp.format("%H:%M:%S"),
            i.impact_type,
            severity_colored(i.severity),
            i.source_name,
            i.target_name,
            i.description
        );
        if !i.suggestion.is_empty() {
            println!("         {}", i.suggestion.dimmed());
        }
    }

    let summary: serde_json::Value = api.get("/api/impacts/summary").await?;
    println!("\ntotal {}", summary["total"]);
    Ok(())
}

pub async fn config_show(api: &Api) -> Result<()> {
    let cfg: ImpactConfig = api.get("/api/config/impact").await?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

/// Validates the key/value against the typed schema locally, then pushes
/// only that key so the agent merge-updates and hot-reloads.
pub async fn config_set(api: &Api, key: &str, value: &str) -> Result<()> {
    let mut current: ImpactConfig = api.get("/api/config/impact").await?;
    set_impact_key(&mut current, key, value)?;

    let full = serde_json::to_value(&current)?;
    let mut patch = serde_json::Map::new();
    patch.insert(key.to_string(), full[key].clone());
    api.post("/api/config/impact", serde_json::Value::Object(patch))
        .await?;
    println!("{key} = {}", full[key]);
    Ok(())
}

pub fn config_keys() {
    println!("{:<28} KIND", "KEY");
    for (key, kind) in warden_core::config::impact_keys() {
        println!("{key:<28} {kind:?}");
    }
}

pub async fn status(api: &Api) -> Result<()> {
    let status: serde_json::Value = api.get("/api/status").await?;
    println!(
        "running: {}  targets: {}",
        status["running"], status["targets"]
    );
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
