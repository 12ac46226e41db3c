//! Warden daemon entry point: CLI parsing, logging bootstrap, subsystem
//! wiring, HTTP serve loop, graceful shutdown. Query subcommands talk to an
//! already-running agent over its HTTP API instead of starting one.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use warden_core::config::Config;
use warden_core::event_log::{EventLog, CAT_SERVICE};
use warden_core::monitor::TargetMonitor;
use warden_core::proc_source::platform_source;
use warden_core::sampler::Sampler;
use warden_core::server::{self, ApiState};
use warden_core::traffic::TrafficMonitor;
use warden_core::types::MonitorTarget;

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Warden — host telemetry agent with guarded-process impact analysis"
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "warden.json")]
    config: String,

    /// HTTP bind address (overrides config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Generate a starter config file and exit
    #[arg(long)]
    generate_config: bool,

    /// Run without the HTTP API
    #[arg(long)]
    no_server: bool,

    /// Echo target/impact events to the console
    #[arg(long)]
    console_events: bool,

    /// Base URL of a running agent (query subcommands only)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List processes with per-second rates
    Processes {
        /// Sort key: cpu, memory, disk, network
        #[arg(long, default_value = "cpu")]
        sort: String,
        /// Rows to show
        #[arg(long, default_value_t = 25)]
        n: usize,
    },
    /// Show system-wide metrics
    System,
    /// List guarded targets with their latest sample
    Targets,
    /// Register a guarded target
    Add {
        pid: i32,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        alias: String,
        /// Ports to watch for contention (repeatable)
        #[arg(long = "port")]
        ports: Vec<u16>,
        /// Files to watch for contention (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Unregister a guarded target
    Remove { pid: i32 },
    /// Show recent events
    Events {
        #[arg(long, default_value_t = 50)]
        n: usize,
    },
    /// Show recent process appearances/disappearances
    Changes {
        #[arg(long, default_value_t = 50)]
        n: usize,
    },
    /// Show active impact findings
    Impacts {
        #[arg(long, default_value_t = 50)]
        n: usize,
    },
    /// Inspect or change impact thresholds on a running agent
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show agent status
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active impact configuration
    Show,
    /// Set one threshold; validated and hot-reloaded
    Set { key: String, value: String },
    /// List settable keys
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        let api = commands::Api::new(&cli.url);
        return match command {
            Command::Processes { sort, n } => commands::processes(&api, &sort, n).await,
            Command::System => commands::system(&api).await,
            Command::Targets => commands::targets(&api).await,
            Command::Add {
                pid,
                name,
                alias,
                ports,
                files,
            } => commands::add_target(&api, pid, &name, &alias, &ports, &files).await,
            Command::Remove { pid } => commands::remove_target(&api, pid).await,
            Command::Events { n } => commands::events(&api, n).await,
            Command::Changes { n } => commands::changes(&api, n).await,
            Command::Impacts { n } => commands::impacts(&api, n).await,
            Command::Config { action } => match action {
                ConfigAction::Show => commands::config_show(&api).await,
                ConfigAction::Set { key, value } => commands::config_set(&api, &key, &value).await,
                ConfigAction::Keys => {
                    commands::config_keys();
                    Ok(())
                }
            },
            Command::Status => commands::status(&api).await,
        };
    }

    if cli.generate_config {
        Config::generate_example(&cli.config)
            .with_context(|| format!("writing starter config to {}", cli.config))?;
        println!("starter configuration written to {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load(&cli.config).context("loading configuration")?;
    if let Some(bind) = &cli.bind {
        config.server.addr = bind.clone();
    }
    if cli.console_events {
        config.logging.console_output = true;
        config.logging.events_to_console = true;
    }

    let level = match cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("warden v{}", env!("CARGO_PKG_VERSION"));

    // The JSONL sink is fatal at startup: an agent that cannot persist its
    // record stream has no business running unattended.
    let log = Arc::new(
        EventLog::new(
            &config.logging.dir,
            config.logging.file_output,
            config.logging.console_output,
        )
        .with_context(|| format!("opening event log under {}", config.logging.dir))?,
    );
    log.info(CAT_SERVICE, "warden agent starting");

    // ── Subsystems ───────────────────────────────────────────────────────
    let source = platform_source();
    let traffic = Arc::new(TrafficMonitor::new(source.clone()));
    let sampler = Arc::new(Sampler::new(
        source.clone(),
        traffic.clone(),
        cfg!(windows),
    ));
    let monitor = Arc::new(TargetMonitor::new(
        sampler.clone(),
        log.clone(),
        config.sampling.interval_seconds,
        config.sampling.metrics_buffer_len,
        config.sampling.events_buffer_len,
    ));
    monitor.install_analyzer(config.impact.clone());

    // Resolve configured targets; pid 0 means look the name up now.
    for spec in config.targets.clone() {
        let target = match resolve_target(&source, spec) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "skipping configured target");
                continue;
            }
        };
        if let Err(e) = monitor.add(target) {
            warn!(error = %e, "configured target not added");
        }
    }

    traffic.start();
    sampler.start();
    monitor.start();

    // ── Serve / wait ─────────────────────────────────────────────────────
    let state = ApiState {
        monitor: monitor.clone(),
        config: Arc::new(RwLock::new(config.clone())),
        config_path: Some(cli.config.clone().into()),
    };

    if config.server.enabled && !cli.no_server {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let addr = config.server.addr.clone();
        let server_task = tokio::spawn(async move {
            server::serve(state, &addr, async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
        // The HTTP server gets five seconds to drain before we move on.
        match tokio::time::timeout(Duration::from_secs(5), server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
            Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
            Err(_) => warn!("HTTP server did not drain within 5s, abandoning"),
        }
    } else {
        info!("running without HTTP API");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    monitor.stop();
    sampler.stop();
    traffic.stop();
    log.info(CAT_SERVICE, "warden agent stopped");
    Ok(())
}

fn resolve_target(
    source: &Arc<dyn warden_core::ProcessSource>,
    mut target: MonitorTarget,
) -> warden_core::WardenResult<MonitorTarget> {
    if target.pid == 0 {
        target.pid = source.find_single_by_name(&target.name)?;
        info!(name = %target.name, pid = target.pid, "resolved target by name");
    }
    Ok(target)
}
