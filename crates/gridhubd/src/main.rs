//! gridhubd — the GridHub daemon.
//!
//! Single binary that assembles the dispatch grid control plane:
//! - State store (redb)
//! - Worker pool + provisioner
//! - Readiness monitor
//! - Autoscaler
//!
//! # Usage
//!
//! ```text
//! gridhubd standalone --data-dir /var/lib/gridhub \
//!     --worker 10.0.0.1:4444 --worker 10.0.0.2:4444
//!
//! gridhubd session --worker 10.0.0.1:4444 --commands suite.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use gridhub_autoscale::Autoscaler;
use gridhub_dispatch::{Command as SessionCommand, DispatchConfig, DispatchController, HttpWorkerClient};
use gridhub_health::{http_probe, ProbeConfig, ProbeResult, ReadinessMonitor};
use gridhub_pool::{PoolManager, StaticProvisioner};
use gridhub_state::{PoolConfig, StateStore};

#[derive(Parser)]
#[command(name = "gridhubd", about = "GridHub dispatch grid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (pool, readiness monitor, autoscaler) in one
    /// process.
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/gridhub")]
        data_dir: PathBuf,

        /// Address of a provisionable worker endpoint. Repeatable; the
        /// autoscaler draws from this fleet up to `max-count`.
        #[arg(long = "worker", required = true)]
        workers: Vec<String>,

        /// TOML file with the full pool configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override: lower bound on pool size.
        #[arg(long)]
        min_count: Option<u32>,

        /// Override: upper bound on pool size.
        #[arg(long)]
        max_count: Option<u32>,

        /// Override: target mean load fraction (0.0–1.0).
        #[arg(long)]
        target_utilization: Option<f64>,

        /// Override: seconds between autoscaler ticks.
        #[arg(long)]
        autoscale_interval: Option<u64>,
    },

    /// Run one command sequence as a session against already-running
    /// workers, print the outcomes as JSON, and exit.
    Session {
        /// Address of a worker endpoint. Repeatable.
        #[arg(long = "worker", required = true)]
        workers: Vec<String>,

        /// JSON file holding the command sequence.
        #[arg(long)]
        commands: PathBuf,

        /// Wall-clock bound on a single attempt, in seconds.
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Attempt budget for the session.
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridhubd=debug,gridhub=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            workers,
            config,
            min_count,
            max_count,
            target_utilization,
            autoscale_interval,
        } => {
            let mut pool_config = load_config(config.as_deref())?;
            if let Some(min) = min_count {
                pool_config.min_count = min;
            }
            if let Some(max) = max_count {
                pool_config.max_count = max;
            }
            if let Some(target) = target_utilization {
                pool_config.target_utilization = target;
            }
            if let Some(interval) = autoscale_interval {
                pool_config.evaluation_interval_secs = interval;
            }
            run_standalone(data_dir, workers, pool_config).await
        }
        Command::Session {
            workers,
            commands,
            timeout,
            max_attempts,
        } => run_session(workers, commands, timeout, max_attempts).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<PoolConfig> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        }
        None => Ok(PoolConfig::default()),
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    workers: Vec<String>,
    config: PoolConfig,
) -> anyhow::Result<()> {
    info!("GridHub daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("gridhub.redb");

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if (workers.len() as u32) < config.max_count {
        warn!(
            fleet = workers.len(),
            max_count = config.max_count,
            "fewer provisionable workers than max-count; scale-ups may degrade"
        );
    }

    let interval = config.evaluation_interval();
    let probe = ProbeConfig {
        timeout: config.probe_timeout(),
        ..ProbeConfig::default()
    };

    let pool = Arc::new(PoolManager::new(config, state.clone())?);
    info!(desired = pool.desired_count(), "worker pool initialized");

    let provisioner = Arc::new(StaticProvisioner::new(workers));
    let monitor = Arc::new(ReadinessMonitor::new(pool.clone(), probe));
    info!("readiness monitor initialized");

    let mut autoscaler = Autoscaler::new(
        pool.clone(),
        provisioner,
        monitor.clone(),
        state.clone(),
    );
    info!(interval_secs = interval.as_secs(), "autoscaler initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = autoscale_handle.await;
    monitor.stop_all().await;

    info!("GridHub daemon stopped");
    Ok(())
}

async fn run_session(
    workers: Vec<String>,
    commands_path: PathBuf,
    timeout: u64,
    max_attempts: u32,
) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(&commands_path)?;
    let commands: Vec<SessionCommand> = serde_json::from_str(&contents)?;
    info!(
        commands = commands.len(),
        workers = workers.len(),
        "running ad-hoc session"
    );

    let config = PoolConfig {
        max_count: (workers.len() as u32).max(1),
        ..PoolConfig::default()
    };
    let probe_timeout = config.probe_timeout();

    let state = StateStore::open_in_memory()?;
    let pool = Arc::new(PoolManager::new(config, state.clone())?);

    // One probe per worker up front; unreachable workers stay out of the
    // rotation rather than burning the attempt budget.
    for address in &workers {
        let worker = pool.admit(address)?;
        match http_probe(address, "/status", probe_timeout).await {
            ProbeResult::Up => pool.mark_ready(&worker.id)?,
            result => {
                warn!(%address, ?result, "worker not ready, skipping");
                pool.mark_failed(&worker.id)?;
            }
        }
    }

    let dispatch_config = DispatchConfig {
        max_attempts,
        session_timeout: Duration::from_secs(timeout),
        ..DispatchConfig::default()
    };
    let controller = DispatchController::new(
        pool,
        Arc::new(HttpWorkerClient::new()),
        state,
        dispatch_config,
    );

    let result = controller.run_session(&commands).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.passed() {
        anyhow::bail!("session completed with failed commands");
    }
    Ok(())
}
