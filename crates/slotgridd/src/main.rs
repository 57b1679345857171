//! slotgridd — the SlotGrid daemon.
//!
//! Single binary hosting the training control plane:
//! - State store (redb)
//! - Journal writer
//! - One scheduling loop per resource pool
//! - REST API for clients and agents
//!
//! # Usage
//!
//! ```text
//! slotgridd run --config slotgrid.toml --port 8480 --data-dir /var/lib/slotgrid
//! slotgridd check-config --config slotgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use slotgrid_core::MasterConfig;
use slotgrid_scheduler::Master;
use slotgrid_state::StateStore;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,slotgridd=debug,slotgrid=debug";

#[derive(Parser)]
#[command(name = "slotgridd", about = "SlotGrid training control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to slotgrid.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Validate a config file and print the resolved configuration.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.master.port = port;
            }
            if let Some(dir) = data_dir {
                config.master.data_dir = dir.display().to_string();
            }
            run(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MasterConfig> {
    match path {
        Some(path) => MasterConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(MasterConfig::default()),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = MasterConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let timings = config.timings()?;
    println!("{}: ok", path.display());
    println!(
        "pools: {}",
        config
            .pools
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("{timings:#?}");
    Ok(())
}

async fn run(config: MasterConfig) -> anyhow::Result<()> {
    info!("SlotGrid daemon starting");

    let data_dir = PathBuf::from(&config.master.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("slotgrid.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Control plane ──────────────────────────────────────────

    let (master, mut handles) = Master::start(&config, store, shutdown_rx.clone())?;
    info!(pools = ?master.pool_names(), "control plane started");

    handles.push(tokio::spawn(log_outcomes(
        master.subscribe(),
        shutdown_rx,
    )));

    // ── API server ─────────────────────────────────────────────

    let router = slotgrid_api::build_router(master);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.master.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Pool loops stop first, the journal flushes what they queued.
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }

    info!("SlotGrid daemon stopped");
    Ok(())
}

/// Log every terminal task outcome.
async fn log_outcomes(
    mut notifications: broadcast::Receiver<slotgrid_scheduler::TaskNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = notifications.recv() => match received {
                Ok(note) => match note.error {
                    Some(err) => warn!(task_id = %note.task_id, pool = %note.pool, state = ?note.state, error = %err, "task finished"),
                    None => info!(task_id = %note.task_id, pool = %note.pool, state = ?note.state, "task finished"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "outcome log lagging behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "slotgridd",
            "run",
            "--port",
            "9000",
            "--data-dir",
            "/tmp/sg",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                config,
                port,
                data_dir,
                log_format,
            } => {
                assert!(config.is_none());
                assert_eq!(port, Some(9000));
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/sg")));
                assert_eq!(log_format, LogFormat::Json);
            }
            Command::CheckConfig { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/slotgrid.toml"))).unwrap_err();
        assert!(err.to_string().contains("loading config"));
    }

    #[test]
    fn check_config_accepts_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slotgrid.toml");
        std::fs::write(
            &path,
            r#"
[master]
port = 8480

[scheduler]
agent_timeout = "10s"

[[pools]]
name = "gpu"
policy = "fair_share"

[pools.fair_share]
half_life = "30m"
"#,
        )
        .unwrap();
        assert!(check_config(&path).is_ok());
    }
}
