//! Realtime collaboration WebSocket server for business plans

mod connection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use collaboration::{CollabConfig, Collaboration, QuorumMode, SystemClock, TieBreak};
use store::SqliteStore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Realtime collaboration server for business plans")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// SQLite database path (defaults to the per-user data directory)
    #[arg(long, env = "PLAN_DB")]
    db: Option<PathBuf>,

    /// JSON config file; flags below override it
    #[arg(long, env = "COLLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Lock lease in seconds
    #[arg(long, env = "COLLAB_LEASE_SECS")]
    lease_secs: Option<u64>,

    /// all_active_members or single_reviewer
    #[arg(long, env = "COLLAB_QUORUM", value_parser = parse_snake::<QuorumMode>)]
    quorum: Option<QuorumMode>,

    /// reject or approve
    #[arg(long, env = "COLLAB_TIE_BREAK", value_parser = parse_snake::<TieBreak>)]
    tie_break: Option<TieBreak>,

    /// Seconds between expired-lock and overdue-session sweeps
    #[arg(long, env = "COLLAB_SWEEP_SECS", default_value_t = 30)]
    sweep_secs: u64,

    /// Base URL used in invitation links
    #[arg(long, env = "SITE_URL", default_value = "http://localhost:3000")]
    site_url: String,
}

/// Parses a snake_case enum the same way the config file spells it.
fn parse_snake<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|e| e.to_string())
}

impl Args {
    fn collab_config(&self) -> anyhow::Result<CollabConfig> {
        let mut config = match &self.config {
            Some(path) => CollabConfig::from_json_file(path)?,
            None => CollabConfig::default(),
        };
        if let Some(lease) = self.lease_secs {
            anyhow::ensure!(lease > 0, "--lease-secs must be positive");
            config.locks.lease_secs = lease;
        }
        if let Some(quorum) = self.quorum {
            config.voting.quorum = quorum;
        }
        if let Some(tie_break) = self.tie_break {
            config.voting.tie_break = tie_break;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,collaboration=debug")),
        )
        .init();

    let args = Args::parse();
    let config = args.collab_config()?;
    let db_path = args.db.clone().unwrap_or_else(store::default_db_path);
    let store = SqliteStore::open_or_create(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    info!("Using database {}", db_path.display());

    let collab = Collaboration::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config,
        args.site_url.clone(),
    );

    let sweeper = tokio::spawn(run_sweeper(
        collab.clone(),
        Duration::from_secs(args.sweep_secs.max(1)),
    ));

    let listener = TcpListener::bind(&args.listen).await?;
    info!("Collaboration server listening on: {}", args.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from: {}", addr);
                    tokio::spawn(connection::handle_connection(stream, addr, collab.clone()));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    sweeper.abort();
    Ok(())
}

/// Releases expired locks, closes overdue votes and ages presence rosters.
async fn run_sweeper(collab: Collaboration, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let pass = collab.clone();
        match tokio::task::spawn_blocking(move || pass.sweep()).await {
            Ok(Ok(report)) => {
                if report.expired_locks > 0 || !report.closed_sessions.is_empty() {
                    info!(
                        "Sweep released {} lock(s), closed {} session(s)",
                        report.expired_locks,
                        report.closed_sessions.len()
                    );
                }
            }
            Ok(Err(e)) => warn!("Sweep failed: {}", e),
            Err(e) => error!("Sweep task panicked: {}", e),
        }
    }
}
