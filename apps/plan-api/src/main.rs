//! Plan REST API server
//! Onboarding, team management, voting summaries and progress dashboards

mod api;
mod models;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use collaboration::{CollabConfig, Collaboration, SystemClock};
use store::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plan-api")]
#[command(about = "REST API for business plan workspaces")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PLAN_API_LISTEN", default_value = "127.0.0.1:3000")]
    listen: String,

    /// SQLite database path (defaults to the per-user data directory)
    #[arg(long, env = "PLAN_DB")]
    db: Option<PathBuf>,

    /// JSON config file shared with the collaboration server
    #[arg(long, env = "COLLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL used in invitation links
    #[arg(long, env = "SITE_URL", default_value = "http://localhost:3000")]
    site_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plan_api=debug,collaboration=info,axum=info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting plan API server...");

    let config = match &args.config {
        Some(path) => CollabConfig::from_json_file(path)?,
        None => CollabConfig::default(),
    };
    let db_path = args.db.clone().unwrap_or_else(store::default_db_path);
    let store = SqliteStore::open_or_create(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    info!("Storage initialized at: {}", db_path.display());

    let collab = Collaboration::new(Arc::new(store), Arc::new(SystemClock), config, args.site_url);
    let app = api::router(collab);

    info!("Plan API listening on http://{}", args.listen);
    info!("API endpoints:");
    info!("  POST /api/onboarding                                - Create plan workspace");
    info!("  GET  /api/plans/:id/dashboard                       - Progress dashboard");
    info!("  GET  /api/plans/:id/sessions                        - Voting sessions with counts");
    info!("  GET  /api/plans/:id/team                            - Team roster");
    info!("  GET  /api/plans/:id/invitations                     - Pending invitations");
    info!("  POST /api/plans/:id/invitations                     - Invite by email");
    info!("  GET  /api/plans/:id/items/:item_id/comments         - Comment threads");
    info!("  POST /api/plans/:id/items/:item_id/force-unlock     - Clear an edit lock");
    info!("  POST /api/invitations/:token/accept                 - Join a plan");

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
