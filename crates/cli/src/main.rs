use anyhow::Result;
use clap::{Parser, Subcommand};
use collaboration::{CollabConfig, Collaboration, PlanContext, SystemClock};
use plan::{ItemId, PlanId, UserId};
use std::path::PathBuf;
use std::sync::Arc;
use store::SqliteStore;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "plan-cli")]
#[command(about = "Business plan collaboration CLI - Headless workspace and maintenance operations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database path (defaults to the per-user data directory)
    #[arg(long, global = true, env = "PLAN_DB")]
    db: Option<PathBuf>,

    /// JSON collaboration config
    #[arg(long, global = true, env = "COLLAB_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    Init,

    /// Create a plan with default sections; the user becomes its admin
    NewPlan {
        /// Acting user id
        #[arg(short, long)]
        user: UserId,

        /// Plan name
        name: String,

        /// Company name
        #[arg(short, long)]
        company: Option<String>,
    },

    /// List plans with their stored progress
    Plans,

    /// Recompute and print the progress dashboard
    Progress {
        #[arg(short, long)]
        plan: PlanId,

        #[arg(short, long)]
        user: UserId,

        /// Print the full dashboard as JSON
        #[arg(long)]
        json: bool,
    },

    /// List voting sessions with ballot counts
    Sessions {
        #[arg(short, long)]
        plan: PlanId,

        #[arg(short, long)]
        user: UserId,
    },

    /// Invite someone by email and print the link
    Invite {
        #[arg(short, long)]
        plan: PlanId,

        /// Inviting admin
        #[arg(short, long)]
        user: UserId,

        email: String,

        /// Base URL for the link
        #[arg(long, env = "SITE_URL", default_value = "http://localhost:3000")]
        site_url: String,
    },

    /// Clear an edit lock regardless of holder (admins only)
    ForceUnlock {
        #[arg(short, long)]
        plan: PlanId,

        #[arg(short, long)]
        user: UserId,

        item: ItemId,
    },

    /// Release every lock whose lease has expired
    SweepLocks,

    /// Decide every voting session past its deadline
    CloseOverdue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let db_path = cli.db.clone().unwrap_or_else(store::default_db_path);
    if let Commands::Init = cli.command {
        return init_command(db_path);
    }

    let config = match &cli.config {
        Some(path) => CollabConfig::from_json_file(path)?,
        None => CollabConfig::default(),
    };
    let site_url = match &cli.command {
        Commands::Invite { site_url, .. } => site_url.clone(),
        _ => String::new(),
    };
    let store = SqliteStore::open_or_create(&db_path)?;
    let collab = Collaboration::new(Arc::new(store), Arc::new(SystemClock), config, site_url);

    match cli.command {
        Commands::Init => Ok(()),
        Commands::NewPlan {
            user,
            name,
            company,
        } => new_plan_command(&collab, user, &name, company.as_deref()),
        Commands::Plans => plans_command(&collab),
        Commands::Progress { plan, user, json } => {
            progress_command(&collab, PlanContext::new(plan, user), json)
        }
        Commands::Sessions { plan, user } => {
            sessions_command(&collab, PlanContext::new(plan, user))
        }
        Commands::Invite {
            plan, user, email, ..
        } => invite_command(&collab, PlanContext::new(plan, user), &email),
        Commands::ForceUnlock { plan, user, item } => {
            force_unlock_command(&collab, PlanContext::new(plan, user), item)
        }
        Commands::SweepLocks => sweep_locks_command(&collab),
        Commands::CloseOverdue => close_overdue_command(&collab),
    }
}

fn init_command(db_path: PathBuf) -> Result<()> {
    SqliteStore::open_or_create(&db_path)?;
    info!("Database ready: {:?}", db_path);
    Ok(())
}

fn new_plan_command(
    collab: &Collaboration,
    user: UserId,
    name: &str,
    company: Option<&str>,
) -> Result<()> {
    let workspace = collab.team.onboard(user, company, name)?;
    info!(
        "Plan created with {} canvas and {} detailed sections",
        workspace.canvas_sections, workspace.detailed_sections
    );
    println!("{}", workspace.plan.id);
    Ok(())
}

fn plans_command(collab: &Collaboration) -> Result<()> {
    let plans = collab.store().list_plans()?;
    if plans.is_empty() {
        println!("No plans yet.");
    }
    for plan in plans {
        println!(
            "{}  {:>3}%  {}",
            plan.id, plan.progress_percentage, plan.name
        );
    }
    Ok(())
}

fn progress_command(collab: &Collaboration, ctx: PlanContext, json: bool) -> Result<()> {
    collab.team.membership(&ctx)?;
    let stats = collab.progress.recompute(ctx.plan_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Overall:   {}%", stats.overall_progress);
    println!("Canvas:    {}%", stats.canvas_progress);
    println!("Detailed:  {}%", stats.detailed_progress);
    println!(
        "Sections:  {} approved, {} under vote, {} rejected, {} total",
        stats.approved_sections,
        stats.pending_sections,
        stats.rejected_sections,
        stats.total_sections
    );
    println!("Members:   {}", stats.active_members);
    for category in &stats.categories {
        println!("\n{} ({}%)", category.title, category.progress);
        for section in &category.sections {
            println!(
                "  {:>3}%  {:<9} {}",
                section.progress, section.status, section.title
            );
        }
    }
    Ok(())
}

fn sessions_command(collab: &Collaboration, ctx: PlanContext) -> Result<()> {
    let sessions = collab.voting.sessions_with_counts(&ctx)?;
    if sessions.is_empty() {
        println!("No voting sessions.");
    }
    for counts in sessions {
        let session = &counts.session;
        let deadline = session
            .deadline
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let mine = counts
            .user_vote
            .as_ref()
            .map(|v| v.vote_type.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {}/{} approve, {} reject  deadline {}  your vote {}  {}",
            session.id,
            session.status,
            counts.approve_votes,
            counts.total_votes,
            counts.reject_votes,
            deadline,
            mine,
            session.title
        );
    }
    Ok(())
}

fn invite_command(collab: &Collaboration, ctx: PlanContext, email: &str) -> Result<()> {
    let invite = collab.team.invite(&ctx, email)?;
    info!(
        "Invitation for {} expires {}",
        invite.invitation.email, invite.invitation.expires_at
    );
    println!("{}", invite.link);
    Ok(())
}

fn force_unlock_command(collab: &Collaboration, ctx: PlanContext, item: ItemId) -> Result<()> {
    if collab.locks.force_unlock(&ctx, item)? {
        info!("Lock on {} cleared", item);
    } else {
        warn!("Item {} was not locked", item);
    }
    Ok(())
}

fn sweep_locks_command(collab: &Collaboration) -> Result<()> {
    let released = collab.locks.sweep_expired()?;
    info!("Released {} expired lock(s)", released);
    Ok(())
}

fn close_overdue_command(collab: &Collaboration) -> Result<()> {
    let closed = collab.voting.close_overdue()?;
    for session in &closed {
        let decision = session
            .decision
            .map(|d| d.to_string())
            .unwrap_or_default();
        println!("{}  {}  {}", session.id, decision, session.title);
    }
    info!("Closed {} overdue session(s)", closed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use collaboration::ManualClock;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_ids() {
        let plan = PlanId::new();
        let user = UserId::new();
        let cli = Cli::try_parse_from([
            "plan-cli",
            "progress",
            "--plan",
            &plan.to_string(),
            "--user",
            &user.to_string(),
        ])
        .unwrap();
        match cli.command {
            Commands::Progress {
                plan: p,
                user: u,
                json,
            } => {
                assert_eq!((p, u, json), (plan, user, false));
            }
            _ => panic!("wrong subcommand"),
        }
        assert!(Cli::try_parse_from(["plan-cli", "sessions", "--plan", "nope", "--user", "x"]).is_err());
    }

    #[tokio::test]
    async fn test_commands_against_memory_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let collab = Collaboration::new(
            store,
            Arc::new(ManualClock::default()),
            CollabConfig::default(),
            "https://plans.test",
        );
        let owner = UserId::new();
        new_plan_command(&collab, owner, "Bakery", Some("Acme")).unwrap();
        let plan = collab.store().list_plans().unwrap().remove(0);
        let ctx = PlanContext::new(plan.id, owner);

        progress_command(&collab, ctx, true).unwrap();
        sessions_command(&collab, ctx).unwrap();
        sweep_locks_command(&collab).unwrap();
        close_overdue_command(&collab).unwrap();

        let outsider = PlanContext::new(plan.id, UserId::new());
        assert!(progress_command(&collab, outsider, false).is_err());
        assert!(force_unlock_command(&collab, ctx, ItemId::new()).is_err());
    }
}
