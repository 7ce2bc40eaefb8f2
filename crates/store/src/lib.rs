//! Persistence for business plans.
//!
//! [`PlanStore`] is the seam the collaboration layer talks to. Every write
//! that can race between users (lock acquisition, opening a vote, casting a
//! ballot, finalising a session, accepting an invitation) is a single
//! conditional statement or transaction, so two callers can never both win.
//! Every committed write is published on the store's change stream.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use plan::{
    CanvasItem, CanvasSection, Comment, CommentId, Company, Decision, DetailedSection, Invitation,
    ItemId, Percent, Plan, PlanId, SectionId, TeamMember, UserId, Vote, VotingSession,
    VotingSessionId,
};
use thiserror::Error;
use tokio::sync::broadcast;

mod change;
pub use change::*;
mod rows;
mod sqlite;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Busy or locked database; the same call may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an insert-or-replace ballot.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteWrite {
    Inserted(Vote),
    Updated(Vote),
    SessionClosed,
    SessionMissing,
}

/// Ballot totals for one session, plus the asking user's own ballot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionCounts {
    pub session: VotingSession,
    pub total_votes: usize,
    pub approve_votes: usize,
    pub reject_votes: usize,
    pub user_vote: Option<Vote>,
}

/// Data-access seam for everything the collaboration layer persists.
pub trait PlanStore: Send + Sync {
    /// Receiver of every change committed from now on.
    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange>;

    // Workspace and membership

    /// Company, plan and owning membership in one transaction.
    fn create_workspace(
        &self,
        company: Option<&Company>,
        plan: &Plan,
        owner: &TeamMember,
    ) -> StoreResult<()>;
    fn get_plan(&self, plan_id: PlanId) -> StoreResult<Option<Plan>>;
    fn list_plans(&self) -> StoreResult<Vec<Plan>>;
    fn set_plan_progress(&self, plan_id: PlanId, progress: Percent) -> StoreResult<Option<Plan>>;
    fn list_team_members(&self, plan_id: PlanId) -> StoreResult<Vec<TeamMember>>;
    fn get_team_member(&self, plan_id: PlanId, user_id: UserId)
        -> StoreResult<Option<TeamMember>>;
    fn count_active_members(&self, plan_id: PlanId) -> StoreResult<usize>;
    /// Inserts, or reactivates an existing row for the same user with the new role.
    fn upsert_team_member(&self, member: &TeamMember) -> StoreResult<TeamMember>;

    // Seeding; both are idempotent and return the number of rows created.

    fn seed_canvas_sections(&self, plan_id: PlanId) -> StoreResult<usize>;
    fn seed_detailed_sections(&self, plan_id: PlanId) -> StoreResult<usize>;

    // Canvas

    fn list_canvas_sections(&self, plan_id: PlanId) -> StoreResult<Vec<CanvasSection>>;
    fn get_canvas_section(&self, section_id: SectionId) -> StoreResult<Option<CanvasSection>>;
    fn insert_canvas_item(&self, item: &CanvasItem) -> StoreResult<()>;
    fn get_canvas_item(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>>;
    fn list_canvas_items(&self, plan_id: PlanId) -> StoreResult<Vec<CanvasItem>>;
    /// Writes only while `editor` holds a live lock and no vote is open.
    fn update_canvas_item_content(
        &self,
        item_id: ItemId,
        editor: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>>;
    fn delete_canvas_item(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>>;

    // Item locks

    /// Takes the lock only if nobody holds a live one.
    fn acquire_item_lock(
        &self,
        item_id: ItemId,
        user_id: UserId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>>;
    /// Extends a live lock held by `user_id`.
    fn renew_item_lock(
        &self,
        item_id: ItemId,
        user_id: UserId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>>;
    /// Clears the lock only if `user_id` holds it.
    fn release_item_lock(&self, item_id: ItemId, user_id: UserId)
        -> StoreResult<Option<CanvasItem>>;
    /// Clears whatever lock is held.
    fn force_release_item_lock(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>>;
    /// Clears every lock held by `user_id`, optionally within one plan.
    fn release_locks_held_by(
        &self,
        user_id: UserId,
        plan_id: Option<PlanId>,
    ) -> StoreResult<Vec<CanvasItem>>;
    fn release_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<Vec<CanvasItem>>;

    // Detailed sections

    fn list_detailed_sections(&self, plan_id: PlanId) -> StoreResult<Vec<DetailedSection>>;
    fn get_detailed_section(&self, section_id: SectionId) -> StoreResult<Option<DetailedSection>>;
    /// Writes only while no vote is open on the section.
    fn update_detailed_section_content(
        &self,
        section_id: SectionId,
        content: &str,
        progress: Percent,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DetailedSection>>;

    // Voting

    /// Flips the source from draft to voting and records the session, atomically.
    /// Returns false when the source was not an eligible draft.
    fn open_voting_session(&self, session: &VotingSession) -> StoreResult<bool>;
    fn get_voting_session(&self, session_id: VotingSessionId)
        -> StoreResult<Option<VotingSession>>;
    fn list_voting_sessions(&self, plan_id: PlanId) -> StoreResult<Vec<VotingSession>>;
    fn list_overdue_sessions(&self, now: DateTime<Utc>) -> StoreResult<Vec<VotingSession>>;
    fn upsert_vote(&self, vote: &Vote) -> StoreResult<VoteWrite>;
    fn list_votes(&self, session_id: VotingSessionId) -> StoreResult<Vec<Vote>>;
    fn session_counts(&self, plan_id: PlanId, user_id: UserId)
        -> StoreResult<Vec<SessionCounts>>;
    /// Completes an active session and writes the outcome onto its source.
    /// Returns `None` when the session was already completed.
    fn finalize_voting_session(
        &self,
        session_id: VotingSessionId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<VotingSession>>;

    // Comments

    fn insert_comment(&self, comment: &Comment) -> StoreResult<()>;
    fn get_comment(&self, comment_id: CommentId) -> StoreResult<Option<Comment>>;
    fn list_comments(&self, item_id: ItemId) -> StoreResult<Vec<Comment>>;
    fn like_comment(&self, comment_id: CommentId) -> StoreResult<Option<Comment>>;
    fn resolve_comment(&self, comment_id: CommentId, resolved: bool)
        -> StoreResult<Option<Comment>>;

    // Invitations

    fn insert_invitation(&self, invitation: &Invitation) -> StoreResult<()>;
    fn get_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>>;
    fn list_invitations(&self, plan_id: PlanId) -> StoreResult<Vec<Invitation>>;
    /// Marks a pending, unexpired invitation accepted and adds the member.
    fn accept_invitation(
        &self,
        token: &str,
        member: &TeamMember,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TeamMember>>;
}

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("plan_collab")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("plans.sqlite")
}
