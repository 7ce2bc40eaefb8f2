/// WebSocket sync protocol and the service facade behind it
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use plan::{
    CanvasItem, Comment, CommentId, DetailedSection, ItemId, PlanId, SectionId, UserId, VoteType,
    VotingSession, VotingSessionId, VotingSource,
};
use serde::{Deserialize, Serialize};
use store::{PlanStore, RowChange};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    ChangeFeed, Clock, CollabConfig, CollaborationError, CursorPosition, DenyReason,
    EditingService, ErrorKind, LockManager, PlanContext, PresenceHub, PresenceUpdate,
    ProgressTracker, Result, TeamService, User, UserPresence, VoteOutcome, VotingEngine,
};

pub type RequestId = u64;

/// Message types exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Connection management
    #[serde(rename = "connect")]
    Connect { plan_id: PlanId, user: User },

    #[serde(rename = "connected")]
    Connected {
        plan_id: PlanId,
        user_id: UserId,
        roster: Vec<UserPresence>,
    },

    // Client requests
    #[serde(rename = "command")]
    Command {
        request_id: RequestId,
        command: Command,
    },

    #[serde(rename = "presence_update")]
    UpdatePresence { cursor: Option<CursorPosition> },

    // Replies
    #[serde(rename = "ack")]
    Ack {
        request_id: RequestId,
        outcome: CommandOutcome,
    },

    #[serde(rename = "denied")]
    Denied {
        request_id: RequestId,
        code: String,
        message: String,
    },

    // Fan-out
    #[serde(rename = "change")]
    Change { change: RowChange },

    #[serde(rename = "presence")]
    Presence { update: PresenceUpdate },

    #[serde(rename = "notice")]
    Notice { notice: Notice },

    // Error handling
    #[serde(rename = "error")]
    Error {
        request_id: Option<RequestId>,
        code: String,
        message: String,
    },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SyncMessage {
    /// The request a reply answers, if any.
    pub fn reply_to(&self) -> Option<RequestId> {
        match self {
            SyncMessage::Ack { request_id, .. } | SyncMessage::Denied { request_id, .. } => {
                Some(*request_id)
            }
            SyncMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

/// State-changing requests a connected client may issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Lock {
        item_id: ItemId,
    },
    Unlock {
        item_id: ItemId,
    },
    RenewLock {
        item_id: ItemId,
    },
    ForceUnlock {
        item_id: ItemId,
    },
    CreateItem {
        section_id: SectionId,
        content: String,
    },
    UpdateItem {
        item_id: ItemId,
        content: String,
    },
    DeleteItem {
        item_id: ItemId,
    },
    SaveSection {
        section_id: SectionId,
        content: String,
    },
    StartVoting {
        source: VotingSource,
        #[serde(default)]
        deadline: Option<DateTime<Utc>>,
    },
    CastVote {
        session_id: VotingSessionId,
        vote_type: VoteType,
        #[serde(default)]
        comment: Option<String>,
    },
    AddComment {
        item_id: ItemId,
        #[serde(default)]
        parent_id: Option<CommentId>,
        content: String,
    },
    LikeComment {
        comment_id: CommentId,
    },
    ResolveComment {
        comment_id: CommentId,
        resolved: bool,
    },
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::RenewLock { .. } => "renew_lock",
            Command::ForceUnlock { .. } => "force_unlock",
            Command::CreateItem { .. } => "create_item",
            Command::UpdateItem { .. } => "update_item",
            Command::DeleteItem { .. } => "delete_item",
            Command::SaveSection { .. } => "save_section",
            Command::StartVoting { .. } => "start_voting",
            Command::CastVote { .. } => "cast_vote",
            Command::AddComment { .. } => "add_comment",
            Command::LikeComment { .. } => "like_comment",
            Command::ResolveComment { .. } => "resolve_comment",
        }
    }

    /// Identifies "the same request" for duplicate-submit suppression.
    pub fn in_flight_key(&self) -> String {
        let target = match self {
            Command::Lock { item_id }
            | Command::Unlock { item_id }
            | Command::RenewLock { item_id }
            | Command::ForceUnlock { item_id }
            | Command::UpdateItem { item_id, .. }
            | Command::DeleteItem { item_id } => item_id.to_string(),
            Command::CreateItem { section_id, .. } | Command::SaveSection { section_id, .. } => {
                section_id.to_string()
            }
            Command::StartVoting { source, .. } => source.raw_id().to_string(),
            Command::CastVote { session_id, .. } => session_id.to_string(),
            Command::AddComment { item_id, .. } => item_id.to_string(),
            Command::LikeComment { comment_id } | Command::ResolveComment { comment_id, .. } => {
                comment_id.to_string()
            }
        };
        format!("{}:{}", self.action(), target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutcome {
    Locked { item_id: ItemId },
    Unlocked { item_id: ItemId },
    LockRenewed { item_id: ItemId },
    ForceUnlocked { item_id: ItemId, released: bool },
    Item { item: CanvasItem },
    ItemDeleted { item_id: ItemId },
    Section { section: DetailedSection },
    SessionOpened { session: VotingSession },
    VoteRecorded { outcome: VoteOutcome },
    Comment { comment: Comment },
}

impl CommandOutcome {
    /// Text of the confirmation toast.
    pub fn summary(&self) -> String {
        match self {
            CommandOutcome::Locked { .. } => "You are now editing this item".to_string(),
            CommandOutcome::Unlocked { .. } => "Item released".to_string(),
            CommandOutcome::LockRenewed { .. } => "Editing session extended".to_string(),
            CommandOutcome::ForceUnlocked { released: true, .. } => "Lock cleared".to_string(),
            CommandOutcome::ForceUnlocked { released: false, .. } => {
                "Item was not locked".to_string()
            }
            CommandOutcome::Item { .. } => "Item saved".to_string(),
            CommandOutcome::ItemDeleted { .. } => "Item deleted".to_string(),
            CommandOutcome::Section { section } => {
                format!("{} saved ({}%)", section.title, section.progress_percentage)
            }
            CommandOutcome::SessionOpened { session } => {
                format!("Voting started for {}", session.title)
            }
            CommandOutcome::VoteRecorded { outcome } => match &outcome.completed {
                Some(session) => format!(
                    "Vote recorded; {} was {}",
                    session.title,
                    session
                        .decision
                        .map(|d| d.as_str())
                        .unwrap_or("decided")
                ),
                None => "Vote recorded".to_string(),
            },
            CommandOutcome::Comment { .. } => "Comment saved".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// Transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Replies for one command: an ack or denial/error, then a notice.
pub fn reply_for(request_id: RequestId, result: &Result<CommandOutcome>) -> Vec<SyncMessage> {
    match result {
        Ok(outcome) => vec![
            SyncMessage::Ack {
                request_id,
                outcome: outcome.clone(),
            },
            SyncMessage::Notice {
                notice: Notice::new(NoticeLevel::Success, outcome.summary()),
            },
        ],
        Err(e) => {
            let (reply, notice) = match e.kind() {
                ErrorKind::Denied => {
                    let message = e
                        .deny_reason()
                        .map(|r| r.message().to_string())
                        .unwrap_or_else(|| e.to_string());
                    (
                        SyncMessage::Denied {
                            request_id,
                            code: e.code().to_string(),
                            message: message.clone(),
                        },
                        Notice::new(NoticeLevel::Warning, message),
                    )
                }
                ErrorKind::NotFound => (
                    SyncMessage::Denied {
                        request_id,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                    Notice::new(NoticeLevel::Info, "It no longer exists"),
                ),
                ErrorKind::TransientFailure => (
                    SyncMessage::Error {
                        request_id: Some(request_id),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                    Notice::new(NoticeLevel::Error, "Connection problem, please try again"),
                ),
                ErrorKind::Fatal => {
                    error!("Request {} failed: {}", request_id, e);
                    (
                        SyncMessage::Error {
                            request_id: Some(request_id),
                            code: e.code().to_string(),
                            message: "internal error".to_string(),
                        },
                        Notice::new(NoticeLevel::Error, "Something went wrong"),
                    )
                }
            };
            vec![reply, SyncMessage::Notice { notice }]
        }
    }
}

/// Client-side sync manager
///
/// Refuses to submit a command while an identical one is still awaiting
/// its reply.
pub struct SyncClient {
    ctx: PlanContext,
    next_request: RequestId,
    in_flight: HashMap<RequestId, String>,
    keys: HashSet<String>,
    tx: mpsc::UnboundedSender<SyncMessage>,
}

impl SyncClient {
    pub fn new(ctx: PlanContext, tx: mpsc::UnboundedSender<SyncMessage>) -> Self {
        Self {
            ctx,
            next_request: 1,
            in_flight: HashMap::new(),
            keys: HashSet::new(),
            tx,
        }
    }

    fn send(&self, message: SyncMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|e| CollaborationError::ChannelClosed(e.to_string()))
    }

    pub fn connect(&self, user: User) -> Result<()> {
        self.send(SyncMessage::Connect {
            plan_id: self.ctx.plan_id,
            user,
        })
    }

    /// Sends `command` unless the same one is already in flight.
    pub fn submit(&mut self, command: Command) -> Result<RequestId> {
        let key = command.in_flight_key();
        if self.keys.contains(&key) {
            return Err(DenyReason::InFlight.into());
        }
        let request_id = self.next_request;
        self.send(SyncMessage::Command {
            request_id,
            command,
        })?;
        self.next_request += 1;
        self.keys.insert(key.clone());
        self.in_flight.insert(request_id, key);
        Ok(request_id)
    }

    pub fn is_in_flight(&self, command: &Command) -> bool {
        self.keys.contains(&command.in_flight_key())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Fire-and-forget cursor update.
    pub fn update_presence(&self, cursor: Option<CursorPosition>) -> Result<()> {
        self.send(SyncMessage::UpdatePresence { cursor })
    }

    pub fn ping(&self) -> Result<()> {
        self.send(SyncMessage::Ping)
    }

    /// Clears the in-flight entry a reply answers. Returns the request id if
    /// one was cleared.
    pub fn handle_incoming(&mut self, message: &SyncMessage) -> Option<RequestId> {
        let request_id = message.reply_to()?;
        let key = self.in_flight.remove(&request_id)?;
        self.keys.remove(&key);
        Some(request_id)
    }

    /// Forgets everything in flight, e.g. after reconnecting.
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.keys.clear();
    }
}

/// Every collaboration service over one store, wired together.
#[derive(Clone)]
pub struct Collaboration {
    store: Arc<dyn PlanStore>,
    config: CollabConfig,
    pub feed: ChangeFeed,
    pub presence: PresenceHub,
    pub locks: LockManager,
    pub voting: VotingEngine,
    pub progress: ProgressTracker,
    pub editing: EditingService,
    pub team: TeamService,
}

/// What one maintenance pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_locks: usize,
    pub closed_sessions: Vec<VotingSessionId>,
}

impl Collaboration {
    pub fn new(
        store: Arc<dyn PlanStore>,
        clock: Arc<dyn Clock>,
        config: CollabConfig,
        site_url: impl Into<String>,
    ) -> Self {
        let feed = ChangeFeed::new(store.clone());
        let locks = LockManager::new(store.clone(), clock.clone(), config.locks.clone());
        Self {
            presence: PresenceHub::new(clock.clone(), config.presence.clone()),
            voting: VotingEngine::new(store.clone(), clock.clone(), config.voting.clone()),
            progress: ProgressTracker::new(store.clone(), feed.clone()),
            editing: EditingService::new(store.clone(), clock.clone(), locks.clone()),
            team: TeamService::new(store.clone(), clock, site_url),
            locks,
            feed,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn PlanStore> {
        &self.store
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Runs one client command on behalf of `ctx`.
    pub fn execute(&self, ctx: &PlanContext, command: Command) -> Result<CommandOutcome> {
        let outcome = match command {
            Command::Lock { item_id } => {
                if !self.locks.try_lock(ctx, item_id)? {
                    return Err(DenyReason::ItemLocked.into());
                }
                CommandOutcome::Locked { item_id }
            }
            Command::Unlock { item_id } => {
                if !self.locks.unlock(ctx, item_id)? {
                    return Err(DenyReason::NotLockHolder.into());
                }
                CommandOutcome::Unlocked { item_id }
            }
            Command::RenewLock { item_id } => {
                if !self.locks.renew(ctx, item_id)? {
                    return Err(DenyReason::NotLockHolder.into());
                }
                CommandOutcome::LockRenewed { item_id }
            }
            Command::ForceUnlock { item_id } => CommandOutcome::ForceUnlocked {
                item_id,
                released: self.locks.force_unlock(ctx, item_id)?,
            },
            Command::CreateItem {
                section_id,
                content,
            } => CommandOutcome::Item {
                item: self.editing.create_item(ctx, section_id, &content)?,
            },
            Command::UpdateItem { item_id, content } => CommandOutcome::Item {
                item: self.editing.update_item(ctx, item_id, &content)?,
            },
            Command::DeleteItem { item_id } => {
                self.editing.delete_item(ctx, item_id)?;
                CommandOutcome::ItemDeleted { item_id }
            }
            Command::SaveSection {
                section_id,
                content,
            } => CommandOutcome::Section {
                section: self
                    .editing
                    .save_detailed_section(ctx, section_id, &content)?,
            },
            Command::StartVoting { source, deadline } => CommandOutcome::SessionOpened {
                session: self.voting.create_session(ctx, source, deadline)?,
            },
            Command::CastVote {
                session_id,
                vote_type,
                comment,
            } => CommandOutcome::VoteRecorded {
                outcome: self.voting.cast_vote(ctx, session_id, vote_type, comment)?,
            },
            Command::AddComment {
                item_id,
                parent_id,
                content,
            } => CommandOutcome::Comment {
                comment: self.editing.add_comment(ctx, item_id, parent_id, &content)?,
            },
            Command::LikeComment { comment_id } => CommandOutcome::Comment {
                comment: self.editing.like_comment(ctx, comment_id)?,
            },
            Command::ResolveComment {
                comment_id,
                resolved,
            } => CommandOutcome::Comment {
                comment: self.editing.resolve_comment(ctx, comment_id, resolved)?,
            },
        };
        Ok(outcome)
    }

    /// Session end for one user in one plan: drops every lock they hold there.
    pub fn disconnect(&self, ctx: &PlanContext) -> Result<Vec<ItemId>> {
        let released = self.locks.release_all_for(ctx.user_id, Some(ctx.plan_id))?;
        info!(
            "User {} disconnected from plan {} ({} lock(s) released)",
            ctx.user_id,
            ctx.plan_id,
            released.len()
        );
        Ok(released)
    }

    /// Expired leases, overdue sessions and idle presence, in one pass.
    pub fn sweep(&self) -> Result<SweepReport> {
        // Presence ages even when the store is unreachable.
        self.presence.sweep();
        let expired_locks = self.locks.sweep_expired()?;
        let closed_sessions = self
            .voting
            .close_overdue()?
            .into_iter()
            .map(|session| session.id)
            .collect();
        Ok(SweepReport {
            expired_locks,
            closed_sessions,
        })
    }
}
