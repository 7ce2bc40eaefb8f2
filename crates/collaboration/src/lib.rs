//! Realtime collaboration core for business plans
//! Item locking, presence, voting sessions and progress over a shared store
use plan::{PlanError, PlanId, UserId};
use serde::{Deserialize, Serialize};
use store::StoreError;
use thiserror::Error;

mod clock;
pub use clock::*;

mod config;
pub use config::*;

mod retry;
pub use retry::*;

mod change_feed;
pub use change_feed::*;

mod presence;
pub use presence::*;

mod locks;
pub use locks::*;

mod voting;
pub use voting::*;

mod progress;
pub use progress::*;

mod editing;
pub use editing::*;

mod team;
pub use team::*;

mod sync;
pub use sync::*;

/// Why a precondition check refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ItemLocked,
    NotLockHolder,
    NotDraft,
    VotingInProgress,
    EmptyContent,
    DependenciesUnmet,
    SessionCompleted,
    NotAMember,
    NotAdmin,
    NotPermitted,
    ReplyDepth,
    InvitationInvalid,
    InvalidInput,
    InFlight,
}

impl DenyReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::ItemLocked => "item_locked",
            DenyReason::NotLockHolder => "not_lock_holder",
            DenyReason::NotDraft => "not_draft",
            DenyReason::VotingInProgress => "voting_in_progress",
            DenyReason::EmptyContent => "empty_content",
            DenyReason::DependenciesUnmet => "dependencies_unmet",
            DenyReason::SessionCompleted => "session_completed",
            DenyReason::NotAMember => "not_a_member",
            DenyReason::NotAdmin => "not_admin",
            DenyReason::NotPermitted => "not_permitted",
            DenyReason::ReplyDepth => "reply_depth",
            DenyReason::InvitationInvalid => "invitation_invalid",
            DenyReason::InvalidInput => "invalid_input",
            DenyReason::InFlight => "in_flight",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::ItemLocked => "Item is being edited by another user",
            DenyReason::NotLockHolder => "You must hold the lock to edit this item",
            DenyReason::NotDraft => "Only draft content can be submitted for approval",
            DenyReason::VotingInProgress => "Content is under vote and cannot change",
            DenyReason::EmptyContent => "Content must not be empty",
            DenyReason::DependenciesUnmet => "Complete the prerequisite sections first",
            DenyReason::SessionCompleted => "Voting on this session has ended",
            DenyReason::NotAMember => "You are not an active member of this plan",
            DenyReason::NotAdmin => "Only owners and admins can do this",
            DenyReason::NotPermitted => "You are not allowed to do this",
            DenyReason::ReplyDepth => "Replies cannot be nested",
            DenyReason::InvitationInvalid => "Invitation is expired or already used",
            DenyReason::InvalidInput => "Invalid input",
            DenyReason::InFlight => "The same request is already in progress",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The closed set of failure outcomes callers need to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Denied,
    TransientFailure,
    NotFound,
    Fatal,
}

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("denied: {0}")]
    Denied(DenyReason),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    Invalid(#[from] PlanError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl CollaborationError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CollaborationError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CollaborationError::Denied(_) | CollaborationError::Invalid(_) => ErrorKind::Denied,
            CollaborationError::NotFound { .. } => ErrorKind::NotFound,
            CollaborationError::Store(e) if e.is_transient() => ErrorKind::TransientFailure,
            CollaborationError::ChannelClosed(_) | CollaborationError::Timeout(_) => {
                ErrorKind::TransientFailure
            }
            CollaborationError::Store(_)
            | CollaborationError::SerializationError(_)
            | CollaborationError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// Stable code for wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            CollaborationError::Denied(reason) => reason.code(),
            CollaborationError::Invalid(_) => DenyReason::InvalidInput.code(),
            CollaborationError::NotFound { .. } => "not_found",
            _ => match self.kind() {
                ErrorKind::TransientFailure => "transient_failure",
                _ => "internal",
            },
        }
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            CollaborationError::Denied(reason) => Some(*reason),
            CollaborationError::Invalid(_) => Some(DenyReason::InvalidInput),
            _ => None,
        }
    }
}

impl From<DenyReason> for CollaborationError {
    fn from(reason: DenyReason) -> Self {
        CollaborationError::Denied(reason)
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Who is acting, and on which plan. Passed explicitly into every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanContext {
    pub plan_id: PlanId,
    pub user_id: UserId,
}

impl PlanContext {
    pub fn new(plan_id: PlanId, user_id: UserId) -> Self {
        Self { plan_id, user_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CollaborationError::Denied(DenyReason::ItemLocked).kind(),
            ErrorKind::Denied
        );
        assert_eq!(
            CollaborationError::not_found("item", "x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CollaborationError::Timeout("change".into()).kind(),
            ErrorKind::TransientFailure
        );
        assert_eq!(
            CollaborationError::Config("bad".into()).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_deny_codes_are_stable() {
        assert_eq!(DenyReason::SessionCompleted.code(), "session_completed");
        assert_eq!(
            CollaborationError::from(DenyReason::DependenciesUnmet).code(),
            "dependencies_unmet"
        );
        let json = serde_json::to_string(&DenyReason::NotLockHolder).unwrap();
        assert_eq!(json, "\"not_lock_holder\"");
    }
}
