/// Voting sessions and ballots
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ItemId, ItemStatus, PlanId, SectionId, UserId, VoteId, VotingSessionId};

/// The content unit a voting session was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "item_type", content = "item_id", rename_all = "snake_case")]
pub enum VotingSource {
    CanvasItem(ItemId),
    DetailedSection(SectionId),
}

impl VotingSource {
    pub fn item_type(&self) -> &'static str {
        match self {
            VotingSource::CanvasItem(_) => "canvas_item",
            VotingSource::DetailedSection(_) => "detailed_section",
        }
    }

    pub fn raw_id(&self) -> Uuid {
        match self {
            VotingSource::CanvasItem(id) => id.0,
            VotingSource::DetailedSection(id) => id.0,
        }
    }

    pub fn from_parts(item_type: &str, raw_id: Uuid) -> Option<Self> {
        match item_type {
            "canvas_item" => Some(VotingSource::CanvasItem(ItemId(raw_id))),
            "detailed_section" => Some(VotingSource::DetailedSection(SectionId(raw_id))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

text_enum!(SessionStatus, "session status", {
    Active => "active",
    Completed => "completed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

text_enum!(Decision, "decision", {
    Approved => "approved",
    Rejected => "rejected",
});

impl Decision {
    /// Status written back onto the source item.
    pub fn item_status(&self) -> ItemStatus {
        match self {
            Decision::Approved => ItemStatus::Approved,
            Decision::Rejected => ItemStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingSession {
    pub id: VotingSessionId,
    pub plan_id: PlanId,
    pub source: VotingSource,
    pub title: String,
    /// Snapshot of the item content at the moment voting opened
    pub content: String,
    pub status: SessionStatus,
    pub decision: Option<Decision>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VotingSession {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed() && self.deadline.map(|d| d <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Approve,
    Reject,
}

text_enum!(VoteType, "vote type", {
    Approve => "approve",
    Reject => "reject",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub session_id: VotingSessionId,
    pub voter_id: UserId,
    pub vote_type: VoteType,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
