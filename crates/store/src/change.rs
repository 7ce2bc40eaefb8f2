/// Row-level change notifications emitted after every committed write
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use plan::{
    CanvasItem, CanvasSection, Comment, DetailedSection, Invitation, Plan, PlanId, TeamMember,
    Vote, VotingSession,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered changes per subscriber before it starts lagging.
pub const CHANGE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Plans,
    TeamMembers,
    CanvasSections,
    CanvasItems,
    DetailedSections,
    VotingSessions,
    Votes,
    Comments,
    Invitations,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Plans => "plans",
            Table::TeamMembers => "team_members",
            Table::CanvasSections => "canvas_sections",
            Table::CanvasItems => "canvas_items",
            Table::DetailedSections => "detailed_sections",
            Table::VotingSessions => "voting_sessions",
            Table::Votes => "votes",
            Table::Comments => "comments",
            Table::Invitations => "invitations",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Columns a change subscription may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    PlanId,
    ItemId,
    SessionId,
    SectionId,
    UserId,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::PlanId => "plan_id",
            Field::ItemId => "item_id",
            Field::SessionId => "session_id",
            Field::SectionId => "section_id",
            Field::UserId => "user_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    Plan(Plan),
    TeamMember(TeamMember),
    CanvasSection(CanvasSection),
    CanvasItem(CanvasItem),
    DetailedSection(DetailedSection),
    VotingSession(VotingSession),
    Vote(Vote),
    Comment(Comment),
    Invitation(Invitation),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Plan(_) => Table::Plans,
            Row::TeamMember(_) => Table::TeamMembers,
            Row::CanvasSection(_) => Table::CanvasSections,
            Row::CanvasItem(_) => Table::CanvasItems,
            Row::DetailedSection(_) => Table::DetailedSections,
            Row::VotingSession(_) => Table::VotingSessions,
            Row::Vote(_) => Table::Votes,
            Row::Comment(_) => Table::Comments,
            Row::Invitation(_) => Table::Invitations,
        }
    }

    /// Value of a filterable column, if this row has it.
    pub fn field(&self, field: Field) -> Option<Uuid> {
        match (self, field) {
            (Row::Plan(p), Field::Id | Field::PlanId) => Some(p.id.0),
            (Row::TeamMember(m), Field::Id) => Some(m.id.0),
            (Row::TeamMember(m), Field::PlanId) => Some(m.plan_id.0),
            (Row::TeamMember(m), Field::UserId) => Some(m.user_id.0),
            (Row::CanvasSection(s), Field::Id | Field::SectionId) => Some(s.id.0),
            (Row::CanvasSection(s), Field::PlanId) => Some(s.plan_id.0),
            (Row::CanvasItem(i), Field::Id | Field::ItemId) => Some(i.id.0),
            (Row::CanvasItem(i), Field::PlanId) => Some(i.plan_id.0),
            (Row::CanvasItem(i), Field::SectionId) => Some(i.section_id.0),
            (Row::CanvasItem(i), Field::UserId) => i.lock.as_ref().map(|l| l.holder.0),
            (Row::DetailedSection(s), Field::Id | Field::SectionId | Field::ItemId) => Some(s.id.0),
            (Row::DetailedSection(s), Field::PlanId) => Some(s.plan_id.0),
            (Row::VotingSession(s), Field::Id | Field::SessionId) => Some(s.id.0),
            (Row::VotingSession(s), Field::PlanId) => Some(s.plan_id.0),
            (Row::VotingSession(s), Field::ItemId) => Some(s.source.raw_id()),
            (Row::Vote(v), Field::Id) => Some(v.id.0),
            (Row::Vote(v), Field::SessionId) => Some(v.session_id.0),
            (Row::Vote(v), Field::UserId) => Some(v.voter_id.0),
            (Row::Comment(c), Field::Id) => Some(c.id.0),
            (Row::Comment(c), Field::PlanId) => Some(c.plan_id.0),
            (Row::Comment(c), Field::ItemId) => Some(c.item_id.0),
            (Row::Comment(c), Field::UserId) => Some(c.author_id.0),
            (Row::Invitation(i), Field::Id) => Some(i.id.0),
            (Row::Invitation(i), Field::PlanId) => Some(i.plan_id.0),
            _ => None,
        }
    }
}

/// One committed row change.
///
/// `seq` is strictly increasing in commit order for a given store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub seq: u64,
    pub table: Table,
    pub kind: ChangeKind,
    pub plan_id: PlanId,
    pub old: Option<Row>,
    pub new: Option<Row>,
    pub committed_at: DateTime<Utc>,
}

impl RowChange {
    /// The post-image for inserts and updates, the pre-image for deletes.
    pub fn row(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// True when either image carries `value` in `field`.
    pub fn matches(&self, field: Field, value: Uuid) -> bool {
        if field == Field::PlanId && self.plan_id.0 == value {
            return true;
        }
        [self.old.as_ref(), self.new.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| row.field(field) == Some(value))
    }
}

/// Fan-out of committed changes to any number of subscribers.
pub struct ChangeStream {
    tx: broadcast::Sender<RowChange>,
    seq: AtomicU64,
}

impl Default for ChangeStream {
    fn default() -> Self {
        Self::new(CHANGE_BUFFER)
    }
}

impl ChangeStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.tx.subscribe()
    }

    pub fn insert(&self, plan_id: PlanId, row: Row) {
        self.emit(row.table(), ChangeKind::Insert, plan_id, None, Some(row));
    }

    pub fn update(&self, plan_id: PlanId, old: Option<Row>, new: Row) {
        self.emit(new.table(), ChangeKind::Update, plan_id, old, Some(new));
    }

    pub fn delete(&self, plan_id: PlanId, old: Row) {
        self.emit(old.table(), ChangeKind::Delete, plan_id, Some(old), None);
    }

    fn emit(
        &self,
        table: Table,
        kind: ChangeKind,
        plan_id: PlanId,
        old: Option<Row>,
        new: Option<Row>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let change = RowChange {
            seq,
            table,
            kind,
            plan_id,
            old,
            new,
            committed_at: Utc::now(),
        };
        // No receivers is fine; nobody is watching yet.
        let _ = self.tx.send(change);
    }
}
