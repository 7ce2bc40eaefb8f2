//! Column lists and row decoders shared by the SQLite queries.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use plan::{
    clamp_percent, CanvasItem, CanvasSection, Comment, CommentId, DetailedSection, Invitation,
    InvitationId, ItemId, ItemLock, MemberId, Plan, PlanError, PlanId, SectionId, TeamMember,
    UserId, Vote, VoteId, VotingSession, VotingSessionId, VotingSource,
};
use rusqlite::{types::Type, Row};
use uuid::Uuid;

pub(crate) const PLAN_COLUMNS: &str =
    "id, name, description, company_id, status, progress_percentage, created_by, created_at, updated_at";
pub(crate) const TEAM_MEMBER_COLUMNS: &str =
    "id, plan_id, user_id, role, status, invited_by, joined_at";
pub(crate) const CANVAS_SECTION_COLUMNS: &str =
    "id, plan_id, block, title, description, sort_order";
pub(crate) const CANVAS_ITEM_COLUMNS: &str = "id, section_id, plan_id, content, status, created_by, locked_by, locked_at, lock_expires_at, created_at, updated_at";
pub(crate) const DETAILED_SECTION_COLUMNS: &str = "id, plan_id, section_key, category, title, description, content, status, progress_percentage, dependencies_json, assigned_to, deadline, created_at, updated_at";
pub(crate) const VOTING_SESSION_COLUMNS: &str = "id, plan_id, item_id, item_type, title, content, status, decision, deadline, created_by, created_at, updated_at, completed_at";
pub(crate) const VOTE_COLUMNS: &str =
    "id, session_id, user_id, vote_type, comment, created_at, updated_at";
pub(crate) const COMMENT_COLUMNS: &str =
    "id, plan_id, item_id, parent_id, author_id, content, likes, resolved, created_at";
pub(crate) const INVITATION_COLUMNS: &str =
    "id, plan_id, email, token, invited_by, status, expires_at, created_at";

/// Timestamps are stored as epoch milliseconds.
pub(crate) fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn millis_to_time(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {ms}")))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    millis_to_time(idx, ms)
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| millis_to_time(idx, ms)).transpose()
}

fn parse_at<T: FromStr<Err = PlanError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: PlanError| conversion_error(idx, e.to_string()))
}

fn opt_parse_at<T: FromStr<Err = PlanError>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e: PlanError| conversion_error(idx, e.to_string())))
        .transpose()
}

pub(crate) fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: PlanId(uuid_at(row, 0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        company_id: opt_uuid_at(row, 3)?.map(plan::CompanyId),
        status: parse_at(row, 4)?,
        progress_percentage: clamp_percent(row.get(5)?),
        created_by: UserId(uuid_at(row, 6)?),
        created_at: time_at(row, 7)?,
        updated_at: time_at(row, 8)?,
    })
}

pub(crate) fn team_member_from_row(row: &Row<'_>) -> rusqlite::Result<TeamMember> {
    Ok(TeamMember {
        id: MemberId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        user_id: UserId(uuid_at(row, 2)?),
        role: parse_at(row, 3)?,
        status: parse_at(row, 4)?,
        invited_by: opt_uuid_at(row, 5)?.map(UserId),
        joined_at: time_at(row, 6)?,
    })
}

pub(crate) fn canvas_section_from_row(row: &Row<'_>) -> rusqlite::Result<CanvasSection> {
    Ok(CanvasSection {
        id: SectionId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        block: parse_at(row, 2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        sort_order: row.get(5)?,
    })
}

pub(crate) fn canvas_item_from_row(row: &Row<'_>) -> rusqlite::Result<CanvasItem> {
    let lock = match (
        opt_uuid_at(row, 6)?,
        opt_time_at(row, 7)?,
        opt_time_at(row, 8)?,
    ) {
        (Some(holder), Some(locked_at), Some(expires_at)) => Some(ItemLock {
            holder: UserId(holder),
            locked_at,
            expires_at,
        }),
        _ => None,
    };
    Ok(CanvasItem {
        id: ItemId(uuid_at(row, 0)?),
        section_id: SectionId(uuid_at(row, 1)?),
        plan_id: PlanId(uuid_at(row, 2)?),
        content: row.get(3)?,
        status: parse_at(row, 4)?,
        created_by: UserId(uuid_at(row, 5)?),
        lock,
        created_at: time_at(row, 9)?,
        updated_at: time_at(row, 10)?,
    })
}

pub(crate) fn detailed_section_from_row(row: &Row<'_>) -> rusqlite::Result<DetailedSection> {
    let deps_json: String = row.get(9)?;
    let dependencies: Vec<String> =
        serde_json::from_str(&deps_json).map_err(|e| conversion_error(9, e.to_string()))?;
    Ok(DetailedSection {
        id: SectionId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        section_key: row.get(2)?,
        category: parse_at(row, 3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        content: row.get(6)?,
        status: parse_at(row, 7)?,
        progress_percentage: clamp_percent(row.get(8)?),
        dependencies,
        assigned_to: opt_uuid_at(row, 10)?.map(UserId),
        deadline: opt_time_at(row, 11)?,
        created_at: time_at(row, 12)?,
        updated_at: time_at(row, 13)?,
    })
}

pub(crate) fn voting_session_from_row(row: &Row<'_>) -> rusqlite::Result<VotingSession> {
    let item_type: String = row.get(3)?;
    let source = VotingSource::from_parts(&item_type, uuid_at(row, 2)?)
        .ok_or_else(|| conversion_error(3, format!("unknown item type: {item_type}")))?;
    Ok(VotingSession {
        id: VotingSessionId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        source,
        title: row.get(4)?,
        content: row.get(5)?,
        status: parse_at(row, 6)?,
        decision: opt_parse_at(row, 7)?,
        deadline: opt_time_at(row, 8)?,
        created_by: UserId(uuid_at(row, 9)?),
        created_at: time_at(row, 10)?,
        updated_at: time_at(row, 11)?,
        completed_at: opt_time_at(row, 12)?,
    })
}

pub(crate) fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<Vote> {
    Ok(Vote {
        id: VoteId(uuid_at(row, 0)?),
        session_id: VotingSessionId(uuid_at(row, 1)?),
        voter_id: UserId(uuid_at(row, 2)?),
        vote_type: parse_at(row, 3)?,
        comment: row.get(4)?,
        created_at: time_at(row, 5)?,
        updated_at: time_at(row, 6)?,
    })
}

pub(crate) fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    let likes: i64 = row.get(6)?;
    Ok(Comment {
        id: CommentId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        item_id: ItemId(uuid_at(row, 2)?),
        parent_id: opt_uuid_at(row, 3)?.map(CommentId),
        author_id: UserId(uuid_at(row, 4)?),
        content: row.get(5)?,
        likes: u32::try_from(likes).unwrap_or_default(),
        resolved: row.get(7)?,
        created_at: time_at(row, 8)?,
    })
}

pub(crate) fn invitation_from_row(row: &Row<'_>) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        id: InvitationId(uuid_at(row, 0)?),
        plan_id: PlanId(uuid_at(row, 1)?),
        email: row.get(2)?,
        token: row.get(3)?,
        invited_by: UserId(uuid_at(row, 4)?),
        status: parse_at(row, 5)?,
        expires_at: time_at(row, 6)?,
        created_at: time_at(row, 7)?,
    })
}
