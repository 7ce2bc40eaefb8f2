use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plan::{
    CanvasBlock, CanvasItem, CanvasSection, Comment, CommentId, Company, Decision,
    DetailedSection, Invitation, ItemId, Percent, Plan, PlanId, SectionId, TeamMember, UserId,
    Vote, VoteType, VotingSession, VotingSessionId, VotingSource, DEFAULT_DETAILED_SECTIONS,
    unmet_dependencies,
};
use rusqlite::{params, Connection, OptionalExtension, Params};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::rows::*;
use crate::{ChangeStream, PlanStore, Row, RowChange, SessionCounts, StoreResult, VoteWrite};

/// [`PlanStore`] over a single SQLite connection.
///
/// The connection is serialised behind a mutex; changes are published while
/// the mutex is still held so subscribers see them in commit order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    changes: ChangeStream,
}

impl SqliteStore {
    pub fn open_or_create(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        apply_migrations(&conn)?;
        info!("Opened plan database at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            changes: ChangeStream::default(),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            changes: ChangeStream::default(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs a conditional single-row UPDATE and publishes the change if it applied.
    fn update_item_where<P: Params>(
        &self,
        item_id: ItemId,
        sql: &str,
        params: P,
    ) -> StoreResult<Option<CanvasItem>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_item(&conn, item_id)? else {
            return Ok(None);
        };
        if conn.execute(sql, params)? == 0 {
            return Ok(None);
        }
        let new = fetch_item(&conn, item_id)?;
        if let Some(new) = &new {
            self.changes.update(
                new.plan_id,
                Some(Row::CanvasItem(old)),
                Row::CanvasItem(new.clone()),
            );
        }
        Ok(new)
    }

    /// Clears the locks of `candidates`, re-checking `guard` per row.
    fn clear_locks(
        &self,
        conn: &Connection,
        candidates: Vec<CanvasItem>,
        guard: &str,
        guard_value: &dyn rusqlite::ToSql,
    ) -> StoreResult<Vec<CanvasItem>> {
        let sql = format!(
            "UPDATE canvas_items SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL \
             WHERE id = ?1 AND {guard}"
        );
        let mut released = Vec::new();
        for old in candidates {
            if conn.execute(&sql, params![old.id.to_string(), guard_value])? == 0 {
                continue;
            }
            if let Some(new) = fetch_item(conn, old.id)? {
                self.changes.update(
                    new.plan_id,
                    Some(Row::CanvasItem(old)),
                    Row::CanvasItem(new.clone()),
                );
                released.push(new);
            }
        }
        Ok(released)
    }
}

fn query_one<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> StoreResult<Option<T>>
where
    P: Params,
    F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    Ok(conn.query_row(sql, params, f).optional()?)
}

fn query_all<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> StoreResult<Vec<T>>
where
    P: Params,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn fetch_plan(conn: &Connection, plan_id: PlanId) -> StoreResult<Option<Plan>> {
    query_one(
        conn,
        &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?1"),
        params![plan_id.to_string()],
        plan_from_row,
    )
}

fn fetch_member(
    conn: &Connection,
    plan_id: PlanId,
    user_id: UserId,
) -> StoreResult<Option<TeamMember>> {
    query_one(
        conn,
        &format!("SELECT {TEAM_MEMBER_COLUMNS} FROM team_members WHERE plan_id = ?1 AND user_id = ?2"),
        params![plan_id.to_string(), user_id.to_string()],
        team_member_from_row,
    )
}

fn fetch_item(conn: &Connection, item_id: ItemId) -> StoreResult<Option<CanvasItem>> {
    query_one(
        conn,
        &format!("SELECT {CANVAS_ITEM_COLUMNS} FROM canvas_items WHERE id = ?1"),
        params![item_id.to_string()],
        canvas_item_from_row,
    )
}

fn fetch_detailed(conn: &Connection, section_id: SectionId) -> StoreResult<Option<DetailedSection>> {
    query_one(
        conn,
        &format!("SELECT {DETAILED_SECTION_COLUMNS} FROM detailed_sections WHERE id = ?1"),
        params![section_id.to_string()],
        detailed_section_from_row,
    )
}

fn fetch_session(
    conn: &Connection,
    session_id: VotingSessionId,
) -> StoreResult<Option<VotingSession>> {
    query_one(
        conn,
        &format!("SELECT {VOTING_SESSION_COLUMNS} FROM voting_sessions WHERE id = ?1"),
        params![session_id.to_string()],
        voting_session_from_row,
    )
}

fn fetch_vote(
    conn: &Connection,
    session_id: VotingSessionId,
    user_id: UserId,
) -> StoreResult<Option<Vote>> {
    query_one(
        conn,
        &format!("SELECT {VOTE_COLUMNS} FROM votes WHERE session_id = ?1 AND user_id = ?2"),
        params![session_id.to_string(), user_id.to_string()],
        vote_from_row,
    )
}

fn fetch_comment(conn: &Connection, comment_id: CommentId) -> StoreResult<Option<Comment>> {
    query_one(
        conn,
        &format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?1"),
        params![comment_id.to_string()],
        comment_from_row,
    )
}

fn fetch_invitation(conn: &Connection, token: &str) -> StoreResult<Option<Invitation>> {
    query_one(
        conn,
        &format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE token = ?1"),
        params![token],
        invitation_from_row,
    )
}

/// Source row of a voting session, wrapped for change publication.
fn fetch_source(conn: &Connection, source: VotingSource) -> StoreResult<Option<Row>> {
    Ok(match source {
        VotingSource::CanvasItem(id) => fetch_item(conn, id)?.map(Row::CanvasItem),
        VotingSource::DetailedSection(id) => fetch_detailed(conn, id)?.map(Row::DetailedSection),
    })
}

fn list_detailed(conn: &Connection, plan_id: PlanId) -> StoreResult<Vec<DetailedSection>> {
    query_all(
        conn,
        &format!("SELECT {DETAILED_SECTION_COLUMNS} FROM detailed_sections WHERE plan_id = ?1 ORDER BY created_at, rowid"),
        params![plan_id.to_string()],
        detailed_section_from_row,
    )
}

fn source_table(source: VotingSource) -> &'static str {
    match source {
        VotingSource::CanvasItem(_) => "canvas_items",
        VotingSource::DetailedSection(_) => "detailed_sections",
    }
}

fn insert_member(conn: &Connection, member: &TeamMember) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO team_members(id, plan_id, user_id, role, status, invited_by, joined_at) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(plan_id, user_id) DO UPDATE SET role = excluded.role, status = 'active'",
        params![
            member.id.to_string(),
            member.plan_id.to_string(),
            member.user_id.to_string(),
            member.role.as_str(),
            member.status.as_str(),
            member.invited_by.map(|u| u.to_string()),
            ts(member.joined_at),
        ],
    )?;
    Ok(())
}

impl PlanStore for SqliteStore {
    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }

    fn create_workspace(
        &self,
        company: Option<&Company>,
        plan: &Plan,
        owner: &TeamMember,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(company) = company {
            tx.execute(
                "INSERT INTO companies(id, name, created_by, created_at) VALUES(?1, ?2, ?3, ?4)",
                params![
                    company.id.to_string(),
                    company.name,
                    company.created_by.to_string(),
                    ts(company.created_at),
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO plans(id, name, description, company_id, status, progress_percentage, created_by, created_at, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                plan.id.to_string(),
                plan.name,
                plan.description,
                plan.company_id.map(|c| c.to_string()),
                plan.status.as_str(),
                plan.progress_percentage,
                plan.created_by.to_string(),
                ts(plan.created_at),
                ts(plan.updated_at),
            ],
        )?;
        insert_member(&tx, owner)?;
        tx.commit()?;
        self.changes.insert(plan.id, Row::Plan(plan.clone()));
        self.changes.insert(plan.id, Row::TeamMember(owner.clone()));
        debug!("Created plan {} owned by {}", plan.id, owner.user_id);
        Ok(())
    }

    fn get_plan(&self, plan_id: PlanId) -> StoreResult<Option<Plan>> {
        fetch_plan(&self.conn.lock(), plan_id)
    }

    fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {PLAN_COLUMNS} FROM plans ORDER BY created_at DESC"),
            [],
            plan_from_row,
        )
    }

    fn set_plan_progress(&self, plan_id: PlanId, progress: Percent) -> StoreResult<Option<Plan>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_plan(&conn, plan_id)? else {
            return Ok(None);
        };
        let changed = conn.execute(
            "UPDATE plans SET progress_percentage = ?2, updated_at = ?3 \
             WHERE id = ?1 AND progress_percentage <> ?2",
            params![plan_id.to_string(), progress, ts(Utc::now())],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let new = fetch_plan(&conn, plan_id)?;
        if let Some(new) = &new {
            self.changes
                .update(plan_id, Some(Row::Plan(old)), Row::Plan(new.clone()));
        }
        Ok(new)
    }

    fn list_team_members(&self, plan_id: PlanId) -> StoreResult<Vec<TeamMember>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {TEAM_MEMBER_COLUMNS} FROM team_members WHERE plan_id = ?1 ORDER BY joined_at"),
            params![plan_id.to_string()],
            team_member_from_row,
        )
    }

    fn get_team_member(
        &self,
        plan_id: PlanId,
        user_id: UserId,
    ) -> StoreResult<Option<TeamMember>> {
        fetch_member(&self.conn.lock(), plan_id, user_id)
    }

    fn count_active_members(&self, plan_id: PlanId) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM team_members WHERE plan_id = ?1 AND status = 'active'",
            params![plan_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn upsert_team_member(&self, member: &TeamMember) -> StoreResult<TeamMember> {
        let conn = self.conn.lock();
        let old = fetch_member(&conn, member.plan_id, member.user_id)?;
        insert_member(&conn, member)?;
        let new = fetch_member(&conn, member.plan_id, member.user_id)?
            .unwrap_or_else(|| member.clone());
        match old {
            Some(old) => self.changes.update(
                new.plan_id,
                Some(Row::TeamMember(old)),
                Row::TeamMember(new.clone()),
            ),
            None => self
                .changes
                .insert(new.plan_id, Row::TeamMember(new.clone())),
        }
        Ok(new)
    }

    fn seed_canvas_sections(&self, plan_id: PlanId) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut created = Vec::new();
        for block in CanvasBlock::ALL {
            let section = CanvasSection::for_block(plan_id, block);
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO canvas_sections(id, plan_id, block, title, description, sort_order) \
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    section.id.to_string(),
                    plan_id.to_string(),
                    block.as_str(),
                    section.title,
                    section.description,
                    section.sort_order,
                ],
            )?;
            if inserted > 0 {
                created.push(section);
            }
        }
        tx.commit()?;
        let count = created.len();
        for section in created {
            self.changes.insert(plan_id, Row::CanvasSection(section));
        }
        Ok(count)
    }

    fn seed_detailed_sections(&self, plan_id: PlanId) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut created = Vec::new();
        for template in DEFAULT_DETAILED_SECTIONS {
            let section = DetailedSection::from_template(plan_id, template);
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO detailed_sections(id, plan_id, section_key, category, title, description, content, status, progress_percentage, dependencies_json, assigned_to, deadline, created_at, updated_at) \
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, ?11, ?11)",
                params![
                    section.id.to_string(),
                    plan_id.to_string(),
                    section.section_key,
                    section.category.as_str(),
                    section.title,
                    section.description,
                    section.content,
                    section.status.as_str(),
                    section.progress_percentage,
                    serde_json::to_string(&section.dependencies)?,
                    ts(section.created_at),
                ],
            )?;
            if inserted > 0 {
                created.push(section);
            }
        }
        tx.commit()?;
        let count = created.len();
        for section in created {
            self.changes.insert(plan_id, Row::DetailedSection(section));
        }
        Ok(count)
    }

    fn list_canvas_sections(&self, plan_id: PlanId) -> StoreResult<Vec<CanvasSection>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {CANVAS_SECTION_COLUMNS} FROM canvas_sections WHERE plan_id = ?1 ORDER BY sort_order"),
            params![plan_id.to_string()],
            canvas_section_from_row,
        )
    }

    fn get_canvas_section(&self, section_id: SectionId) -> StoreResult<Option<CanvasSection>> {
        query_one(
            &self.conn.lock(),
            &format!("SELECT {CANVAS_SECTION_COLUMNS} FROM canvas_sections WHERE id = ?1"),
            params![section_id.to_string()],
            canvas_section_from_row,
        )
    }

    fn insert_canvas_item(&self, item: &CanvasItem) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO canvas_items(id, section_id, plan_id, content, status, created_by, locked_by, locked_at, lock_expires_at, created_at, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, ?7, ?8)",
            params![
                item.id.to_string(),
                item.section_id.to_string(),
                item.plan_id.to_string(),
                item.content,
                item.status.as_str(),
                item.created_by.to_string(),
                ts(item.created_at),
                ts(item.updated_at),
            ],
        )?;
        let stored = fetch_item(&conn, item.id)?.unwrap_or_else(|| item.clone());
        self.changes.insert(item.plan_id, Row::CanvasItem(stored));
        Ok(())
    }

    fn get_canvas_item(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>> {
        fetch_item(&self.conn.lock(), item_id)
    }

    fn list_canvas_items(&self, plan_id: PlanId) -> StoreResult<Vec<CanvasItem>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {CANVAS_ITEM_COLUMNS} FROM canvas_items WHERE plan_id = ?1 ORDER BY created_at, rowid"),
            params![plan_id.to_string()],
            canvas_item_from_row,
        )
    }

    fn update_canvas_item_content(
        &self,
        item_id: ItemId,
        editor: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>> {
        self.update_item_where(
            item_id,
            "UPDATE canvas_items SET content = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status <> 'voting' AND locked_by = ?2 AND lock_expires_at > ?4",
            params![item_id.to_string(), editor.to_string(), content, ts(now)],
        )
    }

    fn delete_canvas_item(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_item(&conn, item_id)? else {
            return Ok(None);
        };
        if conn.execute(
            "DELETE FROM canvas_items WHERE id = ?1",
            params![item_id.to_string()],
        )? == 0
        {
            return Ok(None);
        }
        self.changes.delete(old.plan_id, Row::CanvasItem(old.clone()));
        Ok(Some(old))
    }

    fn acquire_item_lock(
        &self,
        item_id: ItemId,
        user_id: UserId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>> {
        self.update_item_where(
            item_id,
            "UPDATE canvas_items SET locked_by = ?2, locked_at = ?3, lock_expires_at = ?4 \
             WHERE id = ?1 AND (locked_by IS NULL OR lock_expires_at IS NULL OR lock_expires_at <= ?3)",
            params![item_id.to_string(), user_id.to_string(), ts(now), ts(expires_at)],
        )
    }

    fn renew_item_lock(
        &self,
        item_id: ItemId,
        user_id: UserId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<CanvasItem>> {
        self.update_item_where(
            item_id,
            "UPDATE canvas_items SET lock_expires_at = ?4 \
             WHERE id = ?1 AND locked_by = ?2 AND lock_expires_at > ?3",
            params![item_id.to_string(), user_id.to_string(), ts(now), ts(expires_at)],
        )
    }

    fn release_item_lock(
        &self,
        item_id: ItemId,
        user_id: UserId,
    ) -> StoreResult<Option<CanvasItem>> {
        self.update_item_where(
            item_id,
            "UPDATE canvas_items SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL \
             WHERE id = ?1 AND locked_by = ?2",
            params![item_id.to_string(), user_id.to_string()],
        )
    }

    fn force_release_item_lock(&self, item_id: ItemId) -> StoreResult<Option<CanvasItem>> {
        self.update_item_where(
            item_id,
            "UPDATE canvas_items SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL \
             WHERE id = ?1 AND locked_by IS NOT NULL",
            params![item_id.to_string()],
        )
    }

    fn release_locks_held_by(
        &self,
        user_id: UserId,
        plan_id: Option<PlanId>,
    ) -> StoreResult<Vec<CanvasItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let held = match plan_id {
            Some(plan_id) => query_all(
                &tx,
                &format!("SELECT {CANVAS_ITEM_COLUMNS} FROM canvas_items WHERE locked_by = ?1 AND plan_id = ?2"),
                params![user_id.to_string(), plan_id.to_string()],
                canvas_item_from_row,
            )?,
            None => query_all(
                &tx,
                &format!("SELECT {CANVAS_ITEM_COLUMNS} FROM canvas_items WHERE locked_by = ?1"),
                params![user_id.to_string()],
                canvas_item_from_row,
            )?,
        };
        let holder = user_id.to_string();
        let released = self.clear_locks(&tx, held, "locked_by = ?2", &holder)?;
        tx.commit()?;
        Ok(released)
    }

    fn release_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<Vec<CanvasItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stale = query_all(
            &tx,
            &format!(
                "SELECT {CANVAS_ITEM_COLUMNS} FROM canvas_items \
                 WHERE locked_by IS NOT NULL AND lock_expires_at <= ?1"
            ),
            params![ts(now)],
            canvas_item_from_row,
        )?;
        let released = self.clear_locks(&tx, stale, "lock_expires_at <= ?2", &ts(now))?;
        tx.commit()?;
        Ok(released)
    }

    fn list_detailed_sections(&self, plan_id: PlanId) -> StoreResult<Vec<DetailedSection>> {
        list_detailed(&self.conn.lock(), plan_id)
    }

    fn get_detailed_section(&self, section_id: SectionId) -> StoreResult<Option<DetailedSection>> {
        fetch_detailed(&self.conn.lock(), section_id)
    }

    fn update_detailed_section_content(
        &self,
        section_id: SectionId,
        content: &str,
        progress: Percent,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DetailedSection>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_detailed(&conn, section_id)? else {
            return Ok(None);
        };
        let changed = conn.execute(
            "UPDATE detailed_sections SET content = ?2, progress_percentage = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status <> 'voting'",
            params![section_id.to_string(), content, progress, ts(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let new = fetch_detailed(&conn, section_id)?;
        if let Some(new) = &new {
            self.changes.update(
                new.plan_id,
                Some(Row::DetailedSection(old)),
                Row::DetailedSection(new.clone()),
            );
        }
        Ok(new)
    }

    fn open_voting_session(&self, session: &VotingSession) -> StoreResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(old_source) = fetch_source(&tx, session.source)? else {
            return Ok(false);
        };
        // Prerequisites are read in the same transaction as the status flip.
        if let Row::DetailedSection(section) = &old_source {
            let siblings = list_detailed(&tx, section.plan_id)?;
            let unmet = unmet_dependencies(section, &siblings);
            if !unmet.is_empty() {
                debug!("Section {} blocked on {:?}", section.section_key, unmet);
                return Ok(false);
            }
        }
        let flipped = tx.execute(
            &format!(
                "UPDATE {} SET status = 'voting', updated_at = ?2 \
                 WHERE id = ?1 AND status = 'draft' AND trim(content) <> ''",
                source_table(session.source)
            ),
            params![session.source.raw_id().to_string(), ts(session.created_at)],
        )?;
        if flipped == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO voting_sessions(id, plan_id, item_id, item_type, title, content, status, decision, deadline, created_by, created_at, updated_at, completed_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'active', NULL, ?7, ?8, ?9, ?10, NULL)",
            params![
                session.id.to_string(),
                session.plan_id.to_string(),
                session.source.raw_id().to_string(),
                session.source.item_type(),
                session.title,
                session.content,
                session.deadline.map(ts),
                session.created_by.to_string(),
                ts(session.created_at),
                ts(session.updated_at),
            ],
        )?;
        let new_source = fetch_source(&tx, session.source)?;
        let stored = fetch_session(&tx, session.id)?;
        tx.commit()?;
        if let Some(new_source) = new_source {
            self.changes
                .update(session.plan_id, Some(old_source), new_source);
        }
        if let Some(stored) = stored {
            self.changes
                .insert(session.plan_id, Row::VotingSession(stored));
        }
        info!(
            "Opened voting session {} for {} {}",
            session.id,
            session.source.item_type(),
            session.source.raw_id()
        );
        Ok(true)
    }

    fn get_voting_session(
        &self,
        session_id: VotingSessionId,
    ) -> StoreResult<Option<VotingSession>> {
        fetch_session(&self.conn.lock(), session_id)
    }

    fn list_voting_sessions(&self, plan_id: PlanId) -> StoreResult<Vec<VotingSession>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {VOTING_SESSION_COLUMNS} FROM voting_sessions WHERE plan_id = ?1 ORDER BY created_at DESC, rowid DESC"),
            params![plan_id.to_string()],
            voting_session_from_row,
        )
    }

    fn list_overdue_sessions(&self, now: DateTime<Utc>) -> StoreResult<Vec<VotingSession>> {
        query_all(
            &self.conn.lock(),
            &format!(
                "SELECT {VOTING_SESSION_COLUMNS} FROM voting_sessions \
                 WHERE status = 'active' AND deadline IS NOT NULL AND deadline <= ?1 ORDER BY deadline"
            ),
            params![ts(now)],
            voting_session_from_row,
        )
    }

    fn upsert_vote(&self, vote: &Vote) -> StoreResult<VoteWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(session) = fetch_session(&tx, vote.session_id)? else {
            return Ok(VoteWrite::SessionMissing);
        };
        if session.is_completed() {
            return Ok(VoteWrite::SessionClosed);
        }
        let old = fetch_vote(&tx, vote.session_id, vote.voter_id)?;
        tx.execute(
            "INSERT INTO votes(id, session_id, user_id, vote_type, comment, created_at, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(session_id, user_id) DO UPDATE SET \
             vote_type = excluded.vote_type, comment = excluded.comment, updated_at = excluded.updated_at",
            params![
                vote.id.to_string(),
                vote.session_id.to_string(),
                vote.voter_id.to_string(),
                vote.vote_type.as_str(),
                vote.comment,
                ts(vote.created_at),
                ts(vote.updated_at),
            ],
        )?;
        let stored = fetch_vote(&tx, vote.session_id, vote.voter_id)?.unwrap_or_else(|| vote.clone());
        tx.commit()?;
        Ok(match old {
            Some(old) => {
                self.changes.update(
                    session.plan_id,
                    Some(Row::Vote(old)),
                    Row::Vote(stored.clone()),
                );
                VoteWrite::Updated(stored)
            }
            None => {
                self.changes.insert(session.plan_id, Row::Vote(stored.clone()));
                VoteWrite::Inserted(stored)
            }
        })
    }

    fn list_votes(&self, session_id: VotingSessionId) -> StoreResult<Vec<Vote>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {VOTE_COLUMNS} FROM votes WHERE session_id = ?1 ORDER BY created_at, rowid"),
            params![session_id.to_string()],
            vote_from_row,
        )
    }

    fn session_counts(
        &self,
        plan_id: PlanId,
        user_id: UserId,
    ) -> StoreResult<Vec<SessionCounts>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {VOTING_SESSION_COLUMNS}, \
             (SELECT COUNT(*) FROM votes v WHERE v.session_id = s.id), \
             (SELECT COUNT(*) FROM votes v WHERE v.session_id = s.id AND v.vote_type = '{approve}'), \
             (SELECT COUNT(*) FROM votes v WHERE v.session_id = s.id AND v.vote_type = '{reject}') \
             FROM voting_sessions s WHERE s.plan_id = ?1 ORDER BY s.created_at DESC, s.rowid DESC",
            approve = VoteType::Approve.as_str(),
            reject = VoteType::Reject.as_str(),
        );
        let tallies = query_all(&conn, &sql, params![plan_id.to_string()], |row| {
            let session = voting_session_from_row(row)?;
            let total: i64 = row.get(13)?;
            let approve: i64 = row.get(14)?;
            let reject: i64 = row.get(15)?;
            Ok((session, total, approve, reject))
        })?;
        let mut out = Vec::with_capacity(tallies.len());
        for (session, total, approve, reject) in tallies {
            let user_vote = fetch_vote(&conn, session.id, user_id)?;
            out.push(SessionCounts {
                session,
                total_votes: usize::try_from(total).unwrap_or_default(),
                approve_votes: usize::try_from(approve).unwrap_or_default(),
                reject_votes: usize::try_from(reject).unwrap_or_default(),
                user_vote,
            });
        }
        Ok(out)
    }

    fn finalize_voting_session(
        &self,
        session_id: VotingSessionId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<VotingSession>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(old_session) = fetch_session(&tx, session_id)? else {
            return Ok(None);
        };
        let completed = tx.execute(
            "UPDATE voting_sessions SET status = 'completed', decision = ?2, completed_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND status = 'active'",
            params![session_id.to_string(), decision.as_str(), ts(now)],
        )?;
        if completed == 0 {
            return Ok(None);
        }
        let source = old_session.source;
        let old_source = fetch_source(&tx, source)?;
        let status = decision.item_status();
        match source {
            VotingSource::CanvasItem(id) => {
                tx.execute(
                    "UPDATE canvas_items SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.to_string(), status.as_str(), ts(now)],
                )?;
            }
            VotingSource::DetailedSection(id) => {
                let progress: Percent = match decision {
                    Decision::Approved => 100,
                    Decision::Rejected => 0,
                };
                tx.execute(
                    "UPDATE detailed_sections SET status = ?2, progress_percentage = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id.to_string(), status.as_str(), progress, ts(now)],
                )?;
            }
        }
        let new_session = fetch_session(&tx, session_id)?;
        let new_source = fetch_source(&tx, source)?;
        tx.commit()?;

        let plan_id = old_session.plan_id;
        if let Some(new_session) = &new_session {
            self.changes.update(
                plan_id,
                Some(Row::VotingSession(old_session)),
                Row::VotingSession(new_session.clone()),
            );
        }
        if let Some(new_source) = new_source {
            self.changes.update(plan_id, old_source, new_source);
        }
        info!("Voting session {} completed: {}", session_id, decision);
        Ok(new_session)
    }

    fn insert_comment(&self, comment: &Comment) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO comments(id, plan_id, item_id, parent_id, author_id, content, likes, resolved, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                comment.id.to_string(),
                comment.plan_id.to_string(),
                comment.item_id.to_string(),
                comment.parent_id.map(|p| p.to_string()),
                comment.author_id.to_string(),
                comment.content,
                comment.likes,
                comment.resolved,
                ts(comment.created_at),
            ],
        )?;
        self.changes
            .insert(comment.plan_id, Row::Comment(comment.clone()));
        Ok(())
    }

    fn get_comment(&self, comment_id: CommentId) -> StoreResult<Option<Comment>> {
        fetch_comment(&self.conn.lock(), comment_id)
    }

    fn list_comments(&self, item_id: ItemId) -> StoreResult<Vec<Comment>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE item_id = ?1 ORDER BY created_at, rowid"),
            params![item_id.to_string()],
            comment_from_row,
        )
    }

    fn like_comment(&self, comment_id: CommentId) -> StoreResult<Option<Comment>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_comment(&conn, comment_id)? else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE comments SET likes = likes + 1 WHERE id = ?1",
            params![comment_id.to_string()],
        )?;
        let new = fetch_comment(&conn, comment_id)?;
        if let Some(new) = &new {
            self.changes
                .update(new.plan_id, Some(Row::Comment(old)), Row::Comment(new.clone()));
        }
        Ok(new)
    }

    fn resolve_comment(
        &self,
        comment_id: CommentId,
        resolved: bool,
    ) -> StoreResult<Option<Comment>> {
        let conn = self.conn.lock();
        let Some(old) = fetch_comment(&conn, comment_id)? else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE comments SET resolved = ?2 WHERE id = ?1",
            params![comment_id.to_string(), resolved],
        )?;
        let new = fetch_comment(&conn, comment_id)?;
        if let Some(new) = &new {
            self.changes
                .update(new.plan_id, Some(Row::Comment(old)), Row::Comment(new.clone()));
        }
        Ok(new)
    }

    fn insert_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO invitations(id, plan_id, email, token, invited_by, status, expires_at, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                invitation.id.to_string(),
                invitation.plan_id.to_string(),
                invitation.email,
                invitation.token,
                invitation.invited_by.to_string(),
                invitation.status.as_str(),
                ts(invitation.expires_at),
                ts(invitation.created_at),
            ],
        )?;
        self.changes
            .insert(invitation.plan_id, Row::Invitation(invitation.clone()));
        Ok(())
    }

    fn get_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>> {
        fetch_invitation(&self.conn.lock(), token)
    }

    fn list_invitations(&self, plan_id: PlanId) -> StoreResult<Vec<Invitation>> {
        query_all(
            &self.conn.lock(),
            &format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE plan_id = ?1 ORDER BY created_at DESC"),
            params![plan_id.to_string()],
            invitation_from_row,
        )
    }

    fn accept_invitation(
        &self,
        token: &str,
        member: &TeamMember,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TeamMember>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(old_invitation) = fetch_invitation(&tx, token)? else {
            return Ok(None);
        };
        if old_invitation.plan_id != member.plan_id {
            return Ok(None);
        }
        let accepted = tx.execute(
            "UPDATE invitations SET status = 'accepted' \
             WHERE token = ?1 AND status = 'pending' AND expires_at > ?2",
            params![token, ts(now)],
        )?;
        if accepted == 0 {
            return Ok(None);
        }
        let old_member = fetch_member(&tx, member.plan_id, member.user_id)?;
        insert_member(&tx, member)?;
        let new_member = fetch_member(&tx, member.plan_id, member.user_id)?;
        let new_invitation = fetch_invitation(&tx, token)?;
        tx.commit()?;

        let plan_id = member.plan_id;
        if let Some(new_invitation) = new_invitation {
            self.changes.update(
                plan_id,
                Some(Row::Invitation(old_invitation)),
                Row::Invitation(new_invitation),
            );
        }
        if let Some(new_member) = &new_member {
            match old_member {
                Some(old) => self.changes.update(
                    plan_id,
                    Some(Row::TeamMember(old)),
                    Row::TeamMember(new_member.clone()),
                ),
                None => self
                    .changes
                    .insert(plan_id, Row::TeamMember(new_member.clone())),
            }
        }
        Ok(new_member)
    }
}

fn ensure_column(conn: &Connection, table: &str, column: &str, alter_sql: &str) -> StoreResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut exists = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            exists = true;
            break;
        }
    }
    if !exists {
        conn.execute(alter_sql, [])?;
    }
    Ok(())
}

fn record_migration(conn: &Connection, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, ?2)",
        params![name, ts(Utc::now())],
    )?;
    Ok(())
}

fn apply_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))?;
    record_migration(conn, "V0001__init")?;
    conn.execute_batch(include_str!("../migrations/V0002__voting.sql"))?;
    record_migration(conn, "V0002__voting")?;
    conn.execute_batch(include_str!("../migrations/V0003__comments_invitations.sql"))?;
    record_migration(conn, "V0003__comments_invitations")?;
    // Comment reactions (V0004)
    ensure_column(
        conn,
        "comments",
        "likes",
        "ALTER TABLE comments ADD COLUMN likes INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(
        conn,
        "comments",
        "resolved",
        "ALTER TABLE comments ADD COLUMN resolved INTEGER NOT NULL DEFAULT 0",
    )?;
    record_migration(conn, "V0004__comment_reactions")?;
    Ok(())
}
