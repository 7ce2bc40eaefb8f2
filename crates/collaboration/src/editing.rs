/// Content edits: canvas items, detailed sections and comment threads
use std::sync::Arc;

use plan::{
    thread_comments, unmet_dependencies, CanvasItem, Comment, CommentId, CommentThread,
    DetailedSection, ItemId, ItemStatus, SectionId,
};
use store::PlanStore;
use tracing::{debug, info};

use crate::team::require_member;
use crate::{Clock, CollaborationError, DenyReason, LockManager, PlanContext, Result};

#[derive(Clone)]
pub struct EditingService {
    store: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
}

impl EditingService {
    pub fn new(store: Arc<dyn PlanStore>, clock: Arc<dyn Clock>, locks: LockManager) -> Self {
        Self {
            store,
            clock,
            locks,
        }
    }

    fn load_item(&self, ctx: &PlanContext, item_id: ItemId) -> Result<CanvasItem> {
        self.store
            .get_canvas_item(item_id)?
            .filter(|item| item.plan_id == ctx.plan_id)
            .ok_or_else(|| CollaborationError::not_found("canvas item", item_id))
    }

    fn load_section(&self, ctx: &PlanContext, section_id: SectionId) -> Result<DetailedSection> {
        self.store
            .get_detailed_section(section_id)?
            .filter(|section| section.plan_id == ctx.plan_id)
            .ok_or_else(|| CollaborationError::not_found("detailed section", section_id))
    }

    // Canvas items

    /// New draft item in a canvas section. Content may start out blank.
    pub fn create_item(
        &self,
        ctx: &PlanContext,
        section_id: SectionId,
        content: &str,
    ) -> Result<CanvasItem> {
        require_member(self.store.as_ref(), ctx)?;
        self.store
            .get_canvas_section(section_id)?
            .filter(|section| section.plan_id == ctx.plan_id)
            .ok_or_else(|| CollaborationError::not_found("canvas section", section_id))?;
        let now = self.clock.now();
        let mut item = CanvasItem::new(ctx.plan_id, section_id, content.to_string(), ctx.user_id);
        item.created_at = now;
        item.updated_at = now;
        self.store.insert_canvas_item(&item)?;
        debug!("User {} added item {} to section {}", ctx.user_id, item.id, section_id);
        Ok(item)
    }

    /// Replaces the content of an item the caller holds the lock on.
    pub fn update_item(&self, ctx: &PlanContext, item_id: ItemId, content: &str) -> Result<CanvasItem> {
        require_member(self.store.as_ref(), ctx)?;
        let now = self.clock.now();
        if let Some(item) = self
            .store
            .update_canvas_item_content(item_id, ctx.user_id, content, now)?
        {
            return Ok(item);
        }
        let item = self.load_item(ctx, item_id)?;
        if item.status == ItemStatus::Voting {
            return Err(DenyReason::VotingInProgress.into());
        }
        self.locks.ensure_editable(&item, ctx.user_id)?;
        // Lock was live on re-read but the write missed it: lease ran out in between.
        Err(DenyReason::NotLockHolder.into())
    }

    /// Creator or admin only; refused while voting or while someone else edits.
    pub fn delete_item(&self, ctx: &PlanContext, item_id: ItemId) -> Result<CanvasItem> {
        let member = require_member(self.store.as_ref(), ctx)?;
        let item = self.load_item(ctx, item_id)?;
        if item.created_by != ctx.user_id && !member.can_administer() {
            return Err(DenyReason::NotPermitted.into());
        }
        if item.status == ItemStatus::Voting {
            return Err(DenyReason::VotingInProgress.into());
        }
        if item.is_locked_by_other(ctx.user_id, self.clock.now()) {
            return Err(DenyReason::ItemLocked.into());
        }
        let deleted = self
            .store
            .delete_canvas_item(item_id)?
            .ok_or_else(|| CollaborationError::not_found("canvas item", item_id))?;
        info!("User {} deleted item {}", ctx.user_id, item_id);
        Ok(deleted)
    }

    // Detailed sections

    /// Gate for opening a detailed section's editor.
    pub fn start_section_edit(
        &self,
        ctx: &PlanContext,
        section_id: SectionId,
    ) -> Result<DetailedSection> {
        require_member(self.store.as_ref(), ctx)?;
        let section = self.load_section(ctx, section_id)?;
        if section.status == ItemStatus::Voting {
            return Err(DenyReason::VotingInProgress.into());
        }
        let siblings = self.store.list_detailed_sections(ctx.plan_id)?;
        let unmet = unmet_dependencies(&section, &siblings);
        if !unmet.is_empty() {
            debug!(
                "Section {} waits on {}",
                section.section_key,
                unmet.join(", ")
            );
            return Err(DenyReason::DependenciesUnmet.into());
        }
        Ok(section)
    }

    /// Saves content; non-blank content raises progress by one step, blank
    /// content resets it.
    pub fn save_detailed_section(
        &self,
        ctx: &PlanContext,
        section_id: SectionId,
        content: &str,
    ) -> Result<DetailedSection> {
        let section = self.start_section_edit(ctx, section_id)?;
        let progress = section.progress_after_save(content);
        match self.store.update_detailed_section_content(
            section_id,
            content,
            progress,
            self.clock.now(),
        )? {
            Some(saved) => {
                debug!(
                    "Section {} saved at {}%",
                    saved.section_key, saved.progress_percentage
                );
                Ok(saved)
            }
            None => {
                self.load_section(ctx, section_id)?;
                Err(DenyReason::VotingInProgress.into())
            }
        }
    }

    // Comments

    pub fn add_comment(
        &self,
        ctx: &PlanContext,
        item_id: ItemId,
        parent_id: Option<CommentId>,
        content: &str,
    ) -> Result<Comment> {
        require_member(self.store.as_ref(), ctx)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(DenyReason::EmptyContent.into());
        }
        self.load_item(ctx, item_id)?;
        if let Some(parent_id) = parent_id {
            let parent = self
                .store
                .get_comment(parent_id)?
                .ok_or_else(|| CollaborationError::not_found("comment", parent_id))?;
            if parent.item_id != item_id {
                return Err(DenyReason::InvalidInput.into());
            }
            if parent.is_reply() {
                return Err(DenyReason::ReplyDepth.into());
            }
        }
        let comment = Comment {
            id: CommentId::new(),
            plan_id: ctx.plan_id,
            item_id,
            parent_id,
            author_id: ctx.user_id,
            content: content.to_string(),
            likes: 0,
            resolved: false,
            created_at: self.clock.now(),
        };
        self.store.insert_comment(&comment)?;
        Ok(comment)
    }

    fn load_comment(&self, ctx: &PlanContext, comment_id: CommentId) -> Result<Comment> {
        self.store
            .get_comment(comment_id)?
            .filter(|comment| comment.plan_id == ctx.plan_id)
            .ok_or_else(|| CollaborationError::not_found("comment", comment_id))
    }

    pub fn like_comment(&self, ctx: &PlanContext, comment_id: CommentId) -> Result<Comment> {
        require_member(self.store.as_ref(), ctx)?;
        self.load_comment(ctx, comment_id)?;
        self.store
            .like_comment(comment_id)?
            .ok_or_else(|| CollaborationError::not_found("comment", comment_id))
    }

    /// Author or admin only.
    pub fn resolve_comment(
        &self,
        ctx: &PlanContext,
        comment_id: CommentId,
        resolved: bool,
    ) -> Result<Comment> {
        let member = require_member(self.store.as_ref(), ctx)?;
        let comment = self.load_comment(ctx, comment_id)?;
        if comment.author_id != ctx.user_id && !member.can_administer() {
            return Err(DenyReason::NotPermitted.into());
        }
        self.store
            .resolve_comment(comment_id, resolved)?
            .ok_or_else(|| CollaborationError::not_found("comment", comment_id))
    }

    pub fn list_threads(&self, ctx: &PlanContext, item_id: ItemId) -> Result<Vec<CommentThread>> {
        require_member(self.store.as_ref(), ctx)?;
        self.load_item(ctx, item_id)?;
        Ok(thread_comments(self.store.list_comments(item_id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockConfig, ManualClock, TeamService, VotingEngine, VotingPolicy};
    use plan::{Role, TeamMember, UserId, VotingSource};
    use store::SqliteStore;

    struct Fixture {
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        locks: LockManager,
        editing: EditingService,
        owner: PlanContext,
        member: PlanContext,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::default());
        let team = TeamService::new(store.clone(), clock.clone(), "");
        let owner = UserId::new();
        let plan = team.onboard(owner, None, "Edits").unwrap().plan;
        let member = UserId::new();
        store
            .upsert_team_member(&TeamMember::new(plan.id, member, Role::Member, Some(owner)))
            .unwrap();
        let locks = LockManager::new(store.clone(), clock.clone(), LockConfig::default());
        let editing = EditingService::new(store.clone(), clock.clone(), locks.clone());
        Fixture {
            store,
            clock,
            locks,
            editing,
            owner: PlanContext::new(plan.id, owner),
            member: PlanContext::new(plan.id, member),
        }
    }

    impl Fixture {
        fn section_id(&self) -> SectionId {
            self.store.list_canvas_sections(self.owner.plan_id).unwrap()[0].id
        }

        fn detailed(&self, key: &str) -> DetailedSection {
            self.store
                .list_detailed_sections(self.owner.plan_id)
                .unwrap()
                .into_iter()
                .find(|s| s.section_key == key)
                .unwrap()
        }
    }

    #[test]
    fn test_update_requires_lock() {
        let f = fixture();
        let item = f.editing.create_item(&f.member, f.section_id(), "").unwrap();
        assert_eq!(item.status, ItemStatus::Draft);

        let err = f.editing.update_item(&f.member, item.id, "Grain").unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::NotLockHolder));

        f.locks.try_lock(&f.owner, item.id).unwrap();
        let err = f.editing.update_item(&f.member, item.id, "Grain").unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::ItemLocked));

        let updated = f.editing.update_item(&f.owner, item.id, "Grain").unwrap();
        assert_eq!(updated.content, "Grain");
    }

    #[test]
    fn test_no_edits_or_deletes_while_voting() {
        let f = fixture();
        let item = f.editing.create_item(&f.member, f.section_id(), "Grain").unwrap();
        let voting = VotingEngine::new(f.store.clone(), f.clock.clone(), VotingPolicy::default());
        voting
            .create_session(&f.member, VotingSource::CanvasItem(item.id), None)
            .unwrap();
        f.locks.try_lock(&f.member, item.id).unwrap();
        let err = f.editing.update_item(&f.member, item.id, "Rye").unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::VotingInProgress));
        let err = f.editing.delete_item(&f.member, item.id).unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::VotingInProgress));
    }

    #[test]
    fn test_delete_permissions() {
        let f = fixture();
        let mine = f.editing.create_item(&f.owner, f.section_id(), "Oven").unwrap();
        let err = f.editing.delete_item(&f.member, mine.id).unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::NotPermitted));

        let theirs = f.editing.create_item(&f.member, f.section_id(), "Van").unwrap();
        f.locks.try_lock(&f.member, theirs.id).unwrap();
        let err = f.editing.delete_item(&f.owner, theirs.id).unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::ItemLocked));
        f.locks.unlock(&f.member, theirs.id).unwrap();
        f.editing.delete_item(&f.owner, theirs.id).unwrap();
        assert!(f.store.get_canvas_item(theirs.id).unwrap().is_none());
    }

    #[test]
    fn test_section_save_progress_and_gating() {
        let f = fixture();
        let concept = f.detailed("business_concept");
        let mission = f.detailed("mission_vision");
        let err = f
            .editing
            .save_detailed_section(&f.member, mission.id, "Feed the town")
            .unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::DependenciesUnmet));

        let saved = f
            .editing
            .save_detailed_section(&f.member, concept.id, "Bakery")
            .unwrap();
        assert_eq!(saved.progress_percentage, 25);
        let saved = f
            .editing
            .save_detailed_section(&f.member, concept.id, "Bakery and cafe")
            .unwrap();
        assert_eq!(saved.progress_percentage, 50);
        f.editing.start_section_edit(&f.member, mission.id).unwrap();

        let cleared = f
            .editing
            .save_detailed_section(&f.member, concept.id, "  ")
            .unwrap();
        assert_eq!(cleared.progress_percentage, 0);
    }

    #[test]
    fn test_comment_threads() {
        let f = fixture();
        let item = f.editing.create_item(&f.owner, f.section_id(), "Mill").unwrap();
        let top = f
            .editing
            .add_comment(&f.member, item.id, None, "Which mill?")
            .unwrap();
        let reply = f
            .editing
            .add_comment(&f.owner, item.id, Some(top.id), "The old one")
            .unwrap();
        let err = f
            .editing
            .add_comment(&f.member, item.id, Some(reply.id), "Ok")
            .unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::ReplyDepth));
        assert_eq!(
            f.editing
                .add_comment(&f.member, item.id, None, " ")
                .unwrap_err()
                .deny_reason(),
            Some(DenyReason::EmptyContent)
        );

        assert_eq!(f.editing.like_comment(&f.owner, top.id).unwrap().likes, 1);
        let err = f
            .editing
            .resolve_comment(&f.member, reply.id, true)
            .unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::NotPermitted));
        assert!(f.editing.resolve_comment(&f.member, top.id, true).unwrap().resolved);

        let threads = f.editing.list_threads(&f.member, item.id).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].replies.len(), 1);
        assert_eq!(threads[0].replies[0].id, reply.id);
    }
}
