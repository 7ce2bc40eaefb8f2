/// Advisory edit locks on canvas items
///
/// Every mutation is one conditional write in the store. A lock carries a
/// lease: once `expires_at` passes it counts as unlocked everywhere, and the
/// holder extends it with `renew`.
use std::sync::Arc;

use plan::{CanvasItem, ItemId, PlanId, UserId};
use serde::{Deserialize, Serialize};
use store::PlanStore;
use tracing::{debug, info, warn};

use crate::team::{require_admin, require_member};
use crate::{Clock, CollaborationError, DenyReason, LockConfig, PlanContext, Result};

/// Lock state of one item as seen by one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    HeldByMe,
    HeldByOther(UserId),
}

impl LockState {
    /// Whether the edit surface may open.
    pub fn can_edit(&self) -> bool {
        !matches!(self, LockState::HeldByOther(_))
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn PlanStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn load(&self, ctx: &PlanContext, item_id: ItemId) -> Result<CanvasItem> {
        match self.store.get_canvas_item(item_id)? {
            Some(item) if item.plan_id == ctx.plan_id => Ok(item),
            _ => Err(CollaborationError::not_found("canvas item", item_id)),
        }
    }

    /// Takes the lock if the item is unlocked (or its lease ran out).
    ///
    /// Returns false without changing anything when someone holds it,
    /// including the caller.
    pub fn try_lock(&self, ctx: &PlanContext, item_id: ItemId) -> Result<bool> {
        require_member(self.store.as_ref(), ctx)?;
        let now = self.clock.now();
        let acquired = self
            .store
            .acquire_item_lock(item_id, ctx.user_id, now, now + self.config.lease())?;
        match acquired {
            Some(_) => {
                debug!("User {} locked item {}", ctx.user_id, item_id);
                Ok(true)
            }
            None => {
                // Distinguish "held" from "gone".
                self.load(ctx, item_id)?;
                Ok(false)
            }
        }
    }

    /// Releases the lock if the caller holds it; anyone else gets false.
    pub fn unlock(&self, ctx: &PlanContext, item_id: ItemId) -> Result<bool> {
        match self.store.release_item_lock(item_id, ctx.user_id)? {
            Some(_) => {
                debug!("User {} unlocked item {}", ctx.user_id, item_id);
                Ok(true)
            }
            None => {
                self.load(ctx, item_id)?;
                Ok(false)
            }
        }
    }

    /// Extends the caller's live lock by one lease.
    pub fn renew(&self, ctx: &PlanContext, item_id: ItemId) -> Result<bool> {
        let now = self.clock.now();
        match self
            .store
            .renew_item_lock(item_id, ctx.user_id, now, now + self.config.lease())?
        {
            Some(_) => Ok(true),
            None => {
                self.load(ctx, item_id)?;
                Ok(false)
            }
        }
    }

    pub fn is_locked(&self, item: &CanvasItem) -> bool {
        item.is_locked(self.clock.now())
    }

    pub fn is_locked_by_me(&self, item: &CanvasItem, user_id: UserId) -> bool {
        item.is_locked_by(user_id, self.clock.now())
    }

    pub fn lock_state(&self, item: &CanvasItem, user_id: UserId) -> LockState {
        match item.live_lock(self.clock.now()) {
            None => LockState::Unlocked,
            Some(lock) if lock.holder == user_id => LockState::HeldByMe,
            Some(lock) => LockState::HeldByOther(lock.holder),
        }
    }

    /// Refuses when another user holds a live lock on the item.
    pub fn can_open_editor(&self, item: &CanvasItem, user_id: UserId) -> bool {
        !(self.is_locked(item) && !self.is_locked_by_me(item, user_id))
    }

    /// Current state read from the store.
    pub fn current_state(&self, ctx: &PlanContext, item_id: ItemId) -> Result<LockState> {
        let item = self.load(ctx, item_id)?;
        Ok(self.lock_state(&item, ctx.user_id))
    }

    /// Disconnect cleanup: drops every lock `user_id` holds, optionally in one plan.
    pub fn release_all_for(&self, user_id: UserId, plan_id: Option<PlanId>) -> Result<Vec<ItemId>> {
        let released = self.store.release_locks_held_by(user_id, plan_id)?;
        if !released.is_empty() {
            info!(
                "Released {} lock(s) held by disconnected user {}",
                released.len(),
                user_id
            );
        }
        Ok(released.into_iter().map(|item| item.id).collect())
    }

    /// Admin override for a lock left behind by someone else.
    pub fn force_unlock(&self, ctx: &PlanContext, item_id: ItemId) -> Result<bool> {
        require_admin(self.store.as_ref(), ctx)?;
        let item = self.load(ctx, item_id)?;
        let previous = item.lock.as_ref().map(|l| l.holder);
        match self.store.force_release_item_lock(item_id)? {
            Some(_) => {
                warn!(
                    "Admin {} force-unlocked item {} (held by {:?})",
                    ctx.user_id, item_id, previous
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clears locks whose lease has run out; returns how many.
    pub fn sweep_expired(&self) -> Result<usize> {
        let released = self.store.release_expired_locks(self.clock.now())?;
        if !released.is_empty() {
            info!("Swept {} expired lock(s)", released.len());
        }
        Ok(released.len())
    }

    /// Denies unless the caller may edit `item` right now.
    pub(crate) fn ensure_editable(&self, item: &CanvasItem, user_id: UserId) -> Result<()> {
        match self.lock_state(item, user_id) {
            LockState::HeldByMe => Ok(()),
            LockState::HeldByOther(_) => Err(DenyReason::ItemLocked.into()),
            LockState::Unlocked => Err(DenyReason::NotLockHolder.into()),
        }
    }
}
