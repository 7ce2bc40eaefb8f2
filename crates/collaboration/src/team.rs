/// Onboarding, membership checks and invitations
use std::sync::Arc;

use plan::{Company, CompanyId, Invitation, Plan, PlanId, Role, TeamMember, UserId};
use serde::{Deserialize, Serialize};
use store::PlanStore;
use tracing::info;

use crate::{Clock, CollaborationError, DenyReason, PlanContext, Result};

/// The caller's membership, if it is active.
pub(crate) fn require_member(store: &dyn PlanStore, ctx: &PlanContext) -> Result<TeamMember> {
    match store.get_team_member(ctx.plan_id, ctx.user_id)? {
        Some(member) if member.is_active() => Ok(member),
        _ => Err(DenyReason::NotAMember.into()),
    }
}

pub(crate) fn require_admin(store: &dyn PlanStore, ctx: &PlanContext) -> Result<TeamMember> {
    let member = require_member(store, ctx)?;
    if member.can_administer() {
        Ok(member)
    } else {
        Err(DenyReason::NotAdmin.into())
    }
}

/// Result of onboarding a new plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub company: Option<Company>,
    pub plan: Plan,
    pub member: TeamMember,
    pub canvas_sections: usize,
    pub detailed_sections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationLink {
    pub invitation: Invitation,
    pub link: String,
}

#[derive(Clone)]
pub struct TeamService {
    store: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    site_url: String,
}

impl TeamService {
    pub fn new(store: Arc<dyn PlanStore>, clock: Arc<dyn Clock>, site_url: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            site_url: site_url.into(),
        }
    }

    /// Creates company, plan and the creator's admin membership, then seeds
    /// the canvas blocks and default detailed sections.
    pub fn onboard(
        &self,
        user_id: UserId,
        company_name: Option<&str>,
        plan_name: &str,
    ) -> Result<Workspace> {
        let company = company_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Company {
                id: CompanyId::new(),
                name: name.to_string(),
                created_by: user_id,
                created_at: self.clock.now(),
            });
        let plan = Plan::new(plan_name.trim(), company.as_ref().map(|c| c.id), user_id)?;
        let member = TeamMember::new(plan.id, user_id, Role::Admin, None);
        self.store
            .create_workspace(company.as_ref(), &plan, &member)?;
        let (canvas_sections, detailed_sections) = self.seed_defaults(plan.id)?;
        info!(
            "Onboarded plan {} ({}) for user {}",
            plan.id, plan.name, user_id
        );
        Ok(Workspace {
            company,
            plan,
            member,
            canvas_sections,
            detailed_sections,
        })
    }

    /// Idempotent; returns how many canvas and detailed sections were created.
    pub fn seed_defaults(&self, plan_id: PlanId) -> Result<(usize, usize)> {
        if self.store.get_plan(plan_id)?.is_none() {
            return Err(CollaborationError::not_found("plan", plan_id));
        }
        let canvas = self.store.seed_canvas_sections(plan_id)?;
        let detailed = self.store.seed_detailed_sections(plan_id)?;
        Ok((canvas, detailed))
    }

    /// The caller's active membership; denied otherwise.
    pub fn membership(&self, ctx: &PlanContext) -> Result<TeamMember> {
        require_member(self.store.as_ref(), ctx)
    }

    pub fn roster(&self, ctx: &PlanContext) -> Result<Vec<TeamMember>> {
        require_member(self.store.as_ref(), ctx)?;
        Ok(self.store.list_team_members(ctx.plan_id)?)
    }

    /// Owners and admins only. Delivery of the link is up to the caller.
    pub fn invite(&self, ctx: &PlanContext, email: &str) -> Result<InvitationLink> {
        require_admin(self.store.as_ref(), ctx)?;
        let invitation = Invitation::new(ctx.plan_id, email, ctx.user_id, self.clock.now())?;
        self.store.insert_invitation(&invitation)?;
        info!(
            "User {} invited {} to plan {}",
            ctx.user_id, invitation.email, ctx.plan_id
        );
        let link = invitation.link(&self.site_url);
        Ok(InvitationLink { invitation, link })
    }

    pub fn list_invitations(&self, ctx: &PlanContext) -> Result<Vec<Invitation>> {
        require_admin(self.store.as_ref(), ctx)?;
        Ok(self.store.list_invitations(ctx.plan_id)?)
    }

    /// Makes `user_id` an active member. A token can be used once.
    pub fn accept_invitation(&self, user_id: UserId, token: &str) -> Result<TeamMember> {
        let invitation = self
            .store
            .get_invitation_by_token(token)?
            .ok_or_else(|| CollaborationError::not_found("invitation", token))?;
        let now = self.clock.now();
        if !invitation.is_acceptable(now) {
            return Err(DenyReason::InvitationInvalid.into());
        }
        let member = TeamMember::new(
            invitation.plan_id,
            user_id,
            Role::Member,
            Some(invitation.invited_by),
        );
        let member = self
            .store
            .accept_invitation(token, &member, now)?
            .ok_or(DenyReason::InvitationInvalid)?;
        info!("User {} joined plan {}", user_id, member.plan_id);
        Ok(member)
    }
}
