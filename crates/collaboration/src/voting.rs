/// Voting sessions: open from a draft item, collect ballots, apply the outcome
use std::sync::Arc;

use chrono::{DateTime, Utc};
use plan::{
    unmet_dependencies, Decision, ItemStatus, PlanId, Vote, VoteId, VoteType, VotingSession,
    VotingSessionId, VotingSource, SessionStatus,
};
use serde::{Deserialize, Serialize};
use store::{PlanStore, SessionCounts, VoteWrite};
use tracing::{debug, info, warn};

use crate::team::require_member;
use crate::{Clock, CollaborationError, DenyReason, PlanContext, Result};

/// When a session has gathered enough ballots to close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumMode {
    /// Every active team member has voted.
    #[default]
    AllActiveMembers,
    /// The first ballot closes the session.
    SingleReviewer,
}

/// Outcome when approvals and rejections are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    Reject,
    Approve,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingPolicy {
    pub quorum: QuorumMode,
    pub tie_break: TieBreak,
}

/// `active_members` of zero is treated as one.
pub fn quorum_reached(policy: &VotingPolicy, active_members: usize, voters: usize) -> bool {
    match policy.quorum {
        QuorumMode::AllActiveMembers => voters >= active_members.max(1),
        QuorumMode::SingleReviewer => voters >= 1,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: usize,
    pub reject: usize,
}

impl Tally {
    pub fn from_votes(votes: &[Vote]) -> Self {
        votes.iter().fold(Tally::default(), |mut tally, vote| {
            match vote.vote_type {
                VoteType::Approve => tally.approve += 1,
                VoteType::Reject => tally.reject += 1,
            }
            tally
        })
    }

    pub fn total(&self) -> usize {
        self.approve + self.reject
    }

    /// Strict majority wins; no ballots at all is a rejection.
    pub fn decide(&self, tie_break: TieBreak) -> Decision {
        if self.total() == 0 {
            return Decision::Rejected;
        }
        match self.approve.cmp(&self.reject) {
            std::cmp::Ordering::Greater => Decision::Approved,
            std::cmp::Ordering::Less => Decision::Rejected,
            std::cmp::Ordering::Equal => match tie_break {
                TieBreak::Reject => Decision::Rejected,
                TieBreak::Approve => Decision::Approved,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub vote: Vote,
    /// False when an earlier ballot by the same voter was replaced
    pub inserted: bool,
    /// Set when this ballot closed the session
    pub completed: Option<VotingSession>,
}

#[derive(Clone)]
pub struct VotingEngine {
    store: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    policy: VotingPolicy,
}

impl VotingEngine {
    pub fn new(store: Arc<dyn PlanStore>, clock: Arc<dyn Clock>, policy: VotingPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &VotingPolicy {
        &self.policy
    }

    /// Snapshot of a source's (status, title, content), checked against the plan.
    fn load_source(
        &self,
        plan_id: PlanId,
        source: VotingSource,
    ) -> Result<(ItemStatus, String, String)> {
        match source {
            VotingSource::CanvasItem(item_id) => {
                let item = self
                    .store
                    .get_canvas_item(item_id)?
                    .filter(|item| item.plan_id == plan_id)
                    .ok_or_else(|| CollaborationError::not_found("canvas item", item_id))?;
                let title = self
                    .store
                    .get_canvas_section(item.section_id)?
                    .map(|section| section.title)
                    .unwrap_or_else(|| "Canvas item".to_string());
                Ok((item.status, title, item.content))
            }
            VotingSource::DetailedSection(section_id) => {
                let section = self
                    .store
                    .get_detailed_section(section_id)?
                    .filter(|section| section.plan_id == plan_id)
                    .ok_or_else(|| CollaborationError::not_found("detailed section", section_id))?;
                Ok((section.status, section.title, section.content))
            }
        }
    }

    fn blocked_on_dependencies(&self, plan_id: PlanId, source: VotingSource) -> Result<bool> {
        let VotingSource::DetailedSection(section_id) = source else {
            return Ok(false);
        };
        let siblings = self.store.list_detailed_sections(plan_id)?;
        let Some(section) = siblings.iter().find(|s| s.id == section_id) else {
            return Ok(false);
        };
        let unmet = unmet_dependencies(section, &siblings);
        if !unmet.is_empty() {
            debug!("Section {} blocked on {:?}", section.section_key, unmet);
        }
        Ok(!unmet.is_empty())
    }

    /// Opens a session for a draft item and moves the item to `voting`.
    pub fn create_session(
        &self,
        ctx: &PlanContext,
        source: VotingSource,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<VotingSession> {
        require_member(self.store.as_ref(), ctx)?;
        let (status, title, content) = self.load_source(ctx.plan_id, source)?;
        match status {
            ItemStatus::Draft => {}
            ItemStatus::Voting => return Err(DenyReason::VotingInProgress.into()),
            ItemStatus::Approved | ItemStatus::Rejected => return Err(DenyReason::NotDraft.into()),
        }
        if content.trim().is_empty() {
            return Err(DenyReason::EmptyContent.into());
        }
        if self.blocked_on_dependencies(ctx.plan_id, source)? {
            return Err(DenyReason::DependenciesUnmet.into());
        }

        let now = self.clock.now();
        let session = VotingSession {
            id: VotingSessionId::new(),
            plan_id: ctx.plan_id,
            source,
            title,
            content,
            status: SessionStatus::Active,
            decision: None,
            deadline,
            created_by: ctx.user_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        if !self.store.open_voting_session(&session)? {
            // Lost a race with another submitter or an edit; the store
            // rechecks prerequisites inside the same transaction.
            let (status, _, content) = self.load_source(ctx.plan_id, source)?;
            let reason = if status == ItemStatus::Voting {
                DenyReason::VotingInProgress
            } else if content.trim().is_empty() {
                DenyReason::EmptyContent
            } else if self.blocked_on_dependencies(ctx.plan_id, source)? {
                DenyReason::DependenciesUnmet
            } else {
                DenyReason::NotDraft
            };
            return Err(reason.into());
        }
        info!(
            "User {} opened voting session {} on plan {}",
            ctx.user_id, session.id, ctx.plan_id
        );
        Ok(session)
    }

    fn load_session(&self, ctx: &PlanContext, session_id: VotingSessionId) -> Result<VotingSession> {
        self.store
            .get_voting_session(session_id)?
            .filter(|session| session.plan_id == ctx.plan_id)
            .ok_or_else(|| CollaborationError::not_found("voting session", session_id))
    }

    /// Records or replaces the caller's ballot, then checks for quorum.
    pub fn cast_vote(
        &self,
        ctx: &PlanContext,
        session_id: VotingSessionId,
        vote_type: VoteType,
        comment: Option<String>,
    ) -> Result<VoteOutcome> {
        let session = self.load_session(ctx, session_id)?;
        require_member(self.store.as_ref(), ctx)?;
        if session.is_completed() {
            return Err(DenyReason::SessionCompleted.into());
        }
        let now = self.clock.now();
        let ballot = Vote {
            id: VoteId::new(),
            session_id,
            voter_id: ctx.user_id,
            vote_type,
            comment: comment
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            created_at: now,
            updated_at: now,
        };
        let (vote, inserted) = match self.store.upsert_vote(&ballot)? {
            VoteWrite::Inserted(vote) => (vote, true),
            VoteWrite::Updated(vote) => (vote, false),
            VoteWrite::SessionClosed => return Err(DenyReason::SessionCompleted.into()),
            VoteWrite::SessionMissing => {
                return Err(CollaborationError::not_found("voting session", session_id))
            }
        };
        debug!(
            "User {} voted {} on session {}",
            ctx.user_id, vote.vote_type, session_id
        );
        let completed = self.evaluate_completion(session_id)?;
        Ok(VoteOutcome {
            vote,
            inserted,
            completed,
        })
    }

    /// Closes the session if quorum is met. Returns the session only when
    /// this call closed it.
    pub fn evaluate_completion(&self, session_id: VotingSessionId) -> Result<Option<VotingSession>> {
        let session = self
            .store
            .get_voting_session(session_id)?
            .ok_or_else(|| CollaborationError::not_found("voting session", session_id))?;
        if session.is_completed() {
            return Ok(None);
        }
        let active = self.store.count_active_members(session.plan_id)?;
        let voters = self.store.list_votes(session_id)?.len();
        if !quorum_reached(&self.policy, active, voters) {
            debug!(
                "Session {} has {}/{} voters",
                session_id,
                voters,
                active.max(1)
            );
            return Ok(None);
        }
        self.apply_outcome(session_id)
    }

    /// Tallies ballots and writes the decision onto the session and its
    /// source. Safe to call repeatedly: only the first call changes anything.
    pub fn apply_outcome(&self, session_id: VotingSessionId) -> Result<Option<VotingSession>> {
        let votes = self.store.list_votes(session_id)?;
        let tally = Tally::from_votes(&votes);
        let decision = tally.decide(self.policy.tie_break);
        match self
            .store
            .finalize_voting_session(session_id, decision, self.clock.now())?
        {
            Some(session) => {
                info!(
                    "Session {} decided {} ({} approve / {} reject)",
                    session_id, decision, tally.approve, tally.reject
                );
                Ok(Some(session))
            }
            None if self.store.get_voting_session(session_id)?.is_some() => Ok(None),
            None => Err(CollaborationError::not_found("voting session", session_id)),
        }
    }

    /// Finalises every active session whose deadline has passed.
    pub fn close_overdue(&self) -> Result<Vec<VotingSession>> {
        let overdue = self.store.list_overdue_sessions(self.clock.now())?;
        let mut closed = Vec::with_capacity(overdue.len());
        for session in overdue {
            match self.apply_outcome(session.id) {
                Ok(Some(done)) => closed.push(done),
                Ok(None) => {}
                Err(e) => warn!("Failed to close overdue session {}: {}", session.id, e),
            }
        }
        Ok(closed)
    }

    /// Sessions of the plan with ballot counts and the caller's own ballot.
    pub fn sessions_with_counts(&self, ctx: &PlanContext) -> Result<Vec<SessionCounts>> {
        require_member(self.store.as_ref(), ctx)?;
        Ok(self.store.session_counts(ctx.plan_id, ctx.user_id)?)
    }

    pub fn tally(&self, ctx: &PlanContext, session_id: VotingSessionId) -> Result<Tally> {
        self.load_session(ctx, session_id)?;
        Ok(Tally::from_votes(&self.store.list_votes(session_id)?))
    }
}
