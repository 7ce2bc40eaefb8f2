/// Multi-user scenarios across locks, voting, gating, presence and the change feed
use std::sync::{Arc, Barrier};
use std::time::Duration;

use collaboration::*;
use plan::{
    CanvasItem, Decision, DetailedSection, ItemId, ItemStatus, PlanId, Role, TeamMember, UserId,
    VoteType, VotingSource,
};
use store::{ChangeKind, Field, PlanStore, SqliteStore, Table};
use tokio_test::{assert_err, assert_ok};

struct Team {
    collab: Collaboration,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    plan_id: PlanId,
    users: Vec<PlanContext>,
}

/// A plan whose first user is the admin and the rest plain members.
fn team_of(size: usize, policy: VotingPolicy) -> Team {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::default());
    let config = CollabConfig {
        voting: policy,
        ..Default::default()
    };
    let collab = Collaboration::new(store.clone(), clock.clone(), config, "https://plans.test");
    let owner = UserId::new();
    let plan_id = collab
        .team
        .onboard(owner, Some("Acme"), "Bakery")
        .unwrap()
        .plan
        .id;
    let mut users = vec![PlanContext::new(plan_id, owner)];
    for _ in 1..size {
        let user = UserId::new();
        store
            .upsert_team_member(&TeamMember::new(plan_id, user, Role::Member, Some(owner)))
            .unwrap();
        users.push(PlanContext::new(plan_id, user));
    }
    Team {
        collab,
        store,
        clock,
        plan_id,
        users,
    }
}

impl Team {
    fn item(&self, content: &str) -> CanvasItem {
        let section = self.store.list_canvas_sections(self.plan_id).unwrap()[0].id;
        self.collab
            .editing
            .create_item(&self.users[0], section, content)
            .unwrap()
    }

    fn detailed(&self, key: &str) -> DetailedSection {
        self.store
            .list_detailed_sections(self.plan_id)
            .unwrap()
            .into_iter()
            .find(|s| s.section_key == key)
            .unwrap()
    }
}

#[test]
fn test_empty_item_cannot_be_submitted() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("");
    let err = team
        .collab
        .voting
        .create_session(&team.users[1], VotingSource::CanvasItem(item.id), None)
        .unwrap_err();
    assert_eq!(err.deny_reason(), Some(DenyReason::EmptyContent));
    let stored = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Draft);
    assert!(team.store.list_voting_sessions(team.plan_id).unwrap().is_empty());
}

#[test]
fn test_simultaneous_lock_attempts_have_one_winner() {
    let team = team_of(8, VotingPolicy::default());
    let item = team.item("Ovens");
    let barrier = Barrier::new(team.users.len());
    let results: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = team
            .users
            .iter()
            .map(|ctx| {
                let locks = team.collab.locks.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    locks.try_lock(ctx, item.id).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|won| **won).count(), 1);

    let winner = team.users[results.iter().position(|won| *won).unwrap()];
    let stored = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert_eq!(stored.lock.unwrap().holder, winner.user_id);

    // Nobody else gets in until the winner lets go.
    let loser = team.users.iter().find(|u| **u != winner).unwrap();
    assert!(!team.collab.locks.try_lock(loser, item.id).unwrap());
    assert!(team.collab.locks.unlock(&winner, item.id).unwrap());
    assert!(team.collab.locks.try_lock(loser, item.id).unwrap());
}

#[test]
fn test_three_members_majority_approves_on_last_vote() {
    let team = team_of(3, VotingPolicy::default());
    let item = team.item("Local mills");
    let voting = &team.collab.voting;
    let session = voting
        .create_session(&team.users[0], VotingSource::CanvasItem(item.id), None)
        .unwrap();

    let first = voting
        .cast_vote(&team.users[0], session.id, VoteType::Approve, None)
        .unwrap();
    let second = voting
        .cast_vote(&team.users[1], session.id, VoteType::Reject, None)
        .unwrap();
    assert!(first.completed.is_none());
    assert!(second.completed.is_none());
    let open = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert_eq!(open.status, ItemStatus::Voting);

    let third = voting
        .cast_vote(&team.users[2], session.id, VoteType::Approve, None)
        .unwrap();
    let done = third.completed.expect("third ballot closes the session");
    assert_eq!(done.decision, Some(Decision::Approved));
    let stored = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Approved);
}

#[test]
fn test_two_members_tie_is_rejected() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("Food trucks");
    let voting = &team.collab.voting;
    let session = voting
        .create_session(&team.users[1], VotingSource::CanvasItem(item.id), None)
        .unwrap();
    voting
        .cast_vote(&team.users[0], session.id, VoteType::Approve, None)
        .unwrap();
    let last = voting
        .cast_vote(&team.users[1], session.id, VoteType::Reject, None)
        .unwrap();
    assert_eq!(last.completed.unwrap().decision, Some(Decision::Rejected));
    let stored = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Rejected);
}

#[test]
fn test_tie_break_is_configurable() {
    let team = team_of(
        2,
        VotingPolicy {
            tie_break: TieBreak::Approve,
            ..Default::default()
        },
    );
    let item = team.item("Catering");
    let voting = &team.collab.voting;
    let session = voting
        .create_session(&team.users[0], VotingSource::CanvasItem(item.id), None)
        .unwrap();
    voting
        .cast_vote(&team.users[0], session.id, VoteType::Reject, None)
        .unwrap();
    let last = voting
        .cast_vote(&team.users[1], session.id, VoteType::Approve, None)
        .unwrap();
    assert_eq!(last.completed.unwrap().decision, Some(Decision::Approved));
}

#[test]
fn test_dependency_gating_opens_after_approval() {
    let team = team_of(1, VotingPolicy::default());
    let ctx = team.users[0];
    let a = team.detailed("business_concept");
    let b = team.detailed("mission_vision");
    assert!(b.dependencies.contains(&a.section_key));

    // A in draft at 20%
    team.store
        .update_detailed_section_content(a.id, "Neighbourhood bakery", 20, team.clock.now())
        .unwrap();
    let editing = &team.collab.editing;
    let err = editing.start_section_edit(&ctx, b.id).unwrap_err();
    assert_eq!(err.deny_reason(), Some(DenyReason::DependenciesUnmet));

    // B cannot be submitted either, even with content.
    team.store
        .update_detailed_section_content(b.id, "Bread for everyone", 25, team.clock.now())
        .unwrap();
    let err = team
        .collab
        .voting
        .create_session(&ctx, VotingSource::DetailedSection(b.id), None)
        .unwrap_err();
    assert_eq!(err.deny_reason(), Some(DenyReason::DependenciesUnmet));

    // Approve A: the sole member's ballot is quorum.
    let session = team
        .collab
        .voting
        .create_session(&ctx, VotingSource::DetailedSection(a.id), None)
        .unwrap();
    let outcome = team
        .collab
        .voting
        .cast_vote(&ctx, session.id, VoteType::Approve, None)
        .unwrap();
    assert!(outcome.completed.is_some());
    let a = team.detailed("business_concept");
    assert_eq!(a.status, ItemStatus::Approved);
    assert_eq!(a.progress_percentage, 100);

    assert_ok!(editing.start_section_edit(&ctx, b.id));
    assert_ok!(team
        .collab
        .voting
        .create_session(&ctx, VotingSource::DetailedSection(b.id), None));
}

#[tokio::test]
async fn test_disconnect_releases_locks_and_presence() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("Delivery bikes");
    let ctx = team.users[1];
    let observer = team.users[0];

    let tracker = PresenceTracker::join(
        &team.collab.presence,
        ctx,
        User::new(ctx.user_id, "Bo".into()),
    )
    .await;
    assert!(tracker.is_connected());
    assert_eq!(tracker.roster().len(), 1);

    assert!(team.collab.locks.try_lock(&ctx, item.id).unwrap());
    let before = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert!(team.collab.locks.is_locked(&before));
    assert!(!team.collab.locks.can_open_editor(&before, observer.user_id));

    tracker.leave();
    let released = team.collab.disconnect(&ctx).unwrap();
    assert_eq!(released, vec![item.id]);

    let after = team.store.get_canvas_item(item.id).unwrap().unwrap();
    assert!(!team.collab.locks.is_locked(&after));
    assert!(team.collab.locks.can_open_editor(&after, observer.user_id));
    tokio::time::timeout(Duration::from_secs(1), async {
        while !team.collab.presence.roster(team.plan_id).is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_sweep_ages_presence_once() {
    let team = team_of(2, VotingPolicy::default());
    let ctx = team.users[1];
    let mut events = team.collab.presence.subscribe();
    let tracker = PresenceTracker::join(
        &team.collab.presence,
        ctx,
        User::new(ctx.user_id, "Bo".into()),
    )
    .await;
    let (_, joined) = events.recv().await.unwrap();
    assert!(matches!(joined, PresenceUpdate::UserJoined { .. }));

    team.clock.advance(chrono::Duration::minutes(10));
    assert_ok!(team.collab.sweep());
    let (_, left) = events.recv().await.unwrap();
    assert_eq!(left, PresenceUpdate::UserLeft { user_id: ctx.user_id });

    // Activity after eviction comes straight back; no second departure in between.
    tracker.update_metadata(None);
    let (_, back) = events.recv().await.unwrap();
    assert!(matches!(back, PresenceUpdate::UserJoined { .. }));
    let (_, moved) = events.recv().await.unwrap();
    assert!(matches!(moved, PresenceUpdate::CursorMoved { .. }));
    assert!(tracker.is_connected());
    assert_eq!(team.collab.presence.roster(team.plan_id).len(), 1);
}

#[test]
fn test_repeated_ballots_keep_one_row_with_latest_value() {
    let team = team_of(3, VotingPolicy::default());
    let item = team.item("Pricing tiers");
    let voting = &team.collab.voting;
    let session = voting
        .create_session(&team.users[0], VotingSource::CanvasItem(item.id), None)
        .unwrap();
    let values = [VoteType::Approve, VoteType::Reject, VoteType::Approve, VoteType::Reject];
    for (i, vote_type) in values.iter().enumerate() {
        voting
            .cast_vote(&team.users[1], session.id, *vote_type, Some(format!("take {i}")))
            .unwrap();
    }
    let votes = team.store.list_votes(session.id).unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].vote_type, VoteType::Reject);
    assert_eq!(votes[0].comment.as_deref(), Some("take 3"));
    assert!(!team.store.get_voting_session(session.id).unwrap().unwrap().is_completed());
}

#[tokio::test]
async fn test_outcome_applies_once() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("Franchise");
    let voting = team.collab.voting.clone();
    let session = voting
        .create_session(&team.users[0], VotingSource::CanvasItem(item.id), None)
        .unwrap();
    voting
        .cast_vote(&team.users[0], session.id, VoteType::Approve, None)
        .unwrap();

    let mut changes = team.collab.feed.stream(
        ResourceDescriptor::table(Table::CanvasItems)
            .filter(Field::ItemId, item.id.0)
            .events([ChangeKind::Update]),
    );

    // Server-side trigger and a client fallback racing.
    let racers: Vec<_> = (0..4)
        .map(|_| {
            let voting = voting.clone();
            let id = session.id;
            tokio::task::spawn_blocking(move || voting.apply_outcome(id).unwrap())
        })
        .collect();
    let mut applied = 0;
    for racer in racers {
        if racer.await.unwrap().is_some() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let first = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, FeedEvent::Change(ref c) if c.kind == ChangeKind::Update));
    let extra = tokio::time::timeout(Duration::from_millis(50), changes.recv()).await;
    assert!(extra.is_err(), "source item was updated more than once");

    let stored = team.store.get_voting_session(session.id).unwrap().unwrap();
    assert_eq!(stored.decision, Some(Decision::Approved));
    let err = voting
        .cast_vote(&team.users[1], session.id, VoteType::Reject, None)
        .unwrap_err();
    assert_eq!(err.deny_reason(), Some(DenyReason::SessionCompleted));
}

#[test]
fn test_quorum_tracks_accepted_invitations() {
    let team = team_of(1, VotingPolicy::default());
    let owner = team.users[0];
    let invite = team.collab.team.invite(&owner, "new@example.com").unwrap();

    // A pending invitation does not change the denominator.
    let first = team.item("Bulk flour");
    let session = team
        .collab
        .voting
        .create_session(&owner, VotingSource::CanvasItem(first.id), None)
        .unwrap();
    let outcome = team
        .collab
        .voting
        .cast_vote(&owner, session.id, VoteType::Approve, None)
        .unwrap();
    assert!(outcome.completed.is_some());

    let newcomer = UserId::new();
    team.collab
        .team
        .accept_invitation(newcomer, &invite.invitation.token)
        .unwrap();
    let second = team.item("Organic flour");
    let session = team
        .collab
        .voting
        .create_session(&owner, VotingSource::CanvasItem(second.id), None)
        .unwrap();
    let outcome = team
        .collab
        .voting
        .cast_vote(&owner, session.id, VoteType::Approve, None)
        .unwrap();
    assert!(outcome.completed.is_none());
    let outcome = team
        .collab
        .voting
        .cast_vote(
            &PlanContext::new(team.plan_id, newcomer),
            session.id,
            VoteType::Approve,
            None,
        )
        .unwrap();
    assert_eq!(outcome.completed.unwrap().decision, Some(Decision::Approved));
}

#[test]
fn test_progress_is_deterministic_and_persisted() {
    let team = team_of(2, VotingPolicy::default());
    let approved = team.item("Wholesale");
    team.item("Retail");
    let session = team
        .collab
        .voting
        .create_session(&team.users[0], VotingSource::CanvasItem(approved.id), None)
        .unwrap();
    for ctx in &team.users {
        team.collab
            .voting
            .cast_vote(ctx, session.id, VoteType::Approve, None)
            .unwrap();
    }

    let first = team.collab.progress.recompute(team.plan_id).unwrap();
    let second = team.collab.progress.recompute(team.plan_id).unwrap();
    assert_eq!(first, second);
    // one canvas section at 50%, eight empty ones
    assert_eq!(first.canvas_progress, 6);
    assert_eq!(first.approved_sections, 1);
    assert_eq!(first.active_members, 2);
    let plan = team.store.get_plan(team.plan_id).unwrap().unwrap();
    assert_eq!(plan.progress_percentage, first.overall_progress);
}

#[tokio::test]
async fn test_command_round_trip_with_change_confirmation() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("Seasonal menu");
    let ctx = team.users[1];
    let item_id = item.id;

    let (outcome, change) = team
        .collab
        .feed
        .await_change(
            ResourceDescriptor::for_plan(Table::CanvasItems, team.plan_id),
            move |c| c.kind == ChangeKind::Update && c.matches(Field::UserId, ctx.user_id.0),
            Duration::from_secs(1),
            || team.collab.execute(&ctx, Command::Lock { item_id }),
        )
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Locked { item_id });
    assert_eq!(change.plan_id, team.plan_id);

    let denied = team
        .collab
        .execute(&team.users[0], Command::Lock { item_id });
    let replies = reply_for(9, &denied);
    assert!(matches!(replies[0], SyncMessage::Denied { ref code, .. } if code == "item_locked"));
    assert!(matches!(replies[1], SyncMessage::Notice { .. }));

    let updated = assert_ok!(team.collab.execute(
        &ctx,
        Command::UpdateItem {
            item_id,
            content: "Seasonal menu, rotating monthly".into(),
        },
    ));
    assert!(matches!(updated, CommandOutcome::Item { ref item } if item.content.ends_with("monthly")));
    assert_ok!(team.collab.execute(&ctx, Command::Unlock { item_id }));
    assert_err!(team.collab.execute(&ctx, Command::Unlock { item_id }));

    let missing = team.collab.execute(
        &ctx,
        Command::DeleteItem {
            item_id: ItemId::new(),
        },
    );
    assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_poll_with_backoff_sees_committed_outcome() {
    let team = team_of(1, VotingPolicy::default());
    let item = team.item("Loyalty card");
    let ctx = team.users[0];
    let session = team
        .collab
        .voting
        .create_session(&ctx, VotingSource::CanvasItem(item.id), None)
        .unwrap();
    let voting = team.collab.voting.clone();
    let writer = tokio::task::spawn_blocking(move || {
        voting.cast_vote(&ctx, session.id, VoteType::Approve, None)
    });

    let store = team.store.clone();
    let item_id = item.id;
    let status = poll_with_backoff(&RetryPolicy::default(), "item decision", || {
        let store = store.clone();
        async move {
            let item = store.get_canvas_item(item_id)?;
            Ok(item
                .map(|i| i.status)
                .filter(|s| *s != ItemStatus::Voting))
        }
    })
    .await
    .unwrap();
    assert_eq!(status, ItemStatus::Approved);
    assert_ok!(writer.await.unwrap());
}

#[test]
fn test_expired_lease_and_overdue_sweep() {
    let team = team_of(2, VotingPolicy::default());
    let item = team.item("Night shift");
    let other = team.item("Morning shift");
    let ctx = team.users[1];
    assert!(team.collab.locks.try_lock(&ctx, item.id).unwrap());
    let deadline = team.clock.now() + chrono::Duration::minutes(10);
    let session = team
        .collab
        .voting
        .create_session(&ctx, VotingSource::CanvasItem(other.id), Some(deadline))
        .unwrap();

    team.clock.advance(chrono::Duration::hours(1));
    let report = team.collab.sweep().unwrap();
    assert_eq!(report.expired_locks, 1);
    assert_eq!(report.closed_sessions, vec![session.id]);
    let closed = team.store.get_canvas_item(other.id).unwrap().unwrap();
    // nobody voted
    assert_eq!(closed.status, ItemStatus::Rejected);
    assert!(team.collab.locks.try_lock(&team.users[0], item.id).unwrap());
}
