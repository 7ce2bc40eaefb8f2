/// User presence tracking for plan rooms
/// Shows who is online in a plan and where their cursor is
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use plan::{ItemId, PlanId, SectionId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Clock, PlanContext, PresenceConfig};

/// User information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub color: UserColor,
    pub avatar_url: Option<String>,
}

impl User {
    pub fn new(id: UserId, name: String) -> Self {
        Self {
            id,
            name,
            color: UserColor::from_user_id(id),
            avatar_url: None,
        }
    }
}

/// Color assigned to a user for cursor highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: UserId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Cursor position on the plan board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    pub section_id: Option<SectionId>,
    pub item_id: Option<ItemId>,
}

/// One connected user's state in a plan room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user: User,
    pub plan_id: PlanId,
    pub online_at: DateTime<Utc>,
    pub cursor_position: Option<CursorPosition>,
    pub last_activity: DateTime<Utc>,
}

impl UserPresence {
    pub fn new(user: User, plan_id: PlanId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            plan_id,
            online_at: now,
            cursor_position: None,
            last_activity: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_after: Duration) -> bool {
        now - self.last_activity > idle_after
    }
}

/// Roster of one room
///
/// A user may hold several connections (tabs). They stay on the roster until
/// the last one leaves. Users evicted for inactivity while still connected are
/// kept dormant and come back on their next activity.
#[derive(Debug, Clone, Default)]
pub struct PresenceManager {
    users: HashMap<UserId, UserPresence>,
    dormant: HashMap<UserId, UserPresence>,
    connections: HashMap<UserId, usize>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace user presence; returns true if the user was not present.
    pub fn update_user(&mut self, presence: UserPresence) -> bool {
        self.users.insert(presence.user.id, presence).is_none()
    }

    /// Registers one more connection for the user. Returns the presence to
    /// announce when the user was not on the roster yet.
    pub fn connect(&mut self, presence: UserPresence, now: DateTime<Utc>) -> Option<UserPresence> {
        let user_id = presence.user.id;
        *self.connections.entry(user_id).or_insert(0) += 1;
        if let Some(existing) = self.users.get_mut(&user_id) {
            existing.touch(now);
            return None;
        }
        self.dormant.remove(&user_id);
        self.users.insert(user_id, presence.clone());
        Some(presence)
    }

    /// Drops one connection. Returns the removed presence once the user's
    /// last connection is gone and they were on the roster.
    pub fn disconnect(&mut self, user_id: &UserId) -> Option<UserPresence> {
        match self.connections.get_mut(user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return None;
            }
            Some(_) => {
                self.connections.remove(user_id);
            }
            None => {}
        }
        self.dormant.remove(user_id);
        self.users.remove(user_id)
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.connections.get(user_id).copied().unwrap_or(0)
    }

    /// Puts a dormant user back on the roster.
    pub fn wake(&mut self, user_id: UserId, now: DateTime<Utc>) -> Option<UserPresence> {
        let mut presence = self.dormant.remove(&user_id)?;
        presence.touch(now);
        self.users.insert(user_id, presence.clone());
        Some(presence)
    }

    pub fn remove_user(&mut self, user_id: &UserId) -> Option<UserPresence> {
        self.connections.remove(user_id);
        self.dormant.remove(user_id);
        self.users.remove(user_id)
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    /// No roster entries and no live connections.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.connections.is_empty()
    }

    pub fn get_active_users(&self, now: DateTime<Utc>, idle_after: Duration) -> Vec<&UserPresence> {
        self.users
            .values()
            .filter(|p| !p.is_idle(now, idle_after))
            .collect()
    }

    /// All users, earliest arrival first.
    pub fn snapshot(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self.users.values().cloned().collect();
        users.sort_by(|a, b| {
            a.online_at
                .cmp(&b.online_at)
                .then_with(|| a.user.id.cmp(&b.user.id))
        });
        users
    }

    pub fn update_cursor(
        &mut self,
        user_id: UserId,
        cursor: Option<CursorPosition>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.users.get_mut(&user_id) {
            Some(presence) => {
                presence.cursor_position = cursor;
                presence.touch(now);
                true
            }
            None => false,
        }
    }

    /// Users whose cursor currently rests on `item_id`.
    pub fn get_users_on_item(&self, item_id: ItemId) -> Vec<&UserPresence> {
        self.users
            .values()
            .filter(|p| {
                p.cursor_position
                    .as_ref()
                    .and_then(|c| c.item_id)
                    .map(|id| id == item_id)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Takes users inactive for longer than `evict_after` off the roster.
    /// Those still connected turn dormant.
    pub fn cleanup_idle_users(&mut self, now: DateTime<Utc>, evict_after: Duration) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .users
            .values()
            .filter(|p| now - p.last_activity > evict_after)
            .map(|p| p.user.id)
            .collect();
        for user_id in &stale {
            if let Some(presence) = self.users.remove(user_id) {
                if self.connections.contains_key(user_id) {
                    self.dormant.insert(*user_id, presence);
                }
            }
        }
        stale
    }
}

/// Presence update message (sent via WebSocket)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceUpdate {
    #[serde(rename = "user_joined")]
    UserJoined { presence: UserPresence },

    #[serde(rename = "user_left")]
    UserLeft { user_id: UserId },

    #[serde(rename = "cursor_moved")]
    CursorMoved {
        user_id: UserId,
        position: Option<CursorPosition>,
    },

    #[serde(rename = "user_idle")]
    UserIdle { user_id: UserId },
}

enum RoomCommand {
    Join {
        presence: UserPresence,
        joined: oneshot::Sender<()>,
    },
    Cursor {
        user_id: UserId,
        cursor: Option<CursorPosition>,
    },
    Leave {
        user_id: UserId,
    },
    Sweep,
}

#[derive(Clone)]
struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
    roster: watch::Receiver<Vec<UserPresence>>,
}

/// Owns one actor task per active plan room.
#[derive(Clone)]
pub struct PresenceHub {
    rooms: Arc<Mutex<HashMap<PlanId, RoomHandle>>>,
    events: broadcast::Sender<(PlanId, PresenceUpdate)>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceHub {
    pub fn new(clock: Arc<dyn Clock>, config: PresenceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            events,
            clock,
            config,
        }
    }

    /// Join/leave/cursor events of every room.
    pub fn subscribe(&self) -> broadcast::Receiver<(PlanId, PresenceUpdate)> {
        self.events.subscribe()
    }

    /// Current roster of a room; empty when nobody is connected.
    pub fn roster(&self, plan_id: PlanId) -> Vec<UserPresence> {
        self.rooms
            .lock()
            .get(&plan_id)
            .map(|room| room.roster.borrow().clone())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Evicts long-inactive users in every room.
    pub fn sweep(&self) {
        let rooms: Vec<RoomHandle> = self.rooms.lock().values().cloned().collect();
        for room in rooms {
            let _ = room.tx.send(RoomCommand::Sweep);
        }
    }

    fn room(&self, plan_id: PlanId) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get(&plan_id) {
            if !room.tx.is_closed() {
                return room.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (roster_tx, roster) = watch::channel(Vec::new());
        tokio::spawn(run_room(
            plan_id,
            rx,
            roster_tx,
            self.events.clone(),
            self.rooms.clone(),
            self.clock.clone(),
            self.config.clone(),
        ));
        debug!("Opened presence room for plan {}", plan_id);
        let handle = RoomHandle { tx, roster };
        rooms.insert(plan_id, handle.clone());
        handle
    }

    async fn try_join(&self, presence: &UserPresence) -> Option<RoomHandle> {
        // A room that just emptied may exit between lookup and send; retry once.
        for _ in 0..2 {
            let room = self.room(presence.plan_id);
            let (joined, ack) = oneshot::channel();
            let sent = room.tx.send(RoomCommand::Join {
                presence: presence.clone(),
                joined,
            });
            if sent.is_ok() && ack.await.is_ok() {
                return Some(room);
            }
        }
        None
    }
}

async fn run_room(
    plan_id: PlanId,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    roster_tx: watch::Sender<Vec<UserPresence>>,
    events: broadcast::Sender<(PlanId, PresenceUpdate)>,
    rooms: Arc<Mutex<HashMap<PlanId, RoomHandle>>>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
) {
    let mut manager = PresenceManager::new();
    let mut idle: Vec<UserId> = Vec::new();
    while let Some(command) = rx.recv().await {
        let now = clock.now();
        let mut updates = Vec::new();
        let mut ack = None;
        let mut departed = false;
        match command {
            RoomCommand::Join { presence, joined } => {
                let user_id = presence.user.id;
                idle.retain(|id| *id != user_id);
                // Another tab of a listed user is not announced again.
                if let Some(presence) = manager.connect(presence, now) {
                    updates.push(PresenceUpdate::UserJoined { presence });
                }
                ack = Some(joined);
            }
            RoomCommand::Cursor { user_id, cursor } => {
                if let Some(presence) = manager.wake(user_id, now) {
                    updates.push(PresenceUpdate::UserJoined { presence });
                }
                if manager.update_cursor(user_id, cursor.clone(), now) {
                    idle.retain(|id| *id != user_id);
                    updates.push(PresenceUpdate::CursorMoved {
                        user_id,
                        position: cursor,
                    });
                }
            }
            RoomCommand::Leave { user_id } => {
                departed = true;
                if manager.disconnect(&user_id).is_some() {
                    idle.retain(|id| *id != user_id);
                    updates.push(PresenceUpdate::UserLeft { user_id });
                }
            }
            RoomCommand::Sweep => {
                for user_id in manager.cleanup_idle_users(now, config.evict_after()) {
                    departed = true;
                    idle.retain(|id| *id != user_id);
                    updates.push(PresenceUpdate::UserLeft { user_id });
                }
                let newly_idle: Vec<UserId> = manager
                    .snapshot()
                    .into_iter()
                    .filter(|p| p.is_idle(now, config.idle_after()) && !idle.contains(&p.user.id))
                    .map(|p| p.user.id)
                    .collect();
                for user_id in newly_idle {
                    idle.push(user_id);
                    updates.push(PresenceUpdate::UserIdle { user_id });
                }
            }
        }
        if !updates.is_empty() || ack.is_some() {
            let _ = roster_tx.send(manager.snapshot());
        }
        if let Some(joined) = ack {
            let _ = joined.send(());
        }
        for update in updates {
            let _ = events.send((plan_id, update));
        }
        if departed && manager.is_empty() {
            // Unregister under the hub lock so no join can slip in unseen.
            let mut rooms = rooms.lock();
            if rx.is_empty() {
                rooms.remove(&plan_id);
                rx.close();
                debug!("Closed empty presence room for plan {}", plan_id);
                break;
            }
        }
    }
}

/// One connection's membership in a plan room.
///
/// Never fails to construct: without a reachable room it reports an empty
/// roster and `is_connected() == false`.
pub struct PresenceTracker {
    ctx: PlanContext,
    room: Option<RoomHandle>,
    connected: Arc<AtomicBool>,
    watchers: Vec<JoinHandle<()>>,
}

impl PresenceTracker {
    pub async fn join(hub: &PresenceHub, ctx: PlanContext, user: User) -> Self {
        let presence = UserPresence::new(user, ctx.plan_id, hub.clock.now());
        let room = hub.try_join(&presence).await;
        if room.is_none() {
            warn!(
                "User {} could not join presence room for plan {}",
                ctx.user_id, ctx.plan_id
            );
        }
        Self {
            ctx,
            connected: Arc::new(AtomicBool::new(room.is_some())),
            room,
            watchers: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> PlanContext {
        self.ctx
    }

    /// Fire-and-forget cursor update.
    pub fn update_metadata(&self, cursor: Option<CursorPosition>) {
        let Some(room) = &self.room else { return };
        let sent = room.tx.send(RoomCommand::Cursor {
            user_id: self.ctx.user_id,
            cursor,
        });
        if sent.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn roster(&self) -> Vec<UserPresence> {
        match &self.room {
            Some(room) if self.is_connected() => room.roster.borrow().clone(),
            _ => Vec::new(),
        }
    }

    /// Calls `callback` with the full roster after every change.
    pub fn on_roster_changed<F>(&mut self, callback: F)
    where
        F: Fn(&[UserPresence]) + Send + 'static,
    {
        let Some(room) = &self.room else { return };
        let mut roster = room.roster.clone();
        let connected = self.connected.clone();
        self.watchers.push(tokio::spawn(async move {
            while roster.changed().await.is_ok() {
                let snapshot = roster.borrow_and_update().clone();
                callback(&snapshot);
            }
            connected.store(false, Ordering::SeqCst);
        }));
    }

    pub fn leave(mut self) {
        self.leave_room();
    }

    fn leave_room(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(room) = self.room.take() {
            let _ = room.tx.send(RoomCommand::Leave {
                user_id: self.ctx.user_id,
            });
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.leave_room();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, SystemClock};
    use std::time::Duration as StdDuration;

    fn user(name: &str) -> User {
        User::new(UserId::new(), name.to_string())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(StdDuration::from_secs(1), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_user_color_from_id() {
        let color = UserColor::from_user_id(UserId::new());
        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn test_presence_manager() {
        let now = Utc::now();
        let mut manager = PresenceManager::new();
        let alice = user("Alice");
        let item = ItemId::new();
        assert!(manager.update_user(UserPresence::new(alice.clone(), PlanId::new(), now)));
        assert!(manager.update_cursor(
            alice.id,
            Some(CursorPosition {
                x: 10.0,
                y: 20.0,
                section_id: None,
                item_id: Some(item),
            }),
            now,
        ));
        assert_eq!(manager.get_users_on_item(item).len(), 1);
        assert!(!manager.update_cursor(UserId::new(), None, now));
    }

    #[test]
    fn test_idle_detection_and_eviction() {
        let now = Utc::now();
        let mut manager = PresenceManager::new();
        let mut presence = UserPresence::new(user("Bob"), PlanId::new(), now);
        assert!(!presence.is_idle(now, Duration::seconds(60)));
        presence.last_activity = now - Duration::seconds(120);
        assert!(presence.is_idle(now, Duration::seconds(60)));

        let bob = presence.user.id;
        manager.update_user(presence);
        assert!(manager.cleanup_idle_users(now, Duration::seconds(300)).is_empty());
        assert_eq!(
            manager.cleanup_idle_users(now + Duration::seconds(300), Duration::seconds(300)),
            vec![bob]
        );
    }

    #[test]
    fn test_connections_counted_per_user() {
        let now = Utc::now();
        let mut manager = PresenceManager::new();
        let alice = user("Alice");
        let plan_id = PlanId::new();
        assert!(manager.connect(UserPresence::new(alice.clone(), plan_id, now), now).is_some());
        assert!(manager.connect(UserPresence::new(alice.clone(), plan_id, now), now).is_none());
        assert_eq!(manager.connection_count(&alice.id), 2);

        assert!(manager.disconnect(&alice.id).is_none());
        assert!(manager.get_user(&alice.id).is_some());
        assert!(manager.disconnect(&alice.id).is_some());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_evicted_connected_user_turns_dormant() {
        let now = Utc::now();
        let mut manager = PresenceManager::new();
        let alice = user("Alice");
        manager.connect(UserPresence::new(alice.clone(), PlanId::new(), now), now);

        let later = now + Duration::seconds(400);
        assert_eq!(manager.cleanup_idle_users(later, Duration::seconds(300)), vec![alice.id]);
        assert!(manager.snapshot().is_empty());
        assert!(!manager.is_empty());

        let woken = manager.wake(alice.id, later).unwrap();
        assert_eq!(woken.last_activity, later);
        assert_eq!(manager.snapshot().len(), 1);
        assert!(manager.wake(alice.id, later).is_none());
    }

    #[tokio::test]
    async fn test_second_tab_keeps_user_listed() {
        let hub = PresenceHub::new(Arc::new(SystemClock), PresenceConfig::default());
        let mut events = hub.subscribe();
        let plan_id = PlanId::new();
        let alice = user("Alice");
        let ctx = PlanContext::new(plan_id, alice.id);

        let tab1 = PresenceTracker::join(&hub, ctx, alice.clone()).await;
        let tab2 = PresenceTracker::join(&hub, ctx, alice.clone()).await;
        assert_eq!(tab2.roster().len(), 1);

        tab1.leave();
        // Processed after the leave; the room is FIFO.
        tab2.update_metadata(None);
        let (_, update) = events.recv().await.unwrap();
        assert!(matches!(update, PresenceUpdate::UserJoined { .. }));
        let (_, update) = events.recv().await.unwrap();
        assert!(matches!(update, PresenceUpdate::CursorMoved { user_id, .. } if user_id == alice.id));

        assert!(tab2.is_connected());
        assert_eq!(hub.roster(plan_id).len(), 1);
        assert_eq!(hub.room_count(), 1);

        tab2.leave();
        let (_, update) = events.recv().await.unwrap();
        assert_eq!(update, PresenceUpdate::UserLeft { user_id: alice.id });
        wait_for(|| hub.room_count() == 0).await;
    }

    #[tokio::test]
    async fn test_evicted_user_returns_on_activity() {
        let clock = Arc::new(ManualClock::default());
        let hub = PresenceHub::new(clock.clone(), PresenceConfig::default());
        let mut events = hub.subscribe();
        let plan_id = PlanId::new();
        let alice = user("Alice");
        let bob = user("Bob");
        let a = PresenceTracker::join(&hub, PlanContext::new(plan_id, alice.id), alice.clone()).await;
        let _b = PresenceTracker::join(&hub, PlanContext::new(plan_id, bob.id), bob.clone()).await;
        let _ = events.recv().await.unwrap();
        let _ = events.recv().await.unwrap();

        clock.advance(Duration::seconds(400));
        hub.sweep();
        let (_, first) = events.recv().await.unwrap();
        let (_, second) = events.recv().await.unwrap();
        assert!(matches!(first, PresenceUpdate::UserLeft { .. }));
        assert!(matches!(second, PresenceUpdate::UserLeft { .. }));
        wait_for(|| a.roster().is_empty()).await;
        assert!(a.is_connected());
        assert_eq!(hub.room_count(), 1);

        a.update_metadata(None);
        let (_, update) = events.recv().await.unwrap();
        assert!(matches!(update, PresenceUpdate::UserJoined { ref presence } if presence.user.id == alice.id));
        wait_for(|| a.roster().len() == 1).await;
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_join_broadcasts_and_roster_tracks_members() {
        let hub = PresenceHub::new(Arc::new(SystemClock), PresenceConfig::default());
        let mut events = hub.subscribe();
        let plan_id = PlanId::new();
        let alice = user("Alice");
        let bob = user("Bob");

        let a = PresenceTracker::join(&hub, PlanContext::new(plan_id, alice.id), alice.clone()).await;
        let b = PresenceTracker::join(&hub, PlanContext::new(plan_id, bob.id), bob.clone()).await;
        assert!(a.is_connected());
        assert_eq!(b.roster().len(), 2);

        let (_, first) = events.recv().await.unwrap();
        assert!(matches!(first, PresenceUpdate::UserJoined { ref presence } if presence.user.id == alice.id));

        b.leave();
        let (_, update) = events.recv().await.unwrap();
        assert!(matches!(update, PresenceUpdate::UserJoined { .. }));
        let (_, update) = events.recv().await.unwrap();
        assert_eq!(update, PresenceUpdate::UserLeft { user_id: bob.id });
        wait_for(|| a.roster().len() == 1).await;
    }

    #[tokio::test]
    async fn test_roster_callback_and_room_cleanup() {
        let hub = PresenceHub::new(Arc::new(SystemClock), PresenceConfig::default());
        let plan_id = PlanId::new();
        let alice = user("Alice");
        let bob = user("Bob");

        let mut a = PresenceTracker::join(&hub, PlanContext::new(plan_id, alice.id), alice).await;
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = sizes.clone();
        a.on_roster_changed(move |roster| seen.lock().push(roster.len()));

        let b = PresenceTracker::join(&hub, PlanContext::new(plan_id, bob.id), bob).await;
        wait_for(|| sizes.lock().last() == Some(&2)).await;
        drop(b);
        wait_for(|| sizes.lock().last() == Some(&1)).await;

        a.leave();
        wait_for(|| hub.room_count() == 0).await;
        assert!(hub.roster(plan_id).is_empty());
    }

    #[tokio::test]
    async fn test_sweep_marks_idle_then_evicts() {
        let clock = Arc::new(ManualClock::default());
        let hub = PresenceHub::new(clock.clone(), PresenceConfig::default());
        let mut events = hub.subscribe();
        let plan_id = PlanId::new();
        let alice = user("Alice");
        let tracker = PresenceTracker::join(&hub, PlanContext::new(plan_id, alice.id), alice.clone()).await;
        let _ = events.recv().await.unwrap();

        clock.advance(Duration::seconds(90));
        hub.sweep();
        let (_, update) = events.recv().await.unwrap();
        assert_eq!(update, PresenceUpdate::UserIdle { user_id: alice.id });

        clock.advance(Duration::seconds(300));
        hub.sweep();
        let (_, update) = events.recv().await.unwrap();
        assert_eq!(update, PresenceUpdate::UserLeft { user_id: alice.id });
        wait_for(|| tracker.roster().is_empty()).await;
    }
}
