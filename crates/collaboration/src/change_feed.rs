/// Generic change subscriptions keyed by resource descriptor
///
/// One descriptor key maps to exactly one underlying channel: subscribing
/// again with an identical descriptor adds a callback to the existing channel
/// instead of opening another one. The channel task stops when its last
/// callback unsubscribes.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use store::{ChangeKind, Field, PlanStore, RowChange, Table};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CollaborationError, Result};

/// Column equality filter applied to either row image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: Field,
    pub value: Uuid,
}

/// What to listen to: a table, an optional filter and a set of event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub table: Table,
    pub filter: Option<RowFilter>,
    pub events: BTreeSet<ChangeKind>,
}

impl ResourceDescriptor {
    /// All events on `table`, unfiltered.
    pub fn table(table: Table) -> Self {
        Self {
            table,
            filter: None,
            events: [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
                .into_iter()
                .collect(),
        }
    }

    pub fn filter(mut self, field: Field, value: Uuid) -> Self {
        self.filter = Some(RowFilter { field, value });
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = ChangeKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    /// `table` rows belonging to `plan_id`.
    pub fn for_plan(table: Table, plan_id: plan::PlanId) -> Self {
        Self::table(table).filter(Field::PlanId, plan_id.0)
    }

    /// Stable channel key; identical descriptors always produce the same key.
    pub fn key(&self) -> String {
        let filter = match &self.filter {
            Some(f) => format!("{}=eq.{}", f.field.as_str(), f.value),
            None => "*".to_string(),
        };
        let events: Vec<&str> = self
            .events
            .iter()
            .map(|kind| match kind {
                ChangeKind::Insert => "insert",
                ChangeKind::Update => "update",
                ChangeKind::Delete => "delete",
            })
            .collect();
        format!("{}:{}:{}", self.table, filter, events.join(","))
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        change.table == self.table
            && self.events.contains(&change.kind)
            && self
                .filter
                .map(|f| change.matches(f.field, f.value))
                .unwrap_or(true)
    }
}

/// What a subscriber is told.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(RowChange),
    /// The channel fell behind and skipped this many changes; re-read state.
    Lagged(u64),
}

pub type ChangeCallback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Subscriber {
    id: u64,
    /// Cleared on unsubscribe; a delivery already in flight checks it first.
    alive: Arc<AtomicBool>,
    callback: ChangeCallback,
}

type CallbackList = Arc<RwLock<Vec<Subscriber>>>;

struct Channel {
    callbacks: CallbackList,
    task: JoinHandle<()>,
}

/// Shared registry of change channels over one store.
#[derive(Clone)]
pub struct ChangeFeed {
    store: Arc<dyn PlanStore>,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    next_id: Arc<AtomicU64>,
}

impl ChangeFeed {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers `callback` for changes matching `descriptor`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, descriptor: ResourceDescriptor, callback: F) -> SubscriptionHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let key = descriptor.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock();
        let channel = channels.entry(key.clone()).or_insert_with(|| {
            debug!("Opening change channel {}", key);
            let callbacks: CallbackList = Arc::new(RwLock::new(Vec::new()));
            let rx = self.store.subscribe_changes();
            let task = tokio::spawn(run_channel(descriptor, rx, callbacks.clone()));
            Channel { callbacks, task }
        });
        channel.callbacks.write().push(Subscriber {
            id,
            alive: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(callback),
        });
        SubscriptionHandle { key, id }
    }

    /// Like [`subscribe`](Self::subscribe), but only changes accepted by
    /// `predicate` reach `callback`. Lag notices always pass.
    pub fn subscribe_where<P, F>(
        &self,
        descriptor: ResourceDescriptor,
        predicate: P,
        callback: F,
    ) -> SubscriptionHandle
    where
        P: Fn(&RowChange) -> bool + Send + Sync + 'static,
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.subscribe(descriptor, move |event| match event {
            FeedEvent::Change(change) if !predicate(change) => {}
            _ => callback(event),
        })
    }

    /// Removes one callback; returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get(&handle.key) else {
            return false;
        };
        let removed = {
            let mut callbacks = channel.callbacks.write();
            let before = callbacks.len();
            callbacks.retain(|sub| {
                if sub.id == handle.id {
                    sub.alive.store(false, Ordering::SeqCst);
                    return false;
                }
                true
            });
            before != callbacks.len()
        };
        if channel.callbacks.read().is_empty() {
            if let Some(channel) = channels.remove(&handle.key) {
                debug!("Closing change channel {}", handle.key);
                channel.task.abort();
            }
        }
        removed
    }

    /// Number of open underlying channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn subscriber_count(&self, descriptor: &ResourceDescriptor) -> usize {
        self.channels
            .lock()
            .get(&descriptor.key())
            .map(|c| c.callbacks.read().len())
            .unwrap_or(0)
    }

    /// Matching events as a stream; unsubscribes when the stream is dropped.
    pub fn stream(&self, descriptor: ResourceDescriptor) -> FeedStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(descriptor, move |event| {
            let _ = tx.send(event.clone());
        });
        FeedStream {
            feed: self.clone(),
            handle: Some(handle),
            rx,
        }
    }

    /// Starts watching for the first change accepted by `predicate`.
    ///
    /// Create the waiter before issuing the write it confirms.
    pub fn expect<P>(&self, descriptor: ResourceDescriptor, predicate: P) -> ChangeWaiter
    where
        P: Fn(&RowChange) -> bool + Send + Sync + 'static,
    {
        let label = descriptor.key();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(descriptor, move |event| {
            if let FeedEvent::Change(change) = event {
                if predicate(change) {
                    let _ = tx.send(change.clone());
                }
            }
        });
        ChangeWaiter {
            feed: self.clone(),
            handle: Some(handle),
            label,
            rx,
        }
    }

    /// Runs `write` and waits for the change that confirms it.
    pub async fn await_change<T, P, W>(
        &self,
        descriptor: ResourceDescriptor,
        predicate: P,
        timeout: Duration,
        write: W,
    ) -> Result<(T, RowChange)>
    where
        P: Fn(&RowChange) -> bool + Send + Sync + 'static,
        W: FnOnce() -> Result<T>,
    {
        let waiter = self.expect(descriptor, predicate);
        let value = write()?;
        let change = waiter.wait(timeout).await?;
        Ok((value, change))
    }
}

async fn run_channel(
    descriptor: ResourceDescriptor,
    mut rx: broadcast::Receiver<RowChange>,
    callbacks: CallbackList,
) {
    loop {
        let event = match rx.recv().await {
            Ok(change) if descriptor.matches(&change) => FeedEvent::Change(change),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Change channel {} lagged, skipped {} changes",
                    descriptor.key(),
                    skipped
                );
                FeedEvent::Lagged(skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let snapshot: Vec<(Arc<AtomicBool>, ChangeCallback)> = callbacks
            .read()
            .iter()
            .map(|sub| (sub.alive.clone(), sub.callback.clone()))
            .collect();
        for (alive, callback) in snapshot {
            if alive.load(Ordering::SeqCst) {
                callback(&event);
            }
        }
    }
}

/// Stream of feed events for one subscription.
pub struct FeedStream {
    feed: ChangeFeed,
    handle: Option<SubscriptionHandle>,
    rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl FeedStream {
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }
}

impl Stream for FeedStream {
    type Item = FeedEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.feed.unsubscribe(&handle);
        }
    }
}

/// Pending confirmation of a specific change.
pub struct ChangeWaiter {
    feed: ChangeFeed,
    handle: Option<SubscriptionHandle>,
    label: String,
    rx: mpsc::UnboundedReceiver<RowChange>,
}

impl ChangeWaiter {
    /// Waits up to `timeout` for the expected change.
    pub async fn wait(mut self, timeout: Duration) -> Result<RowChange> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(change)) => Ok(change),
            Ok(None) => Err(CollaborationError::ChannelClosed(self.label.clone())),
            Err(_) => Err(CollaborationError::Timeout(self.label.clone())),
        }
    }
}

impl Drop for ChangeWaiter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.feed.unsubscribe(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan::{CanvasItem, PlanId, Role, SectionId, TeamMember, UserId};
    use std::sync::atomic::AtomicUsize;
    use store::SqliteStore;

    fn seeded() -> (Arc<SqliteStore>, PlanId, UserId, SectionId) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let owner = UserId::new();
        let plan = plan::Plan::new("Feed", None, owner).unwrap();
        store
            .create_workspace(None, &plan, &TeamMember::new(plan.id, owner, Role::Owner, None))
            .unwrap();
        store.seed_canvas_sections(plan.id).unwrap();
        let section = store.list_canvas_sections(plan.id).unwrap()[0].id;
        (store, plan.id, owner, section)
    }

    #[test]
    fn test_key_is_stable_and_ignores_event_order() {
        let plan_id = PlanId::new();
        let a = ResourceDescriptor::for_plan(Table::CanvasItems, plan_id)
            .events([ChangeKind::Update, ChangeKind::Insert]);
        let b = ResourceDescriptor::for_plan(Table::CanvasItems, plan_id)
            .events([ChangeKind::Insert, ChangeKind::Update]);
        assert_eq!(a.key(), b.key());
        assert_eq!(
            a.key(),
            format!("canvas_items:plan_id=eq.{}:insert,update", plan_id)
        );
    }

    #[tokio::test]
    async fn test_identical_subscriptions_share_one_channel() {
        let (store, plan_id, _, _) = seeded();
        let feed = ChangeFeed::new(store);
        let descriptor = ResourceDescriptor::for_plan(Table::CanvasItems, plan_id);

        let first = feed.subscribe(descriptor.clone(), |_| {});
        let second = feed.subscribe(descriptor.clone(), |_| {});
        assert_eq!(feed.channel_count(), 1);
        assert_eq!(feed.subscriber_count(&descriptor), 2);

        assert!(feed.unsubscribe(&first));
        assert_eq!(feed.channel_count(), 1);
        assert!(feed.unsubscribe(&second));
        assert_eq!(feed.channel_count(), 0);
        assert!(!feed.unsubscribe(&second));
    }

    #[tokio::test]
    async fn test_callbacks_see_only_matching_rows() {
        let (store, plan_id, owner, section) = seeded();
        let feed = ChangeFeed::new(store.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _handle = feed.subscribe(
            ResourceDescriptor::for_plan(Table::CanvasItems, plan_id).events([ChangeKind::Insert]),
            move |event| {
                if matches!(event, FeedEvent::Change(_)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let mut stream = feed.stream(ResourceDescriptor::for_plan(Table::CanvasItems, plan_id));
        let item = CanvasItem::new(plan_id, section, "Ovens".into(), owner);
        store.insert_canvas_item(&item).unwrap();
        store.delete_canvas_item(item.id).unwrap();

        // insert then delete arrive in commit order on the unfiltered stream
        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert!(matches!(first, FeedEvent::Change(ref c) if c.kind == ChangeKind::Insert));
        assert!(matches!(second, FeedEvent::Change(ref c) if c.kind == ChangeKind::Delete));
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe_returns() {
        let (store, plan_id, owner, section) = seeded();
        let feed = ChangeFeed::new(store.clone());
        let descriptor = ResourceDescriptor::for_plan(Table::CanvasItems, plan_id);
        let late = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(AtomicUsize::new(0));
        let target: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        // The first subscriber drops the second while an event is being fanned out.
        let (unsubscriber, slot, seen) = (feed.clone(), target.clone(), first.clone());
        let _first = feed.subscribe(descriptor.clone(), move |_| {
            if let Some(handle) = slot.lock().take() {
                assert!(unsubscriber.unsubscribe(&handle));
            }
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let counter = late.clone();
        let second = feed.subscribe(descriptor.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *target.lock() = Some(second);

        store
            .insert_canvas_item(&CanvasItem::new(plan_id, section, "Ovens".into(), owner))
            .unwrap();
        store
            .insert_canvas_item(&CanvasItem::new(plan_id, section, "Flour".into(), owner))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while first.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(feed.subscriber_count(&descriptor), 1);
    }

    #[tokio::test]
    async fn test_waiter_confirms_write() {
        let (store, plan_id, owner, section) = seeded();
        let feed = ChangeFeed::new(store.clone());
        let item = CanvasItem::new(plan_id, section, "Ovens".into(), owner);
        let item_id = item.id;
        let waiter = feed.expect(
            ResourceDescriptor::for_plan(Table::CanvasItems, plan_id),
            move |change| change.matches(Field::ItemId, item_id.0),
        );
        store.insert_canvas_item(&item).unwrap();
        let change = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(feed.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let (store, plan_id, _, _) = seeded();
        let feed = ChangeFeed::new(store);
        let waiter = feed.expect(ResourceDescriptor::for_plan(Table::Votes, plan_id), |_| true);
        let result = waiter.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(CollaborationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_await_change_with_filtered_subscriber() {
        let (store, plan_id, owner, section) = seeded();
        let feed = ChangeFeed::new(store.clone());
        let mine = CanvasItem::new(plan_id, section, "Flour".into(), owner);
        let mine_id = mine.id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = feed.subscribe_where(
            ResourceDescriptor::for_plan(Table::CanvasItems, plan_id),
            move |change| change.matches(Field::ItemId, mine_id.0),
            move |event| {
                let _ = tx.send(event.clone());
            },
        );

        let other = CanvasItem::new(plan_id, section, "Sugar".into(), owner);
        store.insert_canvas_item(&other).unwrap();
        let ((), change) = feed
            .await_change(
                ResourceDescriptor::for_plan(Table::CanvasItems, plan_id),
                move |change| change.matches(Field::ItemId, mine_id.0),
                Duration::from_secs(1),
                || Ok(store.insert_canvas_item(&mine)?),
            )
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);

        let seen = rx.recv().await.unwrap();
        assert!(matches!(seen, FeedEvent::Change(ref c) if c.matches(Field::ItemId, mine_id.0)));
        assert!(rx.try_recv().is_err());
    }
}
