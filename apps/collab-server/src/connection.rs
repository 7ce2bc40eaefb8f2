use std::net::SocketAddr;

use collaboration::{
    Collaboration, FeedEvent, Notice, NoticeLevel, PlanContext, PresenceTracker,
    ResourceDescriptor, SubscriptionHandle, SyncMessage, User, reply_for,
};
use futures::{SinkExt, StreamExt};
use plan::PlanId;
use store::Table;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

type Tx = mpsc::UnboundedSender<Message>;

/// Tables whose plan-scoped changes are pushed to connected clients.
const WATCHED_TABLES: [Table; 8] = [
    Table::Plans,
    Table::TeamMembers,
    Table::CanvasSections,
    Table::CanvasItems,
    Table::DetailedSections,
    Table::VotingSessions,
    Table::Votes,
    Table::Comments,
];

fn send(tx: &Tx, msg: &SyncMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("Failed to serialize message: {}", e),
    }
}

fn send_error(tx: &Tx, request_id: Option<u64>, code: &str, message: impl Into<String>) {
    send(
        tx,
        &SyncMessage::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
        },
    );
}

/// A connection that has joined a plan.
struct Session {
    ctx: PlanContext,
    tracker: PresenceTracker,
    subscriptions: Vec<SubscriptionHandle>,
    presence_task: JoinHandle<()>,
}

impl Session {
    async fn open(collab: &Collaboration, plan_id: PlanId, user: User, tx: &Tx) -> Self {
        let ctx = PlanContext::new(plan_id, user.id);

        // Subscribe before joining so peers' replies to our arrival are not missed.
        let mut updates = collab.presence.subscribe();
        let presence_tx = tx.clone();
        let presence_task = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok((room, update)) if room == plan_id => {
                        send(&presence_tx, &SyncMessage::Presence { update });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Presence fan-out lagged by {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let subscriptions = WATCHED_TABLES
            .into_iter()
            .map(|table| {
                let tx = tx.clone();
                collab
                    .feed
                    .subscribe(ResourceDescriptor::for_plan(table, plan_id), move |event| {
                        match event {
                            FeedEvent::Change(change) => send(
                                &tx,
                                &SyncMessage::Change {
                                    change: change.clone(),
                                },
                            ),
                            FeedEvent::Lagged(skipped) => send(
                                &tx,
                                &SyncMessage::Notice {
                                    notice: Notice::new(
                                        NoticeLevel::Warning,
                                        format!("Missed {skipped} updates, reload the plan"),
                                    ),
                                },
                            ),
                        }
                    })
            })
            .collect();

        let tracker = PresenceTracker::join(&collab.presence, ctx, user).await;
        Self {
            ctx,
            tracker,
            subscriptions,
            presence_task,
        }
    }

    async fn close(self, collab: &Collaboration) {
        for handle in &self.subscriptions {
            collab.feed.unsubscribe(handle);
        }
        self.presence_task.abort();
        self.tracker.leave();

        let ctx = self.ctx;
        let collab = collab.clone();
        match tokio::task::spawn_blocking(move || collab.disconnect(&ctx)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Releasing locks for {} failed: {}", ctx.user_id, e),
            Err(e) => error!("Disconnect task panicked: {}", e),
        }
    }
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, collab: Collaboration) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut session: Option<Session> = None;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_sync_message(&text, &collab, &tx, &mut session).await {
                    warn!("Bad message from {}: {}", addr, e);
                    send_error(&tx, None, "bad_request", e.to_string());
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    if let Some(session) = session.take() {
        info!(
            "User {} left plan {}",
            session.ctx.user_id, session.ctx.plan_id
        );
        session.close(&collab).await;
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}

async fn handle_sync_message(
    text: &str,
    collab: &Collaboration,
    tx: &Tx,
    session: &mut Option<Session>,
) -> anyhow::Result<()> {
    let msg: SyncMessage = serde_json::from_str(text)?;

    match msg {
        SyncMessage::Connect { plan_id, user } => {
            if session.is_some() {
                send_error(tx, None, "already_connected", "Already joined a plan");
                return Ok(());
            }
            let ctx = PlanContext::new(plan_id, user.id);
            let check = collab.clone();
            let membership =
                tokio::task::spawn_blocking(move || check.team.membership(&ctx)).await?;
            if let Err(e) = membership {
                info!("User {} refused on plan {}: {}", user.id, plan_id, e);
                send_error(tx, None, e.code(), e.to_string());
                return Ok(());
            }

            info!("User {} connecting to plan {}", user.name, plan_id);
            let joined = Session::open(collab, plan_id, user, tx).await;
            send(
                tx,
                &SyncMessage::Connected {
                    plan_id,
                    user_id: ctx.user_id,
                    roster: joined.tracker.roster(),
                },
            );
            *session = Some(joined);
        }

        SyncMessage::Command {
            request_id,
            command,
        } => {
            let Some(joined) = session.as_ref() else {
                send_error(tx, Some(request_id), "not_connected", "Join a plan first");
                return Ok(());
            };
            debug!("Request {} from {}: {}", request_id, joined.ctx.user_id, command.action());
            let ctx = joined.ctx;
            let runner = collab.clone();
            let result = tokio::task::spawn_blocking(move || runner.execute(&ctx, command)).await?;
            for reply in reply_for(request_id, &result) {
                send(tx, &reply);
            }
        }

        SyncMessage::UpdatePresence { cursor } => match session.as_ref() {
            Some(joined) => joined.tracker.update_metadata(cursor),
            None => send_error(tx, None, "not_connected", "Join a plan first"),
        },

        SyncMessage::Ping => send(tx, &SyncMessage::Pong),

        SyncMessage::Pong => {}

        other => {
            warn!("Unhandled message type from client: {:?}", other);
        }
    }

    Ok(())
}
