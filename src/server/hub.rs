//! The coordinator: one task owning every piece of session state
//!
//! Connections push [`HubEvent`]s into one unbounded channel. The hub handles
//! each event to completion before taking the next, and services grace
//! timers, the heartbeat and the stale-session watchdog from the same
//! `select!`. Store reads and writes run in spawned tasks that only ever see
//! cloned data and an outbox sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::current_timestamp;
use crate::error::{ChatError, Result};
use crate::model::{Identity, RoomKey, SessionId, ViewContext};
use crate::notify::PREVIEW_CHARS;
use crate::protocol::codec::{ClientFrame, ServerFrame};
use crate::protocol::messages::{
    Delivered, HealthStatus, HistoryQuery, HistoryResult, Joined, Ping, PreviousMessages,
    Presence, Reconnected, RecentFiles, RoomJoined, RoomsInfo, UsersList,
};
use crate::server::reconnect::ReconnectionManager;
use crate::server::rooms::RoomDirectory;
use crate::server::router::{MessageRouter, Outgoing, RoutePlan};
use crate::server::sessions::{Session, SessionRegistry};
use crate::store::{DEFAULT_QUERY_LIMIT, MessageQuery, MessageStore, QueryScope};

/// Timing and sizing of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a dropped session waits for its owner to reconnect
    pub grace_period: Duration,
    /// Ping period
    pub heartbeat_interval: Duration,
    /// Stale-session sweep period
    pub watchdog_interval: Duration,
    /// Silence after which the watchdog evicts a session
    pub stale_after: Duration,
    /// Messages replayed on (re)join
    pub history_limit: usize,
    /// Notification preview length in characters
    pub preview_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            history_limit: 100,
            preview_chars: PREVIEW_CHARS,
        }
    }
}

/// Events delivered to the hub
#[derive(Debug)]
pub enum HubEvent {
    /// Transport accepted; frames for `conn_id` go to `outbox`
    Connected {
        conn_id: SessionId,
        outbox: mpsc::UnboundedSender<ServerFrame>,
    },

    /// Decoded client frame
    Frame {
        conn_id: SessionId,
        frame: ClientFrame,
    },

    /// Frame that could not be decoded
    Rejected {
        conn_id: SessionId,
        error: ChatError,
    },

    /// Transport closed
    Disconnected { conn_id: SessionId, reason: String },

    /// State dump for stats and tests
    Snapshot { reply: oneshot::Sender<HubSnapshot> },
}

/// Point-in-time copy of the hub state
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub sessions: Vec<Session>,
    pub connections: usize,
    pub pending_grace: usize,
}

impl HubSnapshot {
    pub fn session_named(&self, name: &str) -> Vec<&Session> {
        self.sessions.iter().filter(|s| s.name() == name).collect()
    }
}

/// Cloneable sender side of the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    fn send(&self, event: HubEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| ChatError::internal("Coordinator stopped"))
    }

    /// Register a connection and get its outbox
    pub fn connect(&self, conn_id: &str) -> Result<mpsc::UnboundedReceiver<ServerFrame>> {
        let (outbox, rx) = mpsc::unbounded_channel();
        self.send(HubEvent::Connected {
            conn_id: conn_id.to_string(),
            outbox,
        })?;
        Ok(rx)
    }

    pub fn frame(&self, conn_id: &str, frame: ClientFrame) -> Result<()> {
        self.send(HubEvent::Frame {
            conn_id: conn_id.to_string(),
            frame,
        })
    }

    pub fn reject(&self, conn_id: &str, error: ChatError) -> Result<()> {
        self.send(HubEvent::Rejected {
            conn_id: conn_id.to_string(),
            error,
        })
    }

    pub fn disconnect(&self, conn_id: &str, reason: impl Into<String>) -> Result<()> {
        self.send(HubEvent::Disconnected {
            conn_id: conn_id.to_string(),
            reason: reason.into(),
        })
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Snapshot { reply })?;
        rx.await
            .map_err(|_| ChatError::internal("Coordinator dropped snapshot request"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinMode {
    Fresh,
    Resume,
}

pub struct Hub {
    config: CoordinatorConfig,
    rooms: RoomDirectory,
    sessions: SessionRegistry,
    reconnect: ReconnectionManager,
    router: MessageRouter,
    store: Arc<dyn MessageStore>,
    connections: HashMap<SessionId, mpsc::UnboundedSender<ServerFrame>>,
    events: mpsc::UnboundedReceiver<HubEvent>,
}

impl Hub {
    pub fn new(
        config: CoordinatorConfig,
        rooms: RoomDirectory,
        store: Arc<dyn MessageStore>,
    ) -> (Self, HubHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let hub = Self {
            reconnect: ReconnectionManager::new(config.grace_period),
            router: MessageRouter::new(Arc::clone(&store), config.preview_chars),
            config,
            rooms,
            sessions: SessionRegistry::new(),
            store,
            connections: HashMap::new(),
            events,
        };
        (hub, HubHandle { events: tx })
    }

    /// Start the hub on its own task
    pub fn spawn(
        config: CoordinatorConfig,
        rooms: RoomDirectory,
        store: Arc<dyn MessageStore>,
    ) -> (JoinHandle<()>, HubHandle) {
        let (hub, handle) = Self::new(config, rooms, store);
        (tokio::spawn(hub.run()), handle)
    }

    /// Run until every [`HubHandle`] is dropped
    pub async fn run(mut self) {
        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval_at(
            start + self.config.watchdog_interval,
            self.config.watchdog_interval,
        );
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Coordinator started: {} rooms, grace {:?}",
            self.rooms.len(),
            self.config.grace_period
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some((identity, session_id)) = self.reconnect.next_expired() => {
                    self.expire_grace(identity, session_id);
                }
                _ = heartbeat.tick() => self.send_heartbeats(),
                _ = watchdog.tick() => self.sweep_stale(),
            }
        }

        info!("Coordinator stopped");
    }

    /// Handle one event to completion
    pub fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { conn_id, outbox } => {
                debug!("Connection {} registered", conn_id);
                self.connections.insert(conn_id, outbox);
            }

            HubEvent::Frame { conn_id, frame } => {
                debug!("{:?} from {}", frame.frame_type(), conn_id);
                if let Err(e) = self.handle_frame(&conn_id, frame) {
                    self.report(&conn_id, e);
                }
            }

            HubEvent::Rejected { conn_id, error } => self.report(&conn_id, error),

            HubEvent::Disconnected { conn_id, reason } => {
                self.handle_disconnect(&conn_id, &reason);
            }

            HubEvent::Snapshot { reply } => {
                let _ = reply.send(HubSnapshot {
                    sessions: self.sessions.all().cloned().collect(),
                    connections: self.connections.len(),
                    pending_grace: self.reconnect.len(),
                });
            }
        }
    }

    fn handle_frame(&mut self, conn_id: &str, frame: ClientFrame) -> Result<()> {
        let joined = self.sessions.touch(conn_id, Instant::now());
        if frame.requires_session() && !joined {
            return Err(ChatError::not_joined(format!(
                "{:?} from connection {} without a session",
                frame.frame_type(),
                conn_id
            )));
        }

        match frame {
            ClientFrame::Join(join) => self.handle_join(conn_id, join.identity(), JoinMode::Fresh),
            ClientFrame::Reconnect(reconnect) => {
                self.handle_join(conn_id, reconnect.identity(), JoinMode::Resume)
            }
            ClientFrame::Logout(_) => self.handle_logout(conn_id),
            // The touch above is all a pong does
            ClientFrame::Pong(_) => Ok(()),
            ClientFrame::JoinRoom(join_room) => self.handle_join_room(conn_id, &join_room.room),
            ClientFrame::SetView(set_view) => {
                self.sessions.set_view(conn_id, set_view.view);
                Ok(())
            }
            ClientFrame::SendMessage(msg) => self.handle_send(conn_id, msg.into()),
            ClientFrame::ShareFile(file) => self.handle_send(conn_id, file.into()),
            ClientFrame::HistoryQuery(query) => {
                self.handle_history_query(conn_id, query);
                Ok(())
            }
            ClientFrame::RecentFiles(query) => {
                self.handle_recent_files(conn_id, query);
                Ok(())
            }
            ClientFrame::Health(_) => {
                self.handle_health(conn_id);
                Ok(())
            }
        }
    }

    /// Send user-facing errors back; log and drop the rest
    fn report(&self, conn_id: &str, err: ChatError) {
        if err.is_user_facing() {
            warn!("Rejected request from {}: {}", conn_id, err);
            self.send_to(conn_id, ServerFrame::Error((&err).into()));
        } else {
            warn!("Dropped event from {}: {}", conn_id, err);
        }
    }

    fn handle_join(&mut self, conn_id: &str, identity: Identity, mode: JoinMode) -> Result<()> {
        if identity.name.trim().is_empty() {
            return Err(ChatError::invalid_message("Name is required"));
        }

        let resumed = self.reconnect.cancel(&identity);
        let outcome = self
            .sessions
            .join(conn_id.to_string(), identity.clone(), Instant::now());

        if let Some(prior) = outcome.replaced.filter(|p| p.id != conn_id) {
            // Dropping the outbox closes the superseded connection
            if self.connections.remove(&prior.id).is_some() {
                info!("Closing superseded connection {} of {}", prior.id, identity);
            }
        }

        let room = self.rooms.default_room().key.clone();
        self.sessions.switch_room(conn_id, &room);
        self.sessions.set_view(conn_id, ViewContext::room(room.clone()));

        match mode {
            JoinMode::Fresh => {
                info!("{} joined on {}", identity, conn_id);
                self.send_to(
                    conn_id,
                    ServerFrame::Joined(Joined {
                        session_id: conn_id.to_string(),
                        name: identity.name.clone(),
                        role: identity.role,
                        room: room.clone(),
                    }),
                );
                self.send_to(conn_id, self.rooms_info());
                self.send_to(conn_id, self.users_list());
            }
            JoinMode::Resume => {
                info!(
                    "{} reconnected on {} (grace timer {})",
                    identity,
                    conn_id,
                    if resumed { "cancelled" } else { "not running" }
                );
                self.send_to(
                    conn_id,
                    ServerFrame::Reconnected(Reconnected {
                        success: true,
                        session_id: conn_id.to_string(),
                    }),
                );
                self.send_to(conn_id, self.rooms_info());
                self.send_to_live(self.users_list(), None);
            }
        }

        self.replay_history(conn_id, &identity);

        if let Some(session) = self.sessions.find(conn_id) {
            let presence = presence(session, Some(room.clone()));
            self.send_to_room(&room, ServerFrame::UserJoined(presence), Some(conn_id));
        }

        Ok(())
    }

    fn handle_logout(&mut self, conn_id: &str) -> Result<()> {
        let session = self
            .sessions
            .evict(conn_id)
            .ok_or_else(|| ChatError::not_joined(conn_id.to_string()))?;
        self.reconnect.cancel(&session.identity);
        info!("{} logged out", session.identity);
        self.announce_left(&session);
        Ok(())
    }

    fn handle_join_room(&mut self, conn_id: &str, key: &str) -> Result<()> {
        let role = self
            .sessions
            .find(conn_id)
            .map(Session::role)
            .ok_or_else(|| ChatError::not_joined(conn_id.to_string()))?;
        let room = self.rooms.check_join(key, role)?.key.clone();

        let previous = self.sessions.switch_room(conn_id, &room).flatten();
        self.sessions.set_view(conn_id, ViewContext::room(room.clone()));
        debug!("{} moved {:?} -> {}", conn_id, previous, room);

        self.send_to(conn_id, ServerFrame::RoomJoined(RoomJoined { room, previous }));
        Ok(())
    }

    fn handle_send(&mut self, conn_id: &str, outgoing: Outgoing) -> Result<()> {
        let plan = self
            .router
            .route(&self.rooms, &self.sessions, conn_id, outgoing)?;
        self.deliver(plan);
        Ok(())
    }

    /// Messages go out before the notifications that describe them
    fn deliver(&self, plan: RoutePlan) {
        for delivery in plan.deliveries {
            self.send_to(
                &delivery.session_id,
                ServerFrame::delivery(Delivered {
                    message: plan.message.clone(),
                    confirmation: delivery.confirmation,
                }),
            );
        }
        for (session_id, notification) in plan.notifications {
            self.send_to(&session_id, ServerFrame::Notification(notification));
        }
    }

    fn handle_disconnect(&mut self, conn_id: &str, reason: &str) {
        self.connections.remove(conn_id);

        let Some(session) = self
            .sessions
            .mark_inactive(conn_id, Instant::now())
            .cloned()
        else {
            debug!("Connection {} closed before joining: {}", conn_id, reason);
            return;
        };

        info!(
            "{} disconnected ({}), holding session for {:?}",
            session.identity,
            reason,
            self.reconnect.grace()
        );
        let offline = presence(&session, session.current_room.clone());
        self.send_to_live(ServerFrame::UserOffline(offline), None);
        self.reconnect.arm(session.identity.clone(), session.id.clone());
    }

    fn expire_grace(&mut self, identity: Identity, session_id: SessionId) {
        let still_waiting = self
            .sessions
            .find(&session_id)
            .is_some_and(|s| !s.is_active() && s.identity == identity);
        if !still_waiting {
            debug!("Grace timer for {} fired after it was resolved", identity);
            return;
        }

        if let Some(session) = self.sessions.evict(&session_id) {
            info!("{} did not reconnect, removing session", identity);
            self.announce_left(&session);
        }
    }

    fn sweep_stale(&mut self) {
        let stale = self
            .sessions
            .stale(Instant::now(), self.config.stale_after);

        for id in stale {
            if let Some(session) = self.sessions.evict(&id) {
                warn!("Evicting silent session {} of {}", id, session.identity);
                self.reconnect.cancel(&session.identity);
                self.connections.remove(&id);
                self.announce_left(&session);
            }
        }
    }

    fn send_heartbeats(&self) {
        let ping = Ping {
            timestamp: current_timestamp(),
        };
        for conn_id in self.connections.keys() {
            self.send_to(conn_id, ServerFrame::Ping(ping.clone()));
        }
    }

    fn handle_history_query(&self, conn_id: &str, query: HistoryQuery) {
        let HistoryQuery {
            room,
            peer_a,
            peer_b,
            files_only,
            limit,
        } = query;
        let scope = match (room, peer_a, peer_b) {
            (Some(room), _, _) => QueryScope::Room(room),
            (None, Some(a), Some(b)) => QueryScope::Conversation(a, b),
            _ => QueryScope::All,
        };
        let mut query = MessageQuery::new(scope).limit(limit.unwrap_or(DEFAULT_QUERY_LIMIT));
        query.files_only = files_only;
        self.spawn_query(conn_id, move |store| async move {
            store
                .find(&query)
                .await
                .map(|messages| ServerFrame::HistoryResult(HistoryResult { messages }))
        });
    }

    fn handle_recent_files(&self, conn_id: &str, query: RecentFiles) {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        self.spawn_query(conn_id, move |store| async move {
            store
                .recent_files(limit)
                .await
                .map(|messages| ServerFrame::RecentFilesResult(HistoryResult { messages }))
        });
    }

    fn handle_health(&self, conn_id: &str) {
        self.spawn_query(conn_id, |store| async move {
            let status = match store.health().await {
                Ok(()) => HealthStatus {
                    healthy: true,
                    detail: None,
                    timestamp: current_timestamp(),
                },
                Err(e) => HealthStatus {
                    healthy: false,
                    detail: Some(e.to_string()),
                    timestamp: current_timestamp(),
                },
            };
            Ok(ServerFrame::HealthStatus(status))
        });
    }

    fn replay_history(&self, conn_id: &str, identity: &Identity) {
        let query = MessageQuery::new(QueryScope::RelevantTo(identity.clone()))
            .limit(self.config.history_limit);
        self.spawn_query(conn_id, move |store| async move {
            store
                .find(&query)
                .await
                .map(|messages| ServerFrame::PreviousMessages(PreviousMessages { messages }))
        });
    }

    /// Run a store read off the hub task and post the answer to `conn_id`
    fn spawn_query<F, Fut>(&self, conn_id: &str, query: F)
    where
        F: FnOnce(Arc<dyn MessageStore>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<ServerFrame>> + Send + 'static,
    {
        let Some(outbox) = self.connections.get(conn_id).cloned() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let conn_id = conn_id.to_string();
        tokio::spawn(async move {
            match query(store).await {
                Ok(frame) => {
                    let _ = outbox.send(frame);
                }
                Err(e) => error!("Store query for {} failed: {}", conn_id, e),
            }
        });
    }

    fn announce_left(&self, session: &Session) {
        let room = session
            .current_room
            .clone()
            .unwrap_or_else(|| self.rooms.default_room().key.clone());
        let frame = ServerFrame::UserLeft(presence(session, Some(room.clone())));
        self.send_to_room(&room, frame, Some(&session.id));
    }

    fn rooms_info(&self) -> ServerFrame {
        ServerFrame::RoomsInfo(RoomsInfo {
            rooms: self.rooms.info(),
        })
    }

    fn users_list(&self) -> ServerFrame {
        ServerFrame::UsersList(UsersList {
            users: self.sessions.user_list(),
        })
    }

    fn send_to(&self, conn_id: &str, frame: ServerFrame) {
        if let Some(outbox) = self.connections.get(conn_id) {
            if outbox.send(frame).is_err() {
                debug!("Outbox of {} is closed", conn_id);
            }
        }
    }

    fn send_to_room(&self, room: &str, frame: ServerFrame, exclude: Option<&str>) {
        for member in self.sessions.members_of(room) {
            if Some(member.id.as_str()) != exclude {
                self.send_to(&member.id, frame.clone());
            }
        }
    }

    fn send_to_live(&self, frame: ServerFrame, exclude: Option<&str>) {
        for session in self.sessions.live() {
            if Some(session.id.as_str()) != exclude {
                self.send_to(&session.id, frame.clone());
            }
        }
    }
}

fn presence(session: &Session, room: Option<RoomKey>) -> Presence {
    Presence {
        id: session.id.clone(),
        name: session.name().to_string(),
        role: session.role(),
        room,
        timestamp: current_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::protocol::messages::{Health, Join};
    use crate::store::MemoryStore;

    fn hub() -> (Hub, HubHandle) {
        Hub::new(
            CoordinatorConfig::default(),
            RoomDirectory::default(),
            Arc::new(MemoryStore::new()),
        )
    }

    fn connect(hub: &mut Hub, conn_id: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (outbox, rx) = mpsc::unbounded_channel();
        hub.handle_event(HubEvent::Connected {
            conn_id: conn_id.to_string(),
            outbox,
        });
        rx
    }

    fn join(hub: &mut Hub, conn_id: &str, name: &str, role: Role) {
        hub.handle_event(HubEvent::Frame {
            conn_id: conn_id.to_string(),
            frame: ClientFrame::Join(Join {
                name: name.to_string(),
                role,
            }),
        });
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_join_sends_session_state() {
        let (mut hub, _handle) = hub();
        let mut rx = connect(&mut hub, "a1");
        join(&mut hub, "a1", "alice", Role::Student);

        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerFrame::Joined(j) if j.session_id == "a1" && j.room == "general"
        ));
        assert!(matches!(&frames[1], ServerFrame::RoomsInfo(r) if r.rooms.len() == 3));
        assert!(matches!(&frames[2], ServerFrame::UsersList(u) if u.users.len() == 1));
    }

    #[tokio::test]
    async fn test_duplicate_join_closes_superseded_connection() {
        let (mut hub, _handle) = hub();
        let mut first = connect(&mut hub, "a1");
        join(&mut hub, "a1", "alice", Role::Student);
        let _second = connect(&mut hub, "a2");
        join(&mut hub, "a2", "alice", Role::Student);

        // Let the history replay for a1 finish and release its sender
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        drain(&mut first);
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(hub.sessions.len(), 1);
        assert!(hub.sessions.find("a2").is_some());

        // The old transport closing later must not disturb the new session
        hub.handle_event(HubEvent::Disconnected {
            conn_id: "a1".into(),
            reason: "closed".into(),
        });
        assert!(hub.sessions.find("a2").unwrap().is_active());
        assert!(hub.reconnect.is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (mut hub, _handle) = hub();
        let mut rx = connect(&mut hub, "a1");
        join(&mut hub, "a1", "  ", Role::Student);

        let frames = drain(&mut rx);
        assert!(matches!(frames.as_slice(), [ServerFrame::Error(e)] if e.code == 1005));
        assert!(hub.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_frame_reported() {
        let (mut hub, _handle) = hub();
        let mut rx = connect(&mut hub, "a1");
        hub.handle_event(HubEvent::Rejected {
            conn_id: "a1".into(),
            error: ChatError::protocol("Invalid SendMessage frame"),
        });

        let frames = drain(&mut rx);
        assert!(matches!(frames.as_slice(), [ServerFrame::Error(e)] if e.code == 1003));
    }

    #[tokio::test]
    async fn test_health_answered_from_store() {
        let (mut hub, _handle) = hub();
        let mut rx = connect(&mut hub, "probe");
        hub.handle_event(HubEvent::Frame {
            conn_id: "probe".into(),
            frame: ClientFrame::Health(Health {}),
        });

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::HealthStatus(h) if h.healthy));
    }

    #[tokio::test]
    async fn test_snapshot_through_handle() {
        let (_task, handle) = Hub::spawn(
            CoordinatorConfig::default(),
            RoomDirectory::default(),
            Arc::new(MemoryStore::new()),
        );
        let _rx = handle.connect("a1").unwrap();
        handle
            .frame(
                "a1",
                ClientFrame::Join(Join {
                    name: "alice".into(),
                    role: Role::Admin,
                }),
            )
            .unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.session_named("alice").len(), 1);
    }
}
