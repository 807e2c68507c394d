//! Client-side state: the observed message log, unread counters and the
//! active view.
//!
//! Live deliveries, the sender's own local copies and replayed history all
//! land here. Message ids are the only dedup key.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::ChatError;
use crate::model::{
    ChatMessage, ConversationKey, Identity, Notification, Role, Room, RoomKey, SessionId, UserSummary,
    ViewContext,
};
use crate::notify;
use crate::protocol::codec::ServerFrame;
use crate::protocol::messages::Presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Joined,
    Left,
    Offline,
}

/// Presence line shown in a room with system messages enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEntry {
    pub room: RoomKey,
    pub name: String,
    pub change: PresenceChange,
    pub timestamp: u64,
}

impl SystemEntry {
    pub fn text(&self) -> String {
        match self.change {
            PresenceChange::Joined => format!("{} joined", self.name),
            PresenceChange::Left => format!("{} left", self.name),
            PresenceChange::Offline => format!("{} went offline", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Chat(ChatMessage),
    System(SystemEntry),
}

impl Entry {
    pub fn timestamp(&self) -> u64 {
        match self {
            Entry::Chat(m) => m.timestamp,
            Entry::System(s) => s.timestamp,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatMessage> {
        match self {
            Entry::Chat(m) => Some(m),
            Entry::System(_) => None,
        }
    }
}

/// Who this client is, as assigned by the last `Joined`/`Reconnected`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub session_id: SessionId,
    pub name: String,
    pub role: Role,
}

impl LocalIdentity {
    pub fn identity(&self) -> Identity {
        Identity::new(self.name.clone(), self.role)
    }
}

#[derive(Debug, Default)]
pub struct ClientState {
    me: Option<LocalIdentity>,
    entries: Vec<Entry>,
    seen: HashSet<String>,
    unread: HashMap<ConversationKey, usize>,
    active: Option<ViewContext>,
    rooms: Vec<Room>,
    users: Vec<UserSummary>,
    notifications: Vec<Notification>,
    last_error: Option<ChatError>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(session_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            me: Some(LocalIdentity {
                session_id: session_id.into(),
                name: name.into(),
                role,
            }),
            ..Self::default()
        }
    }

    pub fn identity(&self) -> Option<&LocalIdentity> {
        self.me.as_ref()
    }

    /// Accept one live message. Returns false for an id already seen.
    pub fn ingest(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.message_id.clone()) {
            debug!("Dropping duplicate message {}", message.message_id);
            return false;
        }

        if !message.is_broadcast()
            && !self.sent_by_me(&message)
            && !self.in_active_view(&message)
        {
            if let Some(key) = conversation_of(&message) {
                *self.unread.entry(key).or_insert(0) += 1;
            }
        }

        self.entries.push(Entry::Chat(message));
        true
    }

    /// Merge a history batch. Known ids and in-batch repeats are dropped, the
    /// rest is sorted by timestamp and merged without moving existing
    /// entries. Unread counters are left alone. Returns the number merged.
    pub fn ingest_history(&mut self, batch: Vec<ChatMessage>) -> usize {
        let mut fresh: Vec<ChatMessage> = batch
            .into_iter()
            .filter(|m| self.seen.insert(m.message_id.clone()))
            .collect();
        if fresh.is_empty() {
            return 0;
        }
        fresh.sort_by_key(|m| m.timestamp);
        let merged = fresh.len();

        let existing = std::mem::take(&mut self.entries);
        let mut entries = Vec::with_capacity(existing.len() + merged);
        let mut fresh = fresh.into_iter().peekable();

        for entry in existing {
            while let Some(next) = fresh.next_if(|m| m.timestamp < entry.timestamp()) {
                entries.push(Entry::Chat(next));
            }
            entries.push(entry);
        }
        entries.extend(fresh.map(Entry::Chat));

        self.entries = entries;
        merged
    }

    /// The sender's own message, shown before the server echo arrives
    pub fn record_local(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.message_id.clone()) {
            return false;
        }
        self.entries.push(Entry::Chat(message));
        true
    }

    /// Switch the active view and clear its unread counter
    pub fn set_active(&mut self, view: ViewContext) {
        self.unread.remove(&view.conversation());
        self.active = Some(view);
    }

    pub fn active(&self) -> Option<&ViewContext> {
        self.active.as_ref()
    }

    /// Entries visible in the active view
    pub fn view(&self) -> Vec<&Entry> {
        match &self.active {
            Some(view) => self.view_of(view),
            None => Vec::new(),
        }
    }

    pub fn view_of(&self, view: &ViewContext) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|entry| match entry {
                Entry::Chat(m) => self.message_in_view(view, m),
                Entry::System(s) => matches!(view, ViewContext::Room { room } if *room == s.room),
            })
            .collect()
    }

    pub fn unread(&self, key: &ConversationKey) -> usize {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn unread_room(&self, room: &str) -> usize {
        self.unread(&ConversationKey::Room(room.to_string()))
    }

    pub fn total_unread(&self) -> usize {
        self.unread.values().sum()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().filter_map(Entry::as_chat)
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn users(&self) -> &[UserSummary] {
        &self.users
    }

    /// Pending notifications, oldest first
    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    /// Apply one server frame
    pub fn apply(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Joined(joined) => {
                self.me = Some(LocalIdentity {
                    session_id: joined.session_id,
                    name: joined.name,
                    role: joined.role,
                });
                self.set_active(ViewContext::room(joined.room));
            }
            ServerFrame::Reconnected(reconnected) => {
                if let Some(me) = self.me.as_mut().filter(|_| reconnected.success) {
                    me.session_id = reconnected.session_id;
                }
            }
            ServerFrame::RoomsInfo(info) => self.rooms = info.rooms,
            ServerFrame::UsersList(list) => self.users = list.users,
            ServerFrame::PreviousMessages(previous) => {
                self.ingest_history(previous.messages);
            }
            ServerFrame::HistoryResult(result) | ServerFrame::RecentFilesResult(result) => {
                self.ingest_history(result.messages);
            }
            ServerFrame::RoomJoined(joined) => self.set_active(ViewContext::room(joined.room)),
            ServerFrame::Message(delivered) | ServerFrame::FileShared(delivered) => {
                self.ingest(delivered.message);
            }
            ServerFrame::Notification(notification) => {
                if notify::should_show(self.active.as_ref(), &notification) {
                    self.notifications.push(notification);
                }
            }
            ServerFrame::UserJoined(presence) => {
                self.update_user(&presence, true);
                self.record_presence(presence, PresenceChange::Joined);
            }
            ServerFrame::UserLeft(presence) => {
                self.users.retain(|u| u.id != presence.id);
                self.record_presence(presence, PresenceChange::Left);
            }
            ServerFrame::UserOffline(presence) => {
                self.update_user(&presence, false);
                self.record_presence(presence, PresenceChange::Offline);
            }
            ServerFrame::Error(error) => self.last_error = Some(error.to_chat_error()),
            ServerFrame::Ping(_) | ServerFrame::HealthStatus(_) => {}
        }
    }

    fn update_user(&mut self, presence: &Presence, active: bool) {
        let summary = UserSummary {
            id: presence.id.clone(),
            name: presence.name.clone(),
            role: presence.role,
            room: presence.room.clone(),
            active,
        };
        match self.users.iter_mut().find(|u| u.id == presence.id) {
            Some(user) => *user = summary,
            None => self.users.push(summary),
        }
    }

    fn record_presence(&mut self, presence: Presence, change: PresenceChange) {
        let Some(room) = presence.room else {
            return;
        };
        let announces = self
            .rooms
            .iter()
            .any(|r| r.key == room && r.system_messages);
        if announces {
            self.entries.push(Entry::System(SystemEntry {
                room,
                name: presence.name,
                change,
                timestamp: presence.timestamp,
            }));
        }
    }

    /// Current session, or the same name and role from an earlier one
    fn sent_by_me(&self, message: &ChatMessage) -> bool {
        self.me.as_ref().is_some_and(|me| {
            me.session_id == message.sender_id || message.sent_by(&me.identity())
        })
    }

    fn addressed_to_me(&self, message: &ChatMessage) -> bool {
        self.me.as_ref().is_some_and(|me| {
            message.recipient_id() == Some(me.session_id.as_str())
                || message.addressed_to(&me.identity())
        })
    }

    fn in_active_view(&self, message: &ChatMessage) -> bool {
        self.active
            .as_ref()
            .is_some_and(|view| self.message_in_view(view, message))
    }

    fn message_in_view(&self, view: &ViewContext, message: &ChatMessage) -> bool {
        match view {
            ViewContext::Room { room } => match message.room() {
                Some(key) => key == room,
                // Broadcasts show in the lobby
                None => message.is_broadcast() && self.is_default_room(room),
            },
            ViewContext::Direct { peer_id, peer_name } => {
                let (Some(recipient_id), Some(recipient_name)) =
                    (message.recipient_id(), message.recipient_name())
                else {
                    return false;
                };
                let is_peer = |id: &str, name: &str| id == peer_id || name == peer_name;
                (self.sent_by_me(message) && is_peer(recipient_id, recipient_name))
                    || (is_peer(&message.sender_id, &message.sender_name)
                        && self.addressed_to_me(message))
            }
        }
    }

    fn is_default_room(&self, key: &str) -> bool {
        let default = self
            .rooms
            .iter()
            .find(|r| r.system_messages)
            .or_else(|| self.rooms.first());
        default.is_none_or(|r| r.key == key)
    }
}

/// Unread key of a message received from someone else
fn conversation_of(message: &ChatMessage) -> Option<ConversationKey> {
    match message.room() {
        Some(room) => Some(ConversationKey::Room(room.to_string())),
        None if message.is_direct() => Some(ConversationKey::Peer(message.sender_id.clone())),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageKind, MessageTarget, NotificationKind};
    use crate::protocol::messages::{Delivered, Joined, RoomsInfo};
    use crate::server::rooms::RoomDirectory;

    fn message(id: &str, sender: &str, target: MessageTarget, timestamp: u64) -> ChatMessage {
        ChatMessage {
            message_id: id.to_string(),
            kind: MessageKind::Text,
            sender_id: format!("{}-conn", sender),
            sender_name: sender.to_string(),
            sender_role: Role::Student,
            target,
            timestamp,
            text: format!("{} says hi", sender),
            file: None,
        }
    }

    fn room(key: &str) -> MessageTarget {
        MessageTarget::Room {
            room: key.to_string(),
        }
    }

    fn direct(to: &str) -> MessageTarget {
        MessageTarget::Direct {
            recipient_id: format!("{}-conn", to),
            recipient_name: to.to_string(),
            recipient_role: None,
        }
    }

    fn alice_state() -> ClientState {
        let mut state = ClientState::with_identity("alice-conn", "alice", Role::Student);
        state.apply(ServerFrame::RoomsInfo(RoomsInfo {
            rooms: RoomDirectory::default().info(),
        }));
        state.set_active(ViewContext::room("general"));
        state
    }

    fn ids(entries: &[&Entry]) -> Vec<String> {
        entries
            .iter()
            .filter_map(|e| e.as_chat())
            .map(|m| m.message_id.clone())
            .collect()
    }

    #[test]
    fn test_unread_counts_and_reset() {
        let mut state = alice_state();
        for i in 0..3 {
            assert!(state.ingest(message(&format!("a{}", i), "bob", room("assignments"), i)));
        }
        assert_eq!(state.unread_room("assignments"), 3);
        assert_eq!(state.unread_room("general"), 0);

        state.set_active(ViewContext::room("assignments"));
        assert_eq!(state.unread_room("assignments"), 0);
        assert_eq!(state.view().len(), 3);
    }

    #[test]
    fn test_no_unread_for_own_active_or_broadcast() {
        let mut state = alice_state();
        state.ingest(message("m1", "alice", room("assignments"), 1));
        state.ingest(message("m2", "bob", room("general"), 2));
        state.ingest(message("m3", "bob", MessageTarget::Broadcast, 3));
        assert_eq!(state.total_unread(), 0);

        state.ingest(message("m4", "bob", direct("alice"), 4));
        assert_eq!(state.unread(&ConversationKey::Peer("bob-conn".into())), 1);
    }

    #[test]
    fn test_duplicate_delivery_rejected() {
        let mut state = alice_state();
        assert!(state.ingest(message("m1", "bob", room("assignments"), 1)));
        assert!(!state.ingest(message("m1", "bob", room("assignments"), 1)));
        assert_eq!(state.entries().len(), 1);
        assert_eq!(state.unread_room("assignments"), 1);
    }

    #[test]
    fn test_local_copy_dedups_echo() {
        let mut state = alice_state();
        let own = message("m1", "alice", direct("bob"), 1);
        assert!(state.record_local(own.clone()));
        assert!(!state.ingest(own));
        assert_eq!(state.messages().count(), 1);
    }

    #[test]
    fn test_history_reingest_is_idempotent() {
        let mut state = alice_state();
        state.ingest(message("m2", "bob", room("general"), 20));
        state.ingest(message("m4", "bob", room("general"), 40));

        let batch = vec![
            message("m5", "bob", room("general"), 50),
            message("m1", "bob", room("general"), 10),
            message("m3", "bob", room("general"), 30),
            message("m2", "bob", room("general"), 20),
            message("m3", "bob", room("general"), 30),
        ];
        assert_eq!(state.ingest_history(batch.clone()), 3);
        let before = ids(&state.view());
        assert_eq!(before, vec!["m1", "m2", "m3", "m4", "m5"]);

        assert_eq!(state.ingest_history(batch), 0);
        assert_eq!(ids(&state.view()), before);
    }

    #[test]
    fn test_history_never_reorders_existing() {
        let mut state = alice_state();
        // Live arrival order disagrees with timestamps
        state.ingest(message("late", "bob", room("general"), 90));
        state.ingest(message("early", "bob", room("general"), 10));
        state.ingest_history(vec![message("mid", "bob", room("general"), 50)]);

        let order = ids(&state.view());
        let late = order.iter().position(|id| id == "late").unwrap();
        let early = order.iter().position(|id| id == "early").unwrap();
        assert!(late < early);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_history_leaves_unread_alone() {
        let mut state = alice_state();
        state.ingest_history(vec![message("m1", "bob", room("assignments"), 1)]);
        assert_eq!(state.total_unread(), 0);
    }

    #[test]
    fn test_direct_view_isolation() {
        let mut alice = alice_state();
        let mut carol = ClientState::with_identity("carol-conn", "carol", Role::Student);
        let dm = message("d1", "alice", direct("bob"), 1);
        let reply = message("d2", "bob", direct("alice"), 2);

        for state in [&mut alice, &mut carol] {
            state.ingest(dm.clone());
            state.ingest(reply.clone());
        }

        let with_bob = ViewContext::direct("bob-conn", "bob");
        assert_eq!(ids(&alice.view_of(&with_bob)), vec!["d1", "d2"]);
        assert!(carol.view_of(&with_bob).is_empty());
        assert!(carol.view_of(&ViewContext::direct("alice-conn", "alice")).is_empty());
        assert!(carol.view_of(&ViewContext::room("general")).is_empty());
    }

    #[test]
    fn test_same_name_other_role_is_not_self() {
        let mut state = alice_state();
        for i in 0..3 {
            let mut from_admin = message(&format!("a{}", i), "alice", room("assignments"), i);
            from_admin.sender_id = "alice-admin-conn".to_string();
            from_admin.sender_role = Role::Admin;
            state.ingest(from_admin);
        }
        assert_eq!(state.unread_room("assignments"), 3);

        // Same name and role from an earlier session is still self
        let mut earlier = message("e1", "alice", room("assignments"), 10);
        earlier.sender_id = "old-alice-conn".to_string();
        state.ingest(earlier);
        assert_eq!(state.unread_room("assignments"), 3);
    }

    #[test]
    fn test_direct_view_ignores_other_role_with_same_name() {
        let mut alice = alice_state();
        let mut from_admin = message("d1", "alice", direct("bob"), 1);
        from_admin.sender_id = "alice-admin-conn".to_string();
        from_admin.sender_role = Role::Admin;
        let to_admin = message(
            "d2",
            "bob",
            MessageTarget::Direct {
                recipient_id: "alice-admin-conn".to_string(),
                recipient_name: "alice".to_string(),
                recipient_role: Some(Role::Admin),
            },
            2,
        );
        alice.ingest(from_admin);
        alice.ingest(to_admin);

        assert!(alice.view_of(&ViewContext::direct("bob-conn", "bob")).is_empty());
    }

    #[test]
    fn test_presence_entries_follow_system_messages_flag() {
        let mut state = alice_state();
        let presence = |room: &str| Presence {
            id: "bob-conn".into(),
            name: "bob".into(),
            role: Role::Student,
            room: Some(room.to_string()),
            timestamp: 5,
        };
        state.apply(ServerFrame::UserJoined(presence("general")));
        state.apply(ServerFrame::UserJoined(presence("assignments")));

        let general = state.view_of(&ViewContext::room("general"));
        assert_eq!(general.len(), 1);
        match general[0] {
            Entry::System(entry) => assert_eq!(entry.text(), "bob joined"),
            other => panic!("unexpected entry {:?}", other),
        }
        assert!(state.view_of(&ViewContext::room("assignments")).is_empty());

        state.apply(ServerFrame::UserLeft(presence("general")));
        assert!(state.users().is_empty());
    }

    #[test]
    fn test_apply_join_and_delivery() {
        let mut state = ClientState::new();
        state.apply(ServerFrame::Joined(Joined {
            session_id: "s-1".into(),
            name: "alice".into(),
            role: Role::Student,
            room: "general".into(),
        }));
        assert_eq!(state.identity().unwrap().session_id, "s-1");
        assert_eq!(state.active(), Some(&ViewContext::room("general")));

        state.apply(ServerFrame::delivery(Delivered {
            message: message("m1", "bob", room("assignments"), 1),
            confirmation: false,
        }));
        assert_eq!(state.unread_room("assignments"), 1);
    }

    #[test]
    fn test_notification_hidden_for_active_conversation() {
        let mut state = alice_state();
        let notification = |room: &str| Notification {
            id: "n".into(),
            kind: NotificationKind::NewRoomMessage,
            from: "bob".into(),
            from_id: "bob-conn".into(),
            preview: Some("hi".into()),
            file_name: None,
            room: Some(room.to_string()),
            target_session: None,
            message_id: "m".into(),
            timestamp: 1,
        };
        state.apply(ServerFrame::Notification(notification("general")));
        state.apply(ServerFrame::Notification(notification("assignments")));

        assert_eq!(state.take_notifications().len(), 1);
        assert!(state.notifications().is_empty());
    }
}
