//! Session registry: who is connected, where they are and when they were
//! last heard from.
//!
//! Owned by the hub task; no interior locking.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::current_timestamp;
use crate::model::{Identity, Role, RoomKey, SessionId, UserSummary, ViewContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    /// Transport dropped; waiting out the grace period
    Inactive,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub identity: Identity,
    /// Wall clock, milliseconds
    pub connected_at: u64,
    pub last_active_at: Instant,
    pub activity: Activity,
    pub current_room: Option<RoomKey>,
    pub view: Option<ViewContext>,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn is_active(&self) -> bool {
        self.activity == Activity::Active
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            name: self.identity.name.clone(),
            role: self.identity.role,
            room: self.current_room.clone(),
            active: self.is_active(),
        }
    }
}

/// Result of [`SessionRegistry::join`]
#[derive(Debug)]
pub struct JoinOutcome {
    pub session_id: SessionId,
    /// Prior entry with the same identity (stale or duplicate), now removed
    pub replaced: Option<Session>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_identity: HashMap<Identity, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh active session. Any entry with the same name+role is
    /// removed and returned so the caller can retire its connection.
    pub fn join(&mut self, id: SessionId, identity: Identity, now: Instant) -> JoinOutcome {
        let mut replaced = self
            .by_identity
            .get(&identity)
            .cloned()
            .and_then(|prior| self.evict(&prior));

        // Same connection joining again under a different identity
        if let Some(previous) = self.evict(&id) {
            replaced.get_or_insert(previous);
        }

        let session = Session {
            id: id.clone(),
            identity: identity.clone(),
            connected_at: current_timestamp(),
            last_active_at: now,
            activity: Activity::Active,
            current_room: None,
            view: None,
        };
        self.by_identity.insert(identity, id.clone());
        self.sessions.insert(id.clone(), session);

        JoinOutcome {
            session_id: id,
            replaced,
        }
    }

    /// Record an activity signal
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_active_at = now;
                session.activity = Activity::Active;
                true
            }
            None => false,
        }
    }

    pub fn mark_inactive(&mut self, id: &str, now: Instant) -> Option<&Session> {
        let session = self.sessions.get_mut(id)?;
        session.activity = Activity::Inactive;
        session.last_active_at = now;
        Some(session)
    }

    pub fn evict(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if self.by_identity.get(&session.identity).map(String::as_str) == Some(id) {
            self.by_identity.remove(&session.identity);
        }
        Some(session)
    }

    pub fn find(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn find_by_identity(&self, identity: &Identity) -> Option<&Session> {
        self.by_identity
            .get(identity)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn all(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Sessions with a connected transport
    pub fn live(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.is_active())
    }

    /// Move a session to `room` in one assignment.
    /// Returns the previous room, or `None` if the session is unknown.
    pub fn switch_room(&mut self, id: &str, room: &str) -> Option<Option<RoomKey>> {
        let session = self.sessions.get_mut(id)?;
        Some(session.current_room.replace(room.to_string()))
    }

    pub fn set_view(&mut self, id: &str, view: ViewContext) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.view = Some(view);
                true
            }
            None => false,
        }
    }

    /// Live sessions currently in `room`
    pub fn members_of<'a>(&'a self, room: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.live()
            .filter(move |s| s.current_room.as_deref() == Some(room))
    }

    /// Live sessions not heard from for longer than `threshold`. Inactive
    /// ones belong to their grace timer.
    pub fn stale(&self, now: Instant, threshold: Duration) -> Vec<SessionId> {
        self.live()
            .filter(|s| now.saturating_duration_since(s.last_active_at) > threshold)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Live user list, sorted by name for stable output
    pub fn user_list(&self) -> Vec<UserSummary> {
        let mut users: Vec<UserSummary> = self.live().map(Session::summary).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        users
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", Role::Student)
    }

    #[test]
    fn test_join_and_find() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        let outcome = reg.join("c1".into(), alice(), now);

        assert_eq!(outcome.session_id, "c1");
        assert!(outcome.replaced.is_none());
        assert!(reg.find("c1").unwrap().is_active());
        assert_eq!(reg.find_by_identity(&alice()).unwrap().id, "c1");
    }

    #[test]
    fn test_join_replaces_same_identity() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        reg.join("c1".into(), alice(), now);
        reg.mark_inactive("c1", now);

        let outcome = reg.join("c2".into(), alice(), now);
        assert_eq!(outcome.replaced.unwrap().id, "c1");
        assert_eq!(reg.len(), 1);
        assert!(reg.find("c1").is_none());
        assert_eq!(reg.find_by_identity(&alice()).unwrap().id, "c2");
    }

    #[test]
    fn test_same_name_different_role_coexist() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        reg.join("c1".into(), alice(), now);
        let outcome = reg.join("c2".into(), Identity::new("alice", Role::Admin), now);

        assert!(outcome.replaced.is_none());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_rejoin_on_same_connection() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        reg.join("c1".into(), alice(), now);
        let outcome = reg.join("c1".into(), Identity::new("bob", Role::Student), now);

        assert_eq!(outcome.replaced.unwrap().identity, alice());
        assert!(reg.find_by_identity(&alice()).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_switch_room_returns_previous() {
        let mut reg = SessionRegistry::new();
        reg.join("c1".into(), alice(), Instant::now());

        assert_eq!(reg.switch_room("c1", "general"), Some(None));
        assert_eq!(
            reg.switch_room("c1", "assignments"),
            Some(Some("general".to_string()))
        );
        assert_eq!(reg.switch_room("missing", "general"), None);
        assert_eq!(reg.members_of("general").count(), 0);
        assert_eq!(reg.members_of("assignments").count(), 1);
    }

    #[test]
    fn test_inactive_sessions_are_not_live() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        reg.join("c1".into(), alice(), now);
        reg.switch_room("c1", "general");
        reg.mark_inactive("c1", now);

        assert_eq!(reg.live().count(), 0);
        assert_eq!(reg.members_of("general").count(), 0);
        assert_eq!(reg.all().count(), 1);
        assert!(reg.user_list().is_empty());

        assert!(reg.touch("c1", now));
        assert_eq!(reg.live().count(), 1);
    }

    #[test]
    fn test_stale_detection() {
        let mut reg = SessionRegistry::new();
        let start = Instant::now();
        reg.join("c1".into(), alice(), start);
        reg.join("c2".into(), Identity::new("bob", Role::Lecturer), start);
        reg.touch("c2", start + Duration::from_secs(100));

        let stale = reg.stale(start + Duration::from_secs(121), Duration::from_secs(120));
        assert_eq!(stale, vec!["c1".to_string()]);
    }

    #[test]
    fn test_stale_skips_inactive_sessions() {
        let mut reg = SessionRegistry::new();
        let start = Instant::now();
        reg.join("c1".into(), alice(), start);
        reg.mark_inactive("c1", start);

        let stale = reg.stale(start + Duration::from_secs(500), Duration::from_secs(120));
        assert!(stale.is_empty());
    }

    #[test]
    fn test_evict_keeps_newer_identity_mapping() {
        let mut reg = SessionRegistry::new();
        let now = Instant::now();
        reg.join("c1".into(), alice(), now);
        reg.join("c2".into(), alice(), now);

        // c1 is already gone; evicting it again must not drop c2's mapping
        assert!(reg.evict("c1").is_none());
        assert_eq!(reg.find_by_identity(&alice()).unwrap().id, "c2");
    }
}
