//! Grace timers for dropped transports
//!
//! One timer per identity. The hub polls [`ReconnectionManager::next_expired`]
//! from its own `select!`, so expiry handling is serialized with every other
//! event.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::model::{Identity, SessionId};

pub struct ReconnectionManager {
    grace: Duration,
    queue: DelayQueue<(Identity, SessionId)>,
    keys: HashMap<Identity, delay_queue::Key>,
}

impl ReconnectionManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start the grace period for `identity`, replacing any running timer
    pub fn arm(&mut self, identity: Identity, session_id: SessionId) {
        if let Some(key) = self.keys.remove(&identity) {
            self.queue.remove(&key);
        }
        let key = self
            .queue
            .insert((identity.clone(), session_id), self.grace);
        self.keys.insert(identity, key);
    }

    /// Stop the timer for `identity`. Returns whether one was running.
    pub fn cancel(&mut self, identity: &Identity) -> bool {
        match self.keys.remove(identity) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, identity: &Identity) -> bool {
        self.keys.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer to fire. Pends forever while nothing is armed.
    /// Cancel-safe.
    pub async fn next_expired(&mut self) -> Option<(Identity, SessionId)> {
        if self.queue.is_empty() {
            return std::future::pending().await;
        }
        let expired = self.queue.next().await?;
        let (identity, session_id) = expired.into_inner();
        self.keys.remove(&identity);
        Some((identity, session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn alice() -> Identity {
        Identity::new("alice", Role::Student)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_grace() {
        let mut mgr = ReconnectionManager::new(Duration::from_secs(60));
        mgr.arm(alice(), "c1".into());
        assert!(mgr.is_pending(&alice()));

        let start = tokio::time::Instant::now();
        let (identity, session) = mgr.next_expired().await.unwrap();

        assert_eq!(identity, alice());
        assert_eq!(session, "c1");
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(mgr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let mut mgr = ReconnectionManager::new(Duration::from_secs(60));
        mgr.arm(alice(), "c1".into());
        assert!(mgr.cancel(&alice()));
        assert!(!mgr.cancel(&alice()));

        let fired = tokio::time::timeout(Duration::from_secs(120), mgr.next_expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_timer() {
        let mut mgr = ReconnectionManager::new(Duration::from_secs(60));
        mgr.arm(alice(), "c1".into());
        tokio::time::advance(Duration::from_secs(30)).await;
        mgr.arm(alice(), "c2".into());
        assert_eq!(mgr.len(), 1);

        let start = tokio::time::Instant::now();
        let (_, session) = mgr.next_expired().await.unwrap();
        assert_eq!(session, "c2");
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_identities() {
        let mut mgr = ReconnectionManager::new(Duration::from_secs(10));
        let bob = Identity::new("bob", Role::Lecturer);
        mgr.arm(alice(), "c1".into());
        tokio::time::advance(Duration::from_secs(5)).await;
        mgr.arm(bob.clone(), "c2".into());

        assert_eq!(mgr.next_expired().await.unwrap().0, alice());
        assert!(mgr.is_pending(&bob));
        assert_eq!(mgr.next_expired().await.unwrap().0, bob);
    }
}
