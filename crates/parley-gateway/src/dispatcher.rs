//! Live-session registry. Maps each user to the set of their currently open,
//! authenticated sessions; a user with two devices has two entries under the
//! same key, and fanout reaches both.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Manages all connected sessions and delivers events to them.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// user_id -> session_id -> event channel
    sessions: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>>,

    /// Held across persist + fanout of a chat message so broadcast order
    /// within a conversation always matches persistence order.
    send_order: Mutex<()>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: RwLock::new(HashMap::new()),
                send_order: Mutex::new(()),
            }),
        }
    }

    /// Register a new live session for a user. Returns the session id and
    /// the receiver end of its event channel.
    pub async fn register_session(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sessions
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(session_id, tx);
        (session_id, rx)
    }

    /// Remove one session. Keyed by (user, session) so a fresh reconnect is
    /// never evicted by the cleanup of the connection it replaced.
    pub async fn unregister_session(&self, user_id: Uuid, session_id: Uuid) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(user_sessions) = sessions.get_mut(&user_id) {
            user_sessions.remove(&session_id);
            if user_sessions.is_empty() {
                sessions.remove(&user_id);
            }
        }
    }

    /// Deliver an event to every live session of one user. Returns true when
    /// the user had at least one live session.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(&user_id) {
            Some(user_sessions) if !user_sessions.is_empty() => {
                for tx in user_sessions.values() {
                    let _ = tx.send(event.clone());
                }
                true
            }
            _ => false,
        }
    }

    /// Deliver an event to exactly one session, e.g. an `error` frame that
    /// must reach only the offending sender.
    pub async fn send_to_session(&self, user_id: Uuid, session_id: Uuid, event: GatewayEvent) {
        let sessions = self.inner.sessions.read().await;
        if let Some(tx) = sessions.get(&user_id).and_then(|s| s.get(&session_id)) {
            let _ = tx.send(event);
        }
    }

    /// Fan an event out to every live session of every listed user. Returns
    /// the users that had at least one live session at broadcast time.
    pub async fn fan_out(&self, user_ids: &[Uuid], event: &GatewayEvent) -> Vec<Uuid> {
        let sessions = self.inner.sessions.read().await;
        let mut reached = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let Some(user_sessions) = sessions.get(user_id) {
                if user_sessions.is_empty() {
                    continue;
                }
                for tx in user_sessions.values() {
                    let _ = tx.send(event.clone());
                }
                reached.push(*user_id);
            }
        }
        reached
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .sessions
            .read()
            .await
            .get(&user_id)
            .is_some_and(|s| !s.is_empty())
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .get(&user_id)
            .map_or(0, |s| s.len())
    }

    /// Acquire the gateway-wide send-order lock.
    pub async fn send_order(&self) -> MutexGuard<'_, ()> {
        self.inner.send_order.lock().await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(user_id: Uuid) -> GatewayEvent {
        GatewayEvent::Authenticated { user_id }
    }

    #[tokio::test]
    async fn every_session_of_a_user_receives_fanout() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, mut rx1) = dispatcher.register_session(user).await;
        let (_, mut rx2) = dispatcher.register_session(user).await;

        let reached = dispatcher.fan_out(&[user], &ping(user)).await;
        assert_eq!(reached, vec![user]);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn fan_out_reports_only_online_users() {
        let dispatcher = Dispatcher::new();
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();
        let (_, mut rx) = dispatcher.register_session(online).await;

        let reached = dispatcher.fan_out(&[online, offline], &ping(online)).await;
        assert_eq!(reached, vec![online]);
        assert!(rx.try_recv().is_ok());
        assert!(!dispatcher.is_online(offline).await);
    }

    #[tokio::test]
    async fn unregister_is_keyed_by_session() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (old_session, _rx_old) = dispatcher.register_session(user).await;
        let (_new_session, mut rx_new) = dispatcher.register_session(user).await;

        // Cleanup of the old connection must not evict the new session
        dispatcher.unregister_session(user, old_session).await;
        assert!(dispatcher.is_online(user).await);
        assert_eq!(dispatcher.session_count(user).await, 1);

        assert!(dispatcher.send_to_user(user, ping(user)).await);
        assert!(rx_new.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_session_targets_one_session_only() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (s1, mut rx1) = dispatcher.register_session(user).await;
        let (_s2, mut rx2) = dispatcher.register_session(user).await;

        dispatcher.send_to_session(user, s1, ping(user)).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_goes_offline_when_last_session_closes() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (s1, _rx) = dispatcher.register_session(user).await;

        dispatcher.unregister_session(user, s1).await;
        assert!(!dispatcher.is_online(user).await);
        assert!(!dispatcher.send_to_user(user, ping(user)).await);
    }
}
