//! Live websocket connections held by this process.
//!
//! Each user may have several connections. Outbound payloads go through a
//! bounded queue per connection; a client that cannot keep up is dropped
//! rather than allowed to stall the pusher. Recently pushed payloads are
//! kept for a short while and replayed to a connection when it registers,
//! which covers a client reconnecting just as its message was applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use causerie_shared::UserId;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registered connection's receiving end.
#[derive(Debug)]
pub struct Registration {
    pub id: Uuid,
    pub user: UserId,
    pub rx: mpsc::Receiver<String>,
}

struct RecentPush {
    user: UserId,
    sent_at: Instant,
    payload: String,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<UserId, HashMap<Uuid, mpsc::Sender<String>>>,
    recent: VecDeque<RecentPush>,
}

impl Inner {
    fn prune_recent(&mut self, ttl: Duration) {
        let now = Instant::now();
        while let Some(front) = self.recent.front() {
            if now.duration_since(front.sent_at) < ttl {
                break;
            }
            self.recent.pop_front();
        }
    }

    fn remove(&mut self, user: UserId, id: Uuid) -> bool {
        let Some(conns) = self.clients.get_mut(&user) else {
            return false;
        };
        let removed = conns.remove(&id).is_some();
        if conns.is_empty() {
            self.clients.remove(&user);
        }
        removed
    }
}

#[derive(Clone)]
pub struct WebsocketRegistry {
    inner: Arc<Mutex<Inner>>,
    replay_ttl: Duration,
    queue_size: usize,
}

impl WebsocketRegistry {
    pub fn new(replay_ttl: Duration, queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            replay_ttl,
            queue_size: queue_size.max(1),
        }
    }

    /// Register a connection for `user`, replaying any still-fresh pushes.
    pub async fn register(&self, user: UserId) -> Registration {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = Uuid::new_v4();

        let mut inner = self.inner.lock().await;
        inner.prune_recent(self.replay_ttl);

        let mut replayed = 0;
        for recent in inner.recent.iter().filter(|r| r.user == user) {
            if tx.try_send(recent.payload.clone()).is_err() {
                break;
            }
            replayed += 1;
        }

        let conns = inner.clients.entry(user).or_default();
        conns.insert(id, tx);
        info!(
            user_id = user.0,
            connection = %id,
            connections = conns.len(),
            replayed,
            "Websocket registered"
        );

        Registration { id, user, rx }
    }

    pub async fn unregister(&self, user: UserId, id: Uuid) {
        if self.inner.lock().await.remove(user, id) {
            info!(user_id = user.0, connection = %id, "Websocket unregistered");
        }
    }

    /// Queue `payload` on every connection of `user`.
    ///
    /// The payload is also kept for replay. Returns the number of
    /// connections it was queued on.
    pub async fn push(&self, user: UserId, payload: String) -> usize {
        let mut inner = self.inner.lock().await;
        inner.prune_recent(self.replay_ttl);
        inner.recent.push_back(RecentPush {
            user,
            sent_at: Instant::now(),
            payload: payload.clone(),
        });

        let Some(conns) = inner.clients.get(&user) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in conns {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user_id = user.0, connection = %id, "Send queue full, dropping client");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(user_id = user.0, connection = %id, "Connection closed");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            inner.remove(user, id);
        }

        delivered
    }

    pub async fn connected_users(&self) -> Vec<UserId> {
        self.inner.lock().await.clients.keys().copied().collect()
    }

    pub async fn connection_count(&self, user: UserId) -> usize {
        self.inner
            .lock()
            .await
            .clients
            .get(&user)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_reaches_every_connection() {
        let registry = WebsocketRegistry::new(Duration::from_secs(10), 8);
        let mut phone = registry.register(UserId(1)).await;
        let mut laptop = registry.register(UserId(1)).await;
        let mut other = registry.register(UserId(2)).await;

        assert_eq!(registry.push(UserId(1), "hello".into()).await, 2);
        assert_eq!(phone.rx.recv().await.unwrap(), "hello");
        assert_eq!(laptop.rx.recv().await.unwrap(), "hello");
        assert!(other.rx.try_recv().is_err());

        registry.unregister(UserId(1), phone.id).await;
        assert_eq!(registry.connection_count(UserId(1)).await, 1);
        registry.unregister(UserId(1), laptop.id).await;
        assert_eq!(registry.connected_users().await, vec![UserId(2)]);
    }

    #[tokio::test]
    async fn test_replay_on_register() {
        let registry = WebsocketRegistry::new(Duration::from_millis(200), 8);
        assert_eq!(registry.push(UserId(1), "early".into()).await, 0);
        registry.push(UserId(2), "not yours".into()).await;

        let mut conn = registry.register(UserId(1)).await;
        assert_eq!(conn.rx.recv().await.unwrap(), "early");
        assert!(conn.rx.try_recv().is_err());

        // Stale pushes are not replayed.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut late = registry.register(UserId(2)).await;
        assert!(late.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_dropped() {
        let registry = WebsocketRegistry::new(Duration::from_secs(10), 1);
        let _slow = registry.register(UserId(1)).await;

        assert_eq!(registry.push(UserId(1), "one".into()).await, 1);
        assert_eq!(registry.push(UserId(1), "two".into()).await, 0);
        assert_eq!(registry.connection_count(UserId(1)).await, 0);
    }

    #[tokio::test]
    async fn test_closed_connection_removed() {
        let registry = WebsocketRegistry::new(Duration::from_secs(10), 4);
        let conn = registry.register(UserId(3)).await;
        drop(conn);

        assert_eq!(registry.push(UserId(3), "gone".into()).await, 0);
        assert!(registry.connected_users().await.is_empty());
    }
}
