//! Realtime notification bus.
//!
//! Every committed RPC leaves a row in the `rpc_event` outbox. Each server
//! process runs one bus over its own database handle: it reads events after
//! its cursor, re-derives the audience from current state and pushes the
//! original RPC to whichever of those users hold a connection here.
//! Delivery is at-least-once per process and unordered across processes.

use std::sync::Arc;
use std::time::Duration;

use causerie_shared::rpc::{PushEnvelope, PushMetadata, RawRpc, RpcMethod};
use causerie_shared::{IdCodec, UserId};
use causerie_store::{Database, RpcEvent, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::value::RawValue;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::processor::resolve_user;
use crate::registry::WebsocketRegistry;

/// Events planned per read. Planning runs blocking SQLite calls on the
/// executor, so the drain yields between batches.
const EVENT_BATCH: usize = 32;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub poll_interval: Duration,
    pub retention: Duration,
    pub blast_delay: Duration,
}

/// A resolved push, ready to hand to the registry.
struct Delivery {
    sender: UserId,
    rpc: Box<RawValue>,
    timestamp: DateTime<Utc>,
    audience: Audience,
}

enum Audience {
    Users(Vec<UserId>),
    /// Every connected user, after the blast delay.
    Everyone,
}

pub struct NotificationBus {
    db: Database,
    codec: Arc<IdCodec>,
    registry: WebsocketRegistry,
    wake: Arc<Notify>,
    config: BusConfig,
    cursor: i64,
}

impl NotificationBus {
    /// Start from the newest event; older events were for whoever was
    /// connected before this process existed.
    pub fn new(
        db: Database,
        codec: Arc<IdCodec>,
        registry: WebsocketRegistry,
        wake: Arc<Notify>,
        config: BusConfig,
    ) -> Result<Self, StoreError> {
        let cursor = db.latest_event_id()?;
        Ok(Self {
            db,
            codec,
            registry,
            wake,
            config,
            cursor,
        })
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Run until `shutdown` flips. Deferred blast pushes are cancelled too.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(cursor = self.cursor, "Notification bus listening");

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = prune.tick() => {
                    self.prune();
                    continue;
                }
                _ = poll.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.drain(&shutdown).await {
                error!(error = %e, cursor = self.cursor, "Failed to read change events");
            }
        }

        info!("Notification bus stopped");
    }

    /// Deliver every event after the cursor.
    pub async fn drain(&mut self, shutdown: &watch::Receiver<bool>) -> Result<usize, StoreError> {
        let mut delivered = 0;
        loop {
            let events = self.db.events_after(self.cursor, EVENT_BATCH)?;
            if events.is_empty() {
                return Ok(delivered);
            }
            for event in events {
                self.cursor = event.id;
                let delivery = match self.plan(&event) {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, sig = %event.sig, "Skipping change event");
                        continue;
                    }
                };
                deliver(
                    &self.registry,
                    &self.codec,
                    self.config.blast_delay,
                    delivery,
                    shutdown,
                )
                .await;
                delivered += 1;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Work out who should hear about `event`, from current state.
    fn plan(&self, event: &RpcEvent) -> Result<Option<Delivery>, StoreError> {
        let Some(entry) = self.db.get_rpc_log(&event.sig)? else {
            warn!(sig = %event.sig, "Change event without an rpc log row");
            return Ok(None);
        };
        let raw = match RawRpc::from_slice(entry.rpc.as_bytes()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, sig = %event.sig, "Logged rpc is not parsable");
                return Ok(None);
            }
        };
        let sender = match resolve_user(&self.db, &self.codec, &entry.from_wallet, &raw) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, sig = %event.sig, "Cannot resolve sender for push");
                return Ok(None);
            }
        };

        let audience = if RpcMethod::parse(&raw.method) == Some(RpcMethod::Blast) {
            Audience::Everyone
        } else if let Some(chat_id) = raw.chat_id() {
            let recipients = self
                .db
                .visible_member_ids(chat_id)?
                .into_iter()
                .filter(|user| *user != sender)
                .collect();
            Audience::Users(recipients)
        } else {
            debug!(method = %raw.method, "No realtime audience");
            return Ok(None);
        };

        Ok(Some(Delivery {
            sender,
            rpc: RawValue::from_string(entry.rpc)?,
            timestamp: entry.relayed_at,
            audience,
        }))
    }

    fn prune(&self) {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        match self.db.prune_events(Utc::now() - retention) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned change events"),
            Err(e) => warn!(error = %e, "Failed to prune change events"),
        }
    }
}

/// Push now to named users, or to everyone connected once the blast delay
/// has passed. The deferred push is dropped on shutdown.
async fn deliver(
    registry: &WebsocketRegistry,
    codec: &Arc<IdCodec>,
    blast_delay: Duration,
    delivery: Delivery,
    shutdown: &watch::Receiver<bool>,
) {
    match delivery.audience {
        Audience::Users(ref users) => {
            for user in users {
                push(registry, codec, &delivery, *user).await;
            }
        }
        Audience::Everyone => {
            let registry = registry.clone();
            let codec = codec.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(blast_delay) => {}
                    _ = shutdown.changed() => {
                        debug!("Deferred blast push cancelled");
                        return;
                    }
                }
                let users = registry.connected_users().await;
                debug!(recipients = users.len(), "Pushing blast to all connected users");
                for user in users {
                    push(&registry, &codec, &delivery, user).await;
                }
            });
        }
    }
}

async fn push(registry: &WebsocketRegistry, codec: &IdCodec, delivery: &Delivery, receiver: UserId) {
    let payload = match encode_push(codec, delivery, receiver) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, receiver = receiver.0, "Invalid websocket payload");
            return;
        }
    };
    let connections = registry.push(receiver, payload).await;
    debug!(user_id = receiver.0, connections, "Websocket push");
}

fn encode_push(
    codec: &IdCodec,
    delivery: &Delivery,
    receiver: UserId,
) -> Result<String, StoreError> {
    let sender = codec.encode_user(delivery.sender)?;
    let envelope = PushEnvelope {
        rpc: &delivery.rpc,
        metadata: PushMetadata {
            timestamp: delivery
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            receiver_user_id: codec.encode_user(receiver)?,
            user_id: sender.clone(),
            sender_user_id: sender,
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

#[cfg(test)]
mod tests {
    use causerie_shared::rpc::ChatMessageParams;
    use serde_json::json;

    use super::*;
    use crate::processor::tests::{at, signed, Harness, ALICE, BOB};

    fn config(blast_delay: Duration) -> BusConfig {
        BusConfig {
            poll_interval: Duration::from_millis(20),
            retention: Duration::from_secs(3600),
            blast_delay,
        }
    }

    /// A second process: its own connection, registry and wake signal.
    fn process(h: &Harness, blast_delay: Duration) -> (NotificationBus, WebsocketRegistry) {
        let registry = WebsocketRegistry::new(Duration::from_secs(10), 16);
        let bus = NotificationBus::new(
            Database::open_at(&h.db_path()).unwrap(),
            h.codec.clone(),
            registry.clone(),
            Arc::new(Notify::new()),
            config(blast_delay),
        )
        .unwrap();
        (bus, registry)
    }

    async fn recv(reg: &mut crate::registry::Registration) -> serde_json::Value {
        let payload = tokio::time::timeout(Duration::from_secs(2), reg.rx.recv())
            .await
            .expect("push should arrive")
            .unwrap();
        serde_json::from_str(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_message_reaches_recipient_on_every_process() {
        let h = Harness::new();
        let (mut bus_a, registry_a) = process(&h, Duration::from_secs(30));
        let (mut bus_b, registry_b) = process(&h, Duration::from_secs(30));
        let (_stop, shutdown) = watch::channel(false);

        let mut bob_a = registry_a.register(BOB).await;
        let mut bob_b = registry_b.register(BOB).await;
        let mut alice_a = registry_a.register(ALICE).await;

        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();
        let message = h.message_rpc("m1", "ciphertext");
        h.processor
            .apply(&signed(&h.alice, message.clone(), at(5)))
            .await
            .unwrap();

        assert_eq!(bus_a.drain(&shutdown).await.unwrap(), 2);
        assert_eq!(bus_b.drain(&shutdown).await.unwrap(), 2);
        assert_eq!(bus_a.cursor(), bus_b.cursor());

        for reg in [&mut bob_a, &mut bob_b] {
            let create = recv(reg).await;
            assert_eq!(create["rpc"]["method"], "chat.create");
            let push = recv(reg).await;
            assert_eq!(push["rpc"], message);
            let metadata = &push["metadata"];
            assert_eq!(metadata["sender_user_id"], h.codec.encode_user(ALICE).unwrap());
            assert_eq!(metadata["receiver_user_id"], h.codec.encode_user(BOB).unwrap());
            assert_eq!(metadata["user_id"], metadata["sender_user_id"]);
            assert_eq!(metadata["timestamp"], "2023-11-14T22:13:25.000000000Z");
        }
        // The sender is not echoed.
        assert!(alice_a.rx.try_recv().is_err());

        // Nothing is delivered twice.
        assert_eq!(bus_a.drain(&shutdown).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_spans_several_batches() {
        let h = Harness::new();
        let (mut bus, _registry) = process(&h, Duration::from_secs(30));
        let (_stop, shutdown) = watch::channel(false);

        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();
        let count = EVENT_BATCH * 2 + 3;
        for i in 0..count {
            let message = h.message_rpc(&format!("m{i}"), "ciphertext");
            h.processor
                .apply(&signed(&h.alice, message, at(1 + i as i64)))
                .await
                .unwrap();
        }

        assert_eq!(bus.drain(&shutdown).await.unwrap(), count + 1);
        let latest = h.db.lock().await.latest_event_id().unwrap();
        assert_eq!(bus.cursor(), latest);
    }

    #[tokio::test]
    async fn test_hidden_member_not_pushed() {
        let h = Harness::new();
        let (mut bus, registry) = process(&h, Duration::from_secs(30));
        let (_stop, shutdown) = watch::channel(false);
        let mut alice = registry.register(ALICE).await;

        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();
        h.processor
            .apply(&signed(&h.bob, h.message_rpc("m1", "ciphertext"), at(1)))
            .await
            .unwrap();
        bus.drain(&shutdown).await.unwrap();
        // Her own create is not echoed back.
        assert_eq!(recv(&mut alice).await["rpc"]["method"], "chat.message");
        assert!(alice.rx.try_recv().is_err());

        // Once Alice hides the chat, Bob's activity no longer reaches her.
        let delete = json!({"method": "chat.delete", "params": {"chat_id": h.chat_id()}});
        h.processor.apply(&signed(&h.alice, delete, at(2))).await.unwrap();
        let read = json!({"method": "chat.read", "params": {"chat_id": h.chat_id()}});
        h.processor.apply(&signed(&h.bob, read, at(3))).await.unwrap();

        bus.drain(&shutdown).await.unwrap();
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blast_pushed_to_everyone_after_delay() {
        let h = Harness::new();
        let (mut bus, registry) = process(&h, Duration::from_millis(100));
        let (_stop, shutdown) = watch::channel(false);
        let mut bob = registry.register(BOB).await;
        let mut stranger = registry.register(UserId(77)).await;

        let blast = json!({
            "method": "chat.blast",
            "params": {"blast_id": "b1", "audience": "follower_audience", "message": "tour dates"},
        });
        h.processor.apply(&signed(&h.alice, blast, at(0))).await.unwrap();
        bus.drain(&shutdown).await.unwrap();

        assert!(bob.rx.try_recv().is_err());
        let push = recv(&mut bob).await;
        assert_eq!(push["rpc"]["params"]["blast_id"], "b1");
        assert_eq!(recv(&mut stranger).await["rpc"]["method"], "chat.blast");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_deferred_blast() {
        let h = Harness::new();
        let (mut bus, registry) = process(&h, Duration::from_millis(200));
        let (stop, shutdown) = watch::channel(false);
        let mut bob = registry.register(BOB).await;

        let blast = json!({
            "method": "chat.blast",
            "params": {"blast_id": "b2", "audience": "tipper_audience", "message": "thanks"},
        });
        h.processor.apply(&signed(&h.alice, blast, at(0))).await.unwrap();
        bus.drain(&shutdown).await.unwrap();
        stop.send(true).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_loop_woken_by_processor() {
        let h = Harness::new();
        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();

        let registry = WebsocketRegistry::new(Duration::from_secs(10), 16);
        let bus = NotificationBus::new(
            Database::open_at(&h.db_path()).unwrap(),
            h.codec.clone(),
            registry.clone(),
            h.wake.clone(),
            BusConfig {
                poll_interval: Duration::from_secs(3600),
                ..config(Duration::from_secs(30))
            },
        )
        .unwrap();
        assert_eq!(bus.cursor(), 1);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(bus.run(shutdown));

        let mut bob = registry.register(BOB).await;
        h.processor
            .apply(&signed(&h.alice, h.message_rpc("m1", "ciphertext"), at(1)))
            .await
            .unwrap();
        assert_eq!(recv(&mut bob).await["rpc"]["method"], "chat.message");

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_push_shape() {
        let codec = IdCodec::default();
        let params = ChatMessageParams {
            chat_id: "x:y".into(),
            message_id: "m".into(),
            message: "hi".into(),
            parent_message_id: None,
            is_plaintext: None,
            audience: None,
        };
        let rpc = json!({"method": "chat.message", "params": params}).to_string();
        let delivery = Delivery {
            sender: ALICE,
            rpc: RawValue::from_string(rpc).unwrap(),
            timestamp: at(0),
            audience: Audience::Everyone,
        };
        let payload: serde_json::Value =
            serde_json::from_str(&encode_push(&codec, &delivery, BOB).unwrap()).unwrap();
        assert_eq!(payload["rpc"]["params"]["chat_id"], "x:y");
        assert_eq!(payload["metadata"]["timestamp"], "2023-11-14T22:13:20.000000000Z");
    }
}
