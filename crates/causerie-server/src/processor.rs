//! Durable application of signed RPCs.
//!
//! An envelope is deduplicated on its signature, re-verified, resolved to an
//! acting user and then applied in one transaction together with its log row
//! and change event. A mutator failure rolls all three back.

use std::sync::Arc;

use causerie_shared::rpc::{ChatRpc, RawRpc, SignedRpcEnvelope};
use causerie_shared::signature::{recover_wallet, same_wallet};
use causerie_shared::{IdCodec, RpcError, UserId};
use causerie_store::blasts::chat_blast;
use causerie_store::chats::{chat_create, chat_delete, chat_read};
use causerie_store::messages::chat_send_message;
use causerie_store::permissions::{block, set_permissions, unblock};
use causerie_store::reactions::chat_react;
use causerie_store::rpc_log::{insert_rpc_log, record_event};
use causerie_store::{Connection, Database, StoreError};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::ApplyError;

/// Why an envelope was dropped without being applied or reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadSignature,
    WalletMismatch,
    Unparsable,
    Internal,
    UnknownUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already in the log; nothing changed.
    Duplicate,
    Dropped(DropReason),
}

#[derive(Clone)]
pub struct RpcProcessor {
    db: Arc<Mutex<Database>>,
    codec: Arc<IdCodec>,
    wake: Arc<Notify>,
}

impl RpcProcessor {
    pub fn new(db: Arc<Mutex<Database>>, codec: Arc<IdCodec>, wake: Arc<Notify>) -> Self {
        Self { db, codec, wake }
    }

    pub async fn apply(&self, envelope: &SignedRpcEnvelope) -> Result<ApplyOutcome, ApplyError> {
        let mut db = self.db.lock().await;

        if db.rpc_exists(&envelope.sig)? {
            debug!(sig = %envelope.sig, "RPC already applied");
            return Ok(ApplyOutcome::Duplicate);
        }

        let wallet = match recover_wallet(envelope.payload(), &envelope.sig) {
            Ok(wallet) => wallet,
            Err(e) => {
                warn!(error = %e, from_wallet = %envelope.from_wallet, "Dropping RPC with unrecoverable signature");
                return Ok(ApplyOutcome::Dropped(DropReason::BadSignature));
            }
        };
        if !same_wallet(&wallet, &envelope.from_wallet) {
            warn!(
                recovered = %wallet,
                claimed = %envelope.from_wallet,
                "Dropping RPC signed by another wallet"
            );
            return Ok(ApplyOutcome::Dropped(DropReason::WalletMismatch));
        }

        let raw = match RawRpc::from_slice(envelope.payload()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, sig = %envelope.sig, "Dropping unparsable RPC");
                return Ok(ApplyOutcome::Dropped(DropReason::Unparsable));
            }
        };
        if raw.is_internal() {
            debug!(method = %raw.method, "Skipping internal RPC");
            return Ok(ApplyOutcome::Dropped(DropReason::Internal));
        }

        let rpc = ChatRpc::from_raw(&raw)?;
        let user = match resolve_user(&db, &self.codec, &wallet, &raw) {
            Ok(user) => user,
            Err(ApplyError::UnknownUser(e)) => {
                warn!(error = %e, method = %raw.method, "Dropping RPC from unresolved user");
                return Ok(ApplyOutcome::Dropped(DropReason::UnknownUser));
            }
            Err(e) => return Err(e),
        };
        let ts = envelope.relayed_at;

        let tx = db.transaction()?;
        if !insert_rpc_log(&tx, envelope, Utc::now())? {
            debug!(sig = %envelope.sig, "Lost the race to apply RPC");
            return Ok(ApplyOutcome::Duplicate);
        }
        dispatch(&tx, &self.codec, user, &rpc, ts)?;
        record_event(&tx, &envelope.sig, Utc::now())?;
        tx.commit().map_err(StoreError::from)?;
        drop(db);

        debug!(method = %raw.method, user_id = user.0, relayed_at = %ts, "Applied RPC");
        self.wake.notify_one();
        Ok(ApplyOutcome::Applied)
    }
}

/// Resolve the acting user: an explicit claim owned by the wallet, else the
/// wallet's only active user.
pub(crate) fn resolve_user(
    db: &Database,
    codec: &IdCodec,
    wallet: &str,
    raw: &RawRpc,
) -> Result<UserId, ApplyError> {
    let claimed = raw
        .current_user_id
        .as_deref()
        .and_then(|encoded| match codec.decode_user(encoded) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable current_user_id");
                None
            }
        });

    db.resolve_user(wallet, claimed).map_err(|e| match e {
        StoreError::UnknownUser(_) | StoreError::AmbiguousUser(_) => ApplyError::UnknownUser(e),
        other => ApplyError::Store(other),
    })
}

/// Run the mutator for `rpc` inside the caller's transaction.
fn dispatch(
    conn: &Connection,
    codec: &IdCodec,
    user: UserId,
    rpc: &ChatRpc,
    ts: DateTime<Utc>,
) -> Result<(), ApplyError> {
    match rpc {
        ChatRpc::Create(params) => {
            let invites = params.decode_invites(codec)?;
            let [(a, _), (b, _)] = invites.as_slice() else {
                return Err(RpcError::Invalid("chat.create needs exactly two invites".into()).into());
            };
            let chat_id = codec.chat_id(*a, *b)?;
            if chat_id != params.chat_id {
                debug!(claimed = %params.chat_id, canonical = %chat_id, "Canonicalized chat id");
            }
            let seeded = chat_create(conn, codec, user, &chat_id, &invites, ts)?;
            if seeded > 0 {
                info!(chat_id, seeded, "Materialized pending blasts into new chat");
            }
        }
        ChatRpc::Delete(params) => chat_delete(conn, user, &params.chat_id, ts)?,
        ChatRpc::Message(params) => {
            chat_send_message(conn, user, &params.chat_id, &params.message_id, &params.message, ts)?
        }
        ChatRpc::React(params) => chat_react(
            conn,
            user,
            &params.chat_id,
            &params.message_id,
            params.reaction.as_deref(),
            ts,
        )?,
        ChatRpc::Read(params) => {
            if !chat_read(conn, user, &params.chat_id, ts)? {
                debug!(chat_id = %params.chat_id, user_id = user.0, "Read skipped, already active");
            }
        }
        ChatRpc::Permit(params) => set_permissions(conn, user, &params.update()?, ts)?,
        ChatRpc::Block(params) => block(conn, user, codec.decode_user(&params.user_id)?, ts)?,
        ChatRpc::Unblock(params) => unblock(conn, user, codec.decode_user(&params.user_id)?, ts)?,
        ChatRpc::Blast(params) => {
            let content = params.content(codec)?;
            let outgoing = chat_blast(conn, user, params, content, ts)?;
            for message in &outgoing {
                debug!(
                    to_user_id = message.to_user_id.0,
                    method = message.method,
                    chat_id = %message.params.chat_id,
                    message_id = %message.params.message_id,
                    "Blast fanned out"
                );
            }
            info!(blast_id = %params.blast_id, fanned_out = outgoing.len(), "Blast stored");
        }
        ChatRpc::Unknown(method) => {
            warn!(method, user_id = user.0, "Ignoring unknown RPC method");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use causerie_shared::signature::Wallet;
    use causerie_store::User;
    use chrono::TimeZone;
    use serde_json::value::RawValue;
    use serde_json::json;

    use super::*;

    pub(crate) const ALICE: UserId = UserId(1);
    pub(crate) const BOB: UserId = UserId(2);

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Sign `rpc` with `wallet` the way a client would.
    pub(crate) fn signed(
        wallet: &Wallet,
        rpc: serde_json::Value,
        relayed_at: DateTime<Utc>,
    ) -> SignedRpcEnvelope {
        let payload = rpc.to_string();
        SignedRpcEnvelope {
            sig: wallet.sign_payload(payload.as_bytes()),
            rpc: RawValue::from_string(payload).unwrap(),
            from_wallet: wallet.address(),
            relayed_by: "test".into(),
            relayed_at,
        }
    }

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub db: Arc<Mutex<Database>>,
        pub codec: Arc<IdCodec>,
        pub wake: Arc<Notify>,
        pub processor: RpcProcessor,
        pub alice: Wallet,
        pub bob: Wallet,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_at(&dir.path().join("chat.db")).unwrap();
            let alice = Wallet::from_secret_bytes(&[1u8; 32]);
            let bob = Wallet::from_secret_bytes(&[2u8; 32]);
            db.upsert_user(&User::new(ALICE.0, &alice.address(), "alice", at(-86_400)))
                .unwrap();
            db.upsert_user(&User::new(BOB.0, &bob.address(), "bob", at(-86_400)))
                .unwrap();

            let db = Arc::new(Mutex::new(db));
            let codec = Arc::new(IdCodec::default());
            let wake = Arc::new(Notify::new());
            let processor = RpcProcessor::new(db.clone(), codec.clone(), wake.clone());
            Self {
                dir,
                db,
                codec,
                wake,
                processor,
                alice,
                bob,
            }
        }

        pub(crate) fn db_path(&self) -> std::path::PathBuf {
            self.dir.path().join("chat.db")
        }

        pub(crate) fn chat_id(&self) -> String {
            self.codec.chat_id(ALICE, BOB).unwrap()
        }

        pub(crate) fn create_rpc(&self, code: &str) -> serde_json::Value {
            json!({
                "method": "chat.create",
                "params": {
                    "chat_id": self.chat_id(),
                    "invites": [
                        {"user_id": self.codec.encode_user(ALICE).unwrap(), "invite_code": code},
                        {"user_id": self.codec.encode_user(BOB).unwrap(), "invite_code": code},
                    ],
                },
            })
        }

        pub(crate) fn message_rpc(&self, message_id: &str, text: &str) -> serde_json::Value {
            json!({
                "method": "chat.message",
                "params": {"chat_id": self.chat_id(), "message_id": message_id, "message": text},
            })
        }
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let h = Harness::new();
        let create = signed(&h.alice, h.create_rpc("c"), at(0));
        let message = signed(&h.alice, h.message_rpc("m1", "hello"), at(1));

        assert_eq!(h.processor.apply(&create).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(h.processor.apply(&message).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(h.processor.apply(&message).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(h.processor.apply(&create).await.unwrap(), ApplyOutcome::Duplicate);

        let db = h.db.lock().await;
        assert_eq!(db.count_rpc_log().unwrap(), 2);
        assert_eq!(db.messages_for_chat(&h.chat_id()).unwrap().len(), 1);
        let bob = db.get_chat_member(&h.chat_id(), BOB).unwrap().unwrap();
        assert_eq!(bob.unread_count, 1);
        assert_eq!(db.events_after(0, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_forged_and_internal_rpcs_dropped() {
        let h = Harness::new();

        let mut forged = signed(&h.bob, h.create_rpc("c"), at(0));
        forged.from_wallet = h.alice.address();
        assert_eq!(
            h.processor.apply(&forged).await.unwrap(),
            ApplyOutcome::Dropped(DropReason::WalletMismatch)
        );

        let mut tampered = signed(&h.alice, h.create_rpc("c"), at(0));
        tampered.sig = signed(&h.alice, h.create_rpc("other"), at(0)).sig;
        assert_eq!(
            h.processor.apply(&tampered).await.unwrap(),
            ApplyOutcome::Dropped(DropReason::BadSignature)
        );

        let internal = signed(&h.alice, json!({"method": "internal.sync", "params": {}}), at(0));
        assert_eq!(
            h.processor.apply(&internal).await.unwrap(),
            ApplyOutcome::Dropped(DropReason::Internal)
        );

        // Upper-case wallet claims still match.
        let mut shouting = signed(&h.alice, h.create_rpc("c"), at(0));
        shouting.from_wallet = shouting.from_wallet.to_uppercase().replacen("0X", "0x", 1);
        assert_eq!(h.processor.apply(&shouting).await.unwrap(), ApplyOutcome::Applied);

        assert_eq!(h.db.lock().await.count_rpc_log().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_create_converges() {
        let h = Harness::new();
        let (early, late, later) = (at(10), at(20), at(30));

        for (code, ts) in [("late", late), ("early", early), ("later", later)] {
            let envelope = signed(&h.alice, h.create_rpc(code), ts);
            assert_eq!(h.processor.apply(&envelope).await.unwrap(), ApplyOutcome::Applied);
        }

        let db = h.db.lock().await;
        let chat = db.get_chat(&h.chat_id()).unwrap();
        assert_eq!(chat.created_at, early);
        for member in db.chat_members(&h.chat_id()).unwrap() {
            assert_eq!(member.invite_code, "early");
            assert_eq!(member.created_at, early);
        }
    }

    #[tokio::test]
    async fn test_mutator_failure_rolls_back() {
        let h = Harness::new();
        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();
        h.processor
            .apply(&signed(&h.alice, h.message_rpc("m1", "first"), at(1)))
            .await
            .unwrap();

        // Same message id, different payload: the insert collides.
        let clash = signed(&h.bob, h.message_rpc("m1", "second"), at(2));
        assert!(matches!(
            h.processor.apply(&clash).await,
            Err(ApplyError::Store(_))
        ));

        let db = h.db.lock().await;
        assert!(!db.rpc_exists(&clash.sig).unwrap());
        assert_eq!(db.count_rpc_log().unwrap(), 2);
        assert_eq!(db.latest_event_id().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_user_dropped_and_bad_params_reported() {
        let h = Harness::new();
        let stranger = Wallet::from_secret_bytes(&[9u8; 32]);
        assert_eq!(
            h.processor
                .apply(&signed(&stranger, h.create_rpc("c"), at(0)))
                .await
                .unwrap(),
            ApplyOutcome::Dropped(DropReason::UnknownUser)
        );
        assert_eq!(h.db.lock().await.count_rpc_log().unwrap(), 0);

        let malformed = signed(
            &h.alice,
            json!({"method": "chat.react", "params": {"chat_id": h.chat_id()}}),
            at(0),
        );
        assert!(matches!(
            h.processor.apply(&malformed).await,
            Err(ApplyError::Params(_))
        ));

        // Unknown methods commit without effect.
        let typing = signed(&h.alice, json!({"method": "chat.typing", "params": {}}), at(0));
        assert_eq!(h.processor.apply(&typing).await.unwrap(), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_block_roundtrip_through_log() {
        let h = Harness::new();
        let bob_id = h.codec.encode_user(BOB).unwrap();
        let block = json!({"method": "chat.block", "params": {"user_id": bob_id}});
        let unblock = json!({"method": "chat.unblock", "params": {"user_id": bob_id}});

        // The unblock arrives first but is newer; the stale block must not win.
        h.processor.apply(&signed(&h.alice, unblock, at(20))).await.unwrap();
        h.processor.apply(&signed(&h.alice, block, at(10))).await.unwrap();
        assert!(!h.db.lock().await.is_blocked(ALICE, BOB).unwrap());
    }
}
