//! Admission control for client submissions.
//!
//! Runs before an RPC is accepted so that invalid requests never reach the
//! log. Storage reads happen under the database lock; the abuse oracle is
//! awaited with the lock released.

use std::sync::Arc;

use causerie_shared::rpc::{ChatCreateParams, ChatRpc, RawRpc};
use causerie_shared::{IdCodec, UserId};
use causerie_store::Database;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::abuse::AbuseOracle;
use crate::error::ValidationError;
use crate::rate_limit::RateLimiter;

const NOT_A_MEMBER: &str = "user is not a member of this chat";
const NOT_PERMITTED: &str = "Not permitted to send messages to this user";
const NEEDS_TWO_MEMBERS: &str = "Chat must have 2 members";

#[derive(Clone)]
pub struct Validator {
    db: Arc<Mutex<Database>>,
    codec: Arc<IdCodec>,
    limiter: RateLimiter,
    oracle: AbuseOracle,
}

impl Validator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        codec: Arc<IdCodec>,
        limiter: RateLimiter,
        oracle: AbuseOracle,
    ) -> Self {
        Self {
            db,
            codec,
            limiter,
            oracle,
        }
    }

    /// Check whether `user` may submit `rpc` now.
    pub async fn validate(&self, user: UserId, rpc: &RawRpc) -> Result<(), ValidationError> {
        self.validate_at(user, rpc, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        user: UserId,
        rpc: &RawRpc,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if self.db.lock().await.is_banned(user)? {
            return Err(ValidationError::Rejected(format!(
                "user_id {user} is banned from chat"
            )));
        }

        match ChatRpc::from_raw(rpc)? {
            ChatRpc::Create(params) => self.validate_create(user, &params, now).await,
            ChatRpc::Delete(params) | ChatRpc::Read(params) => {
                let db = self.db.lock().await;
                require_member(&db, user, &params.chat_id)
            }
            ChatRpc::Message(params) => {
                let db = self.db.lock().await;
                require_member(&db, user, &params.chat_id)?;
                require_permitted_pair(&db, user, &params.chat_id)?;
                self.limiter.check_message(&db, user, &params.chat_id, now)
            }
            ChatRpc::React(params) => {
                let db = self.db.lock().await;
                require_member(&db, user, &params.chat_id)?;
                if !db.message_exists_in_chat(&params.chat_id, &params.message_id)? {
                    return Err(ValidationError::rejected("message does not exist in chat"));
                }
                require_permitted_pair(&db, user, &params.chat_id)
            }
            ChatRpc::Permit(params) => {
                params.update()?;
                Ok(())
            }
            ChatRpc::Block(params) => {
                self.codec.decode_user(&params.user_id)?;
                Ok(())
            }
            ChatRpc::Unblock(params) => {
                let blockee = self.codec.decode_user(&params.user_id)?;
                if !self.db.lock().await.is_blocked(user, blockee)? {
                    return Err(ValidationError::rejected("user is not blocked"));
                }
                Ok(())
            }
            ChatRpc::Blast(params) => {
                params.content(&self.codec)?;
                Ok(())
            }
            ChatRpc::Unknown(method) => {
                debug!(method, user_id = user.0, "No validation for unknown method");
                Ok(())
            }
        }
    }

    async fn validate_create(
        &self,
        user: UserId,
        params: &ChatCreateParams,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let (receiver, invited, handle) = {
            let db = self.db.lock().await;
            if db.chat_exists(&params.chat_id)? {
                return Err(ValidationError::rejected("Chat already exists"));
            }

            let invites = params.decode_invites(&self.codec)?;
            let [(first, _), (second, _)] = invites.as_slice() else {
                return Err(ValidationError::rejected(NEEDS_TWO_MEMBERS));
            };
            let receiver = if *first == user {
                *second
            } else if *second == user {
                *first
            } else {
                return Err(ValidationError::rejected("creator must be one of the invitees"));
            };
            if receiver == user {
                return Err(ValidationError::rejected(NEEDS_TWO_MEMBERS));
            }
            if self.codec.chat_id(user, receiver)? != params.chat_id {
                return Err(ValidationError::rejected("chat_id does not match invitees"));
            }

            let handle = match self.oracle {
                AbuseOracle::Disabled => None,
                AbuseOracle::Http { .. } => Some(
                    db.handle_for(user)?
                        .ok_or_else(|| ValidationError::Rejected(format!("user {user} not found")))?,
                ),
            };
            (receiver, vec![*first, *second], handle)
        };

        if let Some(handle) = handle {
            self.oracle.attest(&handle).await?;
        }

        let db = self.db.lock().await;
        // A receiver who blasted the creator has consented to a reply.
        if db.has_new_blast_from_user(&self.codec, user, receiver)? {
            debug!(user_id = user.0, receiver = receiver.0, "Creating chat from a blast");
        } else if !db.chat_allowed(user, receiver)? {
            return Err(ValidationError::rejected(NOT_PERMITTED));
        }

        self.limiter.check_new_chat(&db, &invited, now)
    }
}

fn require_member(db: &Database, user: UserId, chat_id: &str) -> Result<(), ValidationError> {
    if !db.is_member(chat_id, user)? {
        return Err(ValidationError::rejected(NOT_A_MEMBER));
    }
    Ok(())
}

/// The chat is a two-party chat and its other member currently admits `user`.
fn require_permitted_pair(
    db: &Database,
    user: UserId,
    chat_id: &str,
) -> Result<(), ValidationError> {
    let members = db.member_ids(chat_id)?;
    let [a, b] = members.as_slice() else {
        return Err(ValidationError::rejected(NEEDS_TWO_MEMBERS));
    };
    let other = if *a == user { *b } else { *a };
    if other == user || !db.chat_allowed(user, other)? {
        return Err(ValidationError::rejected(NOT_PERMITTED));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use causerie_shared::rpc::{ChatBlastParams, PermissionUpdate};
    use causerie_shared::types::{Audience, ChatPermit};
    use causerie_store::blasts::chat_blast;
    use causerie_store::chats::chat_create;
    use causerie_store::messages::chat_send_message;
    use causerie_store::permissions::{block, set_permissions, unblock};
    use causerie_store::social::record_follow;
    use causerie_store::User;
    use serde_json::json;

    use super::*;
    use crate::rate_limit::{BurstWindow, RateLimitConfig, MESSAGE_RATE_LIMIT_EXCEEDED};

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Mutex<Database>>,
        codec: Arc<IdCodec>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_at(&dir.path().join("validator.db")).unwrap();
            let epoch = Utc::now() - chrono::Duration::days(30);
            for (id, handle) in [(ALICE, "alice"), (BOB, "bob"), (CAROL, "carol")] {
                db.upsert_user(&User::new(id.0, &format!("0x{id}"), handle, epoch))
                    .unwrap();
            }
            Self {
                _dir: dir,
                db: Arc::new(Mutex::new(db)),
                codec: Arc::new(IdCodec::default()),
            }
        }

        fn validator(&self, config: RateLimitConfig) -> Validator {
            Validator::new(
                self.db.clone(),
                self.codec.clone(),
                RateLimiter::new(config),
                AbuseOracle::Disabled,
            )
        }

        fn enc(&self, user: UserId) -> String {
            self.codec.encode_user(user).unwrap()
        }

        fn create_rpc(&self, creator: UserId, other: UserId) -> RawRpc {
            rpc(json!({
                "method": "chat.create",
                "params": {
                    "chat_id": self.codec.chat_id(creator, other).unwrap(),
                    "invites": [
                        {"user_id": self.enc(creator), "invite_code": "c1"},
                        {"user_id": self.enc(other), "invite_code": "c2"},
                    ],
                },
            }))
        }

        async fn with_tx(&self, f: impl FnOnce(&causerie_store::Connection)) {
            let mut db = self.db.lock().await;
            let tx = db.transaction().unwrap();
            f(&tx);
            tx.commit().unwrap();
        }

        async fn chat(&self, a: UserId, b: UserId, ts: DateTime<Utc>) -> String {
            let chat_id = self.codec.chat_id(a, b).unwrap();
            let invites = [(a, "c1".to_string()), (b, "c2".to_string())];
            let codec = self.codec.clone();
            let id = chat_id.clone();
            self.with_tx(move |conn| {
                chat_create(conn, &codec, a, &id, &invites, ts).unwrap();
            })
            .await;
            chat_id
        }
    }

    fn rpc(value: serde_json::Value) -> RawRpc {
        serde_json::from_value(value).unwrap()
    }

    fn message_rpc(chat_id: &str, message_id: &str) -> RawRpc {
        rpc(json!({
            "method": "chat.message",
            "params": {"chat_id": chat_id, "message_id": message_id, "message": "hi"},
        }))
    }

    fn rejected_with(result: Result<(), ValidationError>, reason: &str) -> bool {
        matches!(result, Err(ValidationError::Rejected(ref m)) if m == reason)
    }

    #[tokio::test]
    async fn test_banned_user_rejected() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        fx.db.lock().await.set_ban(ALICE, true, Utc::now()).unwrap();

        let err = v.validate(ALICE, &fx.create_rpc(ALICE, BOB)).await.unwrap_err();
        assert_eq!(err.to_string(), "user_id 1 is banned from chat");
    }

    #[tokio::test]
    async fn test_create_shape_checks() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());

        v.validate(ALICE, &fx.create_rpc(ALICE, BOB)).await.unwrap();

        // Creator not among the invitees.
        assert!(v.validate(CAROL, &fx.create_rpc(ALICE, BOB)).await.is_err());

        let one_invite = rpc(json!({
            "method": "chat.create",
            "params": {
                "chat_id": fx.codec.chat_id(ALICE, BOB).unwrap(),
                "invites": [{"user_id": fx.enc(ALICE), "invite_code": "c"}],
            },
        }));
        assert!(rejected_with(v.validate(ALICE, &one_invite).await, NEEDS_TWO_MEMBERS));

        let malformed = rpc(json!({"method": "chat.create", "params": {"chat_id": 7}}));
        assert!(matches!(
            v.validate(ALICE, &malformed).await,
            Err(ValidationError::Rejected(_))
        ));

        fx.chat(ALICE, BOB, Utc::now()).await;
        assert!(rejected_with(
            v.validate(BOB, &fx.create_rpc(BOB, ALICE)).await,
            "Chat already exists"
        ));
    }

    #[tokio::test]
    async fn test_block_enforcement() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let t = Utc::now() - chrono::Duration::minutes(10);
        let chat_id = fx.chat(ALICE, BOB, t - chrono::Duration::minutes(1)).await;

        fx.with_tx(|conn| block(conn, ALICE, BOB, t).unwrap()).await;
        assert!(rejected_with(
            v.validate(BOB, &message_rpc(&chat_id, "m1")).await,
            NOT_PERMITTED
        ));
        // Unrelated pairs are unaffected.
        v.validate(BOB, &fx.create_rpc(BOB, CAROL)).await.unwrap();

        // A stale unblock does not lift the block.
        fx.with_tx(|conn| {
            unblock(conn, ALICE, BOB, t - chrono::Duration::minutes(5)).unwrap();
        })
        .await;
        assert!(v.validate(BOB, &message_rpc(&chat_id, "m1")).await.is_err());

        fx.with_tx(|conn| {
            unblock(conn, ALICE, BOB, t + chrono::Duration::minutes(1)).unwrap();
        })
        .await;
        v.validate(BOB, &message_rpc(&chat_id, "m1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_block_prevents_create() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let t = Utc::now() - chrono::Duration::minutes(10);

        fx.with_tx(|conn| block(conn, ALICE, BOB, t).unwrap()).await;
        assert!(rejected_with(
            v.validate(BOB, &fx.create_rpc(BOB, ALICE)).await,
            NOT_PERMITTED
        ));

        fx.with_tx(|conn| {
            unblock(conn, ALICE, BOB, t + chrono::Duration::minutes(1)).unwrap();
        })
        .await;
        v.validate(BOB, &fx.create_rpc(BOB, ALICE)).await.unwrap();
    }

    #[tokio::test]
    async fn test_membership_and_react() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let ts = Utc::now() - chrono::Duration::minutes(5);
        let chat_id = fx.chat(ALICE, BOB, ts).await;
        let id = chat_id.clone();
        fx.with_tx(move |conn| {
            chat_send_message(conn, ALICE, &id, "m1", "c", ts).unwrap();
        })
        .await;

        let read = rpc(json!({"method": "chat.read", "params": {"chat_id": chat_id}}));
        v.validate(BOB, &read).await.unwrap();
        assert!(rejected_with(v.validate(CAROL, &read).await, NOT_A_MEMBER));

        let react = |message_id: &str| {
            rpc(json!({
                "method": "chat.react",
                "params": {"chat_id": chat_id, "message_id": message_id, "reaction": "fire"},
            }))
        };
        v.validate(BOB, &react("m1")).await.unwrap();
        assert!(rejected_with(
            v.validate(BOB, &react("missing")).await,
            "message does not exist in chat"
        ));
    }

    #[tokio::test]
    async fn test_permissions_rechecked_per_send() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let ts = Utc::now() - chrono::Duration::minutes(5);
        let chat_id = fx.chat(ALICE, BOB, ts).await;

        v.validate(ALICE, &message_rpc(&chat_id, "m1")).await.unwrap();
        fx.with_tx(|conn| {
            set_permissions(conn, BOB, &PermissionUpdate::Single(ChatPermit::None), ts).unwrap();
        })
        .await;
        assert!(rejected_with(
            v.validate(ALICE, &message_rpc(&chat_id, "m2")).await,
            NOT_PERMITTED
        ));
    }

    #[tokio::test]
    async fn test_blast_exempts_create_from_permissions() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let t0 = Utc::now() - chrono::Duration::hours(2);

        // Bob follows Alice, who accepts no chats at all.
        fx.with_tx(|conn| {
            record_follow(conn, BOB, ALICE, t0).unwrap();
            set_permissions(conn, ALICE, &PermissionUpdate::Single(ChatPermit::None), t0)
                .unwrap();
        })
        .await;
        assert!(rejected_with(
            v.validate(BOB, &fx.create_rpc(BOB, ALICE)).await,
            NOT_PERMITTED
        ));

        // Alice blasts her followers; Bob may now reply.
        let codec = fx.codec.clone();
        fx.with_tx(move |conn| {
            let params = ChatBlastParams {
                blast_id: "b1".into(),
                audience: Audience::Follower,
                audience_content_type: None,
                audience_content_id: None,
                message: "new album out".into(),
            };
            let content = params.content(&codec).unwrap();
            chat_blast(conn, ALICE, &params, content, t0 + chrono::Duration::hours(1)).unwrap();
        })
        .await;
        v.validate(BOB, &fx.create_rpc(BOB, ALICE)).await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_limit() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig {
            burst: vec![BurstWindow { secs: 1, max: 3 }],
            ..RateLimitConfig::default()
        });
        let now = Utc::now();
        let chat_id = fx.chat(ALICE, BOB, now - chrono::Duration::minutes(1)).await;

        for i in 0..3 {
            let message_id = format!("m{i}");
            v.validate_at(ALICE, &message_rpc(&chat_id, &message_id), now)
                .await
                .unwrap();
            let id = chat_id.clone();
            fx.with_tx(move |conn| {
                chat_send_message(conn, ALICE, &id, &message_id, "c", now).unwrap();
            })
            .await;
        }
        let err = v
            .validate_at(ALICE, &message_rpc(&chat_id, "m3"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::RateLimited(ref m) if m == MESSAGE_RATE_LIMIT_EXCEEDED));
    }

    #[tokio::test]
    async fn test_unblock_requires_active_block() {
        let fx = Fixture::new().await;
        let v = fx.validator(RateLimitConfig::default());
        let unblock_rpc = rpc(json!({"method": "chat.unblock", "params": {"user_id": fx.enc(BOB)}}));

        assert!(rejected_with(
            v.validate(ALICE, &unblock_rpc).await,
            "user is not blocked"
        ));
        fx.with_tx(|conn| block(conn, ALICE, BOB, Utc::now()).unwrap()).await;
        v.validate(ALICE, &unblock_rpc).await.unwrap();

        let bad_id = rpc(json!({"method": "chat.block", "params": {"user_id": "???"}}));
        assert!(v.validate(ALICE, &bad_id).await.is_err());
    }

    #[tokio::test]
    async fn test_attestation_gates_create() {
        let fx = Fixture::new().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let oracle =
            AbuseOracle::new(Some(format!("http://{addr}")), Duration::from_millis(200)).unwrap();
        let v = Validator::new(
            fx.db.clone(),
            fx.codec.clone(),
            RateLimiter::new(RateLimitConfig::default()),
            oracle,
        );
        assert!(matches!(
            v.validate(ALICE, &fx.create_rpc(ALICE, BOB)).await,
            Err(ValidationError::AttestationFailed(_))
        ));
    }
}
