//! Read endpoints a client uses to rebuild its inbox after a push.
//!
//! User ids go in and out in their encoded form, like the write path.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use causerie_shared::types::{Audience, ChatPermit};
use causerie_shared::{IdCodec, UserId};
use causerie_store::{InboxChat, InboxMessage, PermissionSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{decode_user, AppState, UserQuery};
use crate::error::ServerError;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/comms/chats", get(list_chats))
        .route("/comms/chats/unread", get(unread_count))
        .route("/comms/chats/permissions", get(permissions))
        .route("/comms/chats/blockers", get(blockers))
        .route("/comms/chats/blockees", get(blockees))
        .route("/comms/chats/:chat_id", get(get_chat))
        .route("/comms/chats/:chat_id/messages", get(chat_messages))
}

#[derive(Deserialize)]
struct PermissionsQuery {
    user_id: String,
    /// Comma-separated encoded user ids.
    ids: String,
}

#[derive(Debug, Serialize)]
struct ChatMemberResponse {
    user_id: String,
    cleared_history_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    chat_id: String,
    created_at: DateTime<Utc>,
    last_message: Option<String>,
    last_message_at: DateTime<Utc>,
    last_message_is_plaintext: bool,
    invite_code: String,
    last_read_at: Option<DateTime<Utc>>,
    unread_message_count: i64,
    cleared_history_at: Option<DateTime<Utc>>,
    chat_members: Vec<ChatMemberResponse>,
}

impl ChatResponse {
    fn encode(codec: &IdCodec, chat: InboxChat) -> Result<Self, ServerError> {
        let chat_members = chat
            .members
            .into_iter()
            .map(|m| {
                Ok(ChatMemberResponse {
                    user_id: encode(codec, m.user_id)?,
                    cleared_history_at: m.cleared_history_at,
                })
            })
            .collect::<Result<Vec<_>, ServerError>>()?;
        Ok(Self {
            chat_id: chat.chat_id,
            created_at: chat.created_at,
            last_message: chat.last_message,
            last_message_at: chat.last_message_at,
            last_message_is_plaintext: chat.last_message_is_plaintext,
            invite_code: chat.invite_code,
            last_read_at: chat.last_active_at,
            unread_message_count: chat.unread_count,
            cleared_history_at: chat.cleared_history_at,
            chat_members,
        })
    }
}

#[derive(Debug, Serialize)]
struct ReactionResponse {
    user_id: String,
    reaction: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message_id: String,
    sender_user_id: String,
    created_at: DateTime<Utc>,
    message: Option<String>,
    is_plaintext: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<Audience>,
    reactions: Vec<ReactionResponse>,
}

impl MessageResponse {
    fn encode(codec: &IdCodec, message: InboxMessage) -> Result<Self, ServerError> {
        let reactions = message
            .reactions
            .into_iter()
            .filter_map(|r| {
                let reaction = r.reaction?;
                Some(encode(codec, r.user_id).map(|user_id| ReactionResponse {
                    user_id,
                    reaction,
                    created_at: r.updated_at,
                }))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            message_id: message.message_id,
            sender_user_id: encode(codec, message.user_id)?,
            created_at: message.created_at,
            message: message.message,
            is_plaintext: message.is_plaintext,
            audience: message.audience,
            reactions,
        })
    }
}

#[derive(Debug, Serialize)]
struct UnreadResponse {
    unread_chat_count: i64,
}

#[derive(Debug, Serialize)]
struct PermissionResponse {
    user_id: String,
    permits: Vec<ChatPermit>,
    current_user_has_permission: bool,
}

impl PermissionResponse {
    fn encode(codec: &IdCodec, summary: PermissionSummary) -> Result<Self, ServerError> {
        Ok(Self {
            user_id: encode(codec, summary.user_id)?,
            permits: summary.permits,
            current_user_has_permission: summary.current_user_has_permission,
        })
    }
}

fn encode(codec: &IdCodec, user: UserId) -> Result<String, ServerError> {
    codec
        .encode_user(user)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<ChatResponse>>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let chats = state.db.lock().await.user_chats(user)?;
    let chats = chats
        .into_iter()
        .map(|chat| ChatResponse::encode(&state.codec, chat))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(chats))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ChatResponse>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let chat = state
        .db
        .lock()
        .await
        .user_chat(user, &chat_id)?
        .ok_or_else(|| ServerError::NotFound(format!("chat {chat_id}")))?;
    Ok(Json(ChatResponse::encode(&state.codec, chat)?))
}

async fn chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<MessageResponse>>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let messages = {
        let db = state.db.lock().await;
        if !db.is_member(&chat_id, user)? {
            return Err(ServerError::NotFound(format!("chat {chat_id}")));
        }
        db.visible_messages(user, &chat_id)?
    };
    let messages = messages
        .into_iter()
        .map(|m| MessageResponse::encode(&state.codec, m))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(messages))
}

async fn unread_count(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UnreadResponse>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let unread_chat_count = state.db.lock().await.unread_chat_count(user)?;
    Ok(Json(UnreadResponse { unread_chat_count }))
}

async fn permissions(
    State(state): State<AppState>,
    Query(query): Query<PermissionsQuery>,
) -> Result<Json<Vec<PermissionResponse>>, ServerError> {
    let current = decode_user(&state.codec, &query.user_id)?;
    let users = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| decode_user(&state.codec, id))
        .collect::<Result<Vec<_>, _>>()?;
    let summaries = state.db.lock().await.permission_summaries(current, &users)?;
    let summaries = summaries
        .into_iter()
        .map(|s| PermissionResponse::encode(&state.codec, s))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(summaries))
}

/// Users blocking the caller.
async fn blockers(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<String>>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let ids = state.db.lock().await.blockers_of(user)?;
    encode_all(&state.codec, ids).map(Json)
}

/// Users the caller blocks.
async fn blockees(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<String>>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let ids = state.db.lock().await.blocked_by(user)?;
    encode_all(&state.codec, ids).map(Json)
}

fn encode_all(codec: &IdCodec, users: Vec<UserId>) -> Result<Vec<String>, ServerError> {
    users.into_iter().map(|u| encode(codec, u)).collect()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use causerie_store::permissions::block;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::api::build_router;
    use crate::api::tests::state;
    use crate::processor::tests::{at, signed, Harness, ALICE, BOB};

    async fn get_json(app: Router, uri: String) -> (StatusCode, serde_json::Value) {
        let response: Response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn chat_with_message(h: &Harness) {
        h.processor
            .apply(&signed(&h.alice, h.create_rpc("c"), at(0)))
            .await
            .unwrap();
        h.processor
            .apply(&signed(&h.alice, h.message_rpc("m1", "hi"), at(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chat_listing_and_unread() {
        let h = Harness::new();
        chat_with_message(&h).await;
        let app = build_router(state(&h));
        let bob = h.codec.encode_user(BOB).unwrap();
        let alice = h.codec.encode_user(ALICE).unwrap();

        let (status, body) = get_json(app.clone(), format!("/comms/chats?user_id={bob}")).await;
        assert_eq!(status, StatusCode::OK);
        let chats = body.as_array().unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["chat_id"], h.chat_id());
        assert_eq!(chats[0]["unread_message_count"], 1);
        assert_eq!(chats[0]["last_message"], "hi");
        assert_eq!(chats[0]["chat_members"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(app.clone(), format!("/comms/chats/unread?user_id={bob}")).await;
        assert_eq!(body["unread_chat_count"], 1);
        let (_, body) = get_json(app.clone(), format!("/comms/chats/unread?user_id={alice}")).await;
        assert_eq!(body["unread_chat_count"], 0);

        let (status, body) = get_json(
            app.clone(),
            format!("/comms/chats/{}/messages?user_id={bob}", h.chat_id()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["message_id"], "m1");
        assert_eq!(body[0]["sender_user_id"], alice);
        assert_eq!(body[0]["is_plaintext"], false);
    }

    #[tokio::test]
    async fn test_outsiders_get_not_found() {
        let h = Harness::new();
        chat_with_message(&h).await;
        let app = build_router(state(&h));
        let outsider = h.codec.encode_user(UserId(77)).unwrap();

        let (status, _) = get_json(
            app.clone(),
            format!("/comms/chats/{}?user_id={outsider}", h.chat_id()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(
            app.clone(),
            format!("/comms/chats/{}/messages?user_id={outsider}", h.chat_id()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(app, "/comms/chats?user_id=not-an-id".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_permissions_and_blocks() {
        let h = Harness::new();
        let permit = json!({"method": "chat.permit", "params": {"permit": "none"}});
        h.processor
            .apply(&signed(&h.bob, permit, at(0)))
            .await
            .unwrap();
        block(h.db.lock().await.conn(), BOB, ALICE, at(1)).unwrap();

        let app = build_router(state(&h));
        let alice = h.codec.encode_user(ALICE).unwrap();
        let bob = h.codec.encode_user(BOB).unwrap();
        let carol = h.codec.encode_user(UserId(3)).unwrap();

        let (status, body) = get_json(
            app.clone(),
            format!("/comms/chats/permissions?user_id={alice}&ids={bob},{carol}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["user_id"], bob);
        assert_eq!(body[0]["permits"], json!(["none"]));
        assert_eq!(body[0]["current_user_has_permission"], false);
        assert_eq!(body[1]["permits"], json!(["all"]));
        assert_eq!(body[1]["current_user_has_permission"], true);

        let (_, body) = get_json(app.clone(), format!("/comms/chats/blockers?user_id={alice}")).await;
        assert_eq!(body, json!([bob]));
        let (_, body) = get_json(app, format!("/comms/chats/blockees?user_id={bob}")).await;
        assert_eq!(body, json!([alice]));
    }
}
