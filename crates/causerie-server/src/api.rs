use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use causerie_shared::constants::{RELAYED_BY_BRIDGE, SIG_HEADER};
use causerie_shared::rpc::{RawRpc, SignedRpcEnvelope};
use causerie_shared::signature::recover_wallet;
use causerie_shared::types::{Audience, ContentType};
use causerie_shared::{IdCodec, UserId};
use causerie_store::{Database, PendingBlast};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{watch, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::inbox;
use crate::processor::{resolve_user, ApplyOutcome, RpcProcessor};
use crate::registry::WebsocketRegistry;
use crate::validator::Validator;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub codec: Arc<IdCodec>,
    pub processor: RpcProcessor,
    pub validator: Validator,
    pub registry: WebsocketRegistry,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/comms/mutate", post(mutate))
        .route("/comms/rpc", post(relay_rpc))
        .route("/comms/ws", get(websocket))
        .route("/comms/blasts", get(pending_blasts))
        .merge(inbox::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ApplyResponse {
    status: &'static str,
}

impl From<ApplyOutcome> for ApplyResponse {
    fn from(outcome: ApplyOutcome) -> Self {
        let status = match outcome {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            // Drops are not reported as errors.
            ApplyOutcome::Dropped(_) => "dropped",
        };
        Self { status }
    }
}

#[derive(Deserialize)]
pub(crate) struct UserQuery {
    pub user_id: String,
}

#[derive(Serialize)]
struct PendingBlastResponse {
    pending_chat_id: String,
    blast_id: String,
    from_user_id: String,
    audience: Audience,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience_content_type: Option<ContentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience_content_id: Option<String>,
    plaintext: String,
    created_at: DateTime<Utc>,
}

impl PendingBlastResponse {
    fn encode(codec: &IdCodec, pending: PendingBlast) -> Result<Self, ServerError> {
        let blast = pending.blast;
        let encode = |id| {
            codec
                .encode(id)
                .map_err(|e| ServerError::Internal(e.to_string()))
        };
        Ok(Self {
            pending_chat_id: pending.pending_chat_id,
            blast_id: blast.blast_id,
            from_user_id: encode(blast.from_user_id.0)?,
            audience: blast.audience,
            audience_content_type: blast.audience_content_type,
            audience_content_id: blast.audience_content_id.map(encode).transpose()?,
            plaintext: blast.plaintext,
            created_at: blast.created_at,
        })
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Client submission: the raw RPC is the body, its signature in `x-sig`.
async fn mutate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApplyResponse>, ServerError> {
    let sig = headers
        .get(SIG_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest(format!("missing {SIG_HEADER} header")))?;

    let wallet = recover_wallet(&body, sig).map_err(|e| {
        debug!(error = %e, "Rejecting submission with bad signature");
        ServerError::InvalidSignature
    })?;

    let raw = RawRpc::from_slice(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    if raw.is_internal() {
        return Err(ServerError::BadRequest(format!(
            "method {} is not accepted",
            raw.method
        )));
    }

    let user = {
        let db = state.db.lock().await;
        resolve_user(&db, &state.codec, &wallet, &raw)?
    };
    state.validator.validate(user, &raw).await?;

    let text = String::from_utf8(body.to_vec())
        .map_err(|_| ServerError::BadRequest("payload is not UTF-8".into()))?;
    let rpc = RawValue::from_string(text).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    // The log must hold exactly the signed bytes.
    if rpc.get().len() != body.len() {
        return Err(ServerError::BadRequest(
            "payload must not carry surrounding whitespace".into(),
        ));
    }

    let envelope = SignedRpcEnvelope {
        rpc,
        sig: sig.to_string(),
        from_wallet: wallet,
        relayed_by: RELAYED_BY_BRIDGE.to_string(),
        relayed_at: Utc::now(),
    };
    let outcome = state.processor.apply(&envelope).await.map_err(|e| {
        warn!(error = %e, method = %raw.method, user_id = user.0, "Chat rpc apply failed");
        e
    })?;

    debug!(method = %raw.method, user_id = user.0, ?outcome, "Chat rpc accepted");
    Ok(Json(outcome.into()))
}

/// Relay delivery of an already-accepted envelope.
async fn relay_rpc(
    State(state): State<AppState>,
    Json(envelope): Json<SignedRpcEnvelope>,
) -> Result<Json<ApplyResponse>, ServerError> {
    let outcome = state.processor.apply(&envelope).await?;
    Ok(Json(outcome.into()))
}

async fn pending_blasts(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<PendingBlastResponse>>, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let pending = state.db.lock().await.get_new_blasts(&state.codec, user)?;
    let blasts = pending
        .into_iter()
        .map(|p| PendingBlastResponse::encode(&state.codec, p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(blasts))
}

async fn websocket(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let user = decode_user(&state.codec, &query.user_id)?;
    let registry = state.registry.clone();
    Ok(ws.on_upgrade(move |socket| websocket_session(registry, user, socket)))
}

/// Forward queued pushes to the socket until either side goes away.
/// Inbound frames other than close are ignored.
async fn websocket_session(registry: WebsocketRegistry, user: UserId, socket: WebSocket) {
    let mut registration = registry.register(user).await;
    let (mut sink, mut stream) = socket.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = registration.rx.recv() => {
                let Some(payload) = outbound else {
                    debug!(user_id = user.0, "Connection dropped by registry");
                    break;
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.unregister(user, registration.id).await;
    let _ = sink.close().await;
}

pub(crate) fn decode_user(codec: &IdCodec, encoded: &str) -> Result<UserId, ServerError> {
    codec
        .decode_user(encoded)
        .map_err(|e| ServerError::BadRequest(e.to_string()))
}

pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
