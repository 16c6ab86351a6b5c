//! Signed RPC envelopes and the closed set of chat methods.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::INTERNAL_METHOD_PREFIX;
use crate::error::RpcError;
use crate::ids::IdCodec;
use crate::types::{Audience, ChatPermit, ContentType, UserId};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A signed RPC as delivered by a relay and recorded in the RPC log.
///
/// `rpc` keeps the exact bytes that were signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRpcEnvelope {
    pub rpc: Box<RawValue>,
    pub sig: String,
    pub from_wallet: String,
    pub relayed_by: String,
    /// Client-asserted logical timestamp; the ordering signal for every write.
    pub relayed_at: DateTime<Utc>,
}

impl SignedRpcEnvelope {
    pub fn payload(&self) -> &[u8] {
        self.rpc.get().as_bytes()
    }
}

/// `{method, params, current_user_id?}` as the client wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRpc {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RawRpc {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RpcError> {
        serde_json::from_slice(bytes).map_err(RpcError::Payload)
    }

    pub fn is_internal(&self) -> bool {
        self.method.starts_with(INTERNAL_METHOD_PREFIX)
    }

    /// `params.chat_id`, if the method targets a chat.
    pub fn chat_id(&self) -> Option<&str> {
        self.params.get("chat_id").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    Create,
    Delete,
    Message,
    React,
    Read,
    Permit,
    Block,
    Unblock,
    Blast,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Create => "chat.create",
            RpcMethod::Delete => "chat.delete",
            RpcMethod::Message => "chat.message",
            RpcMethod::React => "chat.react",
            RpcMethod::Read => "chat.read",
            RpcMethod::Permit => "chat.permit",
            RpcMethod::Block => "chat.block",
            RpcMethod::Unblock => "chat.unblock",
            RpcMethod::Blast => "chat.blast",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        Some(match method {
            "chat.create" => RpcMethod::Create,
            "chat.delete" => RpcMethod::Delete,
            "chat.message" => RpcMethod::Message,
            "chat.react" => RpcMethod::React,
            "chat.read" => RpcMethod::Read,
            "chat.permit" => RpcMethod::Permit,
            "chat.block" => RpcMethod::Block,
            "chat.unblock" => RpcMethod::Unblock,
            "chat.blast" => RpcMethod::Blast,
            _ => return None,
        })
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatInvite {
    pub user_id: String,
    pub invite_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCreateParams {
    pub chat_id: String,
    pub invites: Vec<ChatInvite>,
}

impl ChatCreateParams {
    pub fn decode_invites(&self, codec: &IdCodec) -> Result<Vec<(UserId, String)>, RpcError> {
        self.invites
            .iter()
            .map(|invite| {
                let user = codec.decode_user(&invite.user_id)?;
                Ok((user, invite.invite_code.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTargetParams {
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageParams {
    pub chat_id: String,
    pub message_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_plaintext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<Audience>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReactParams {
    pub chat_id: String,
    pub message_id: String,
    /// `None` removes the reaction.
    pub reaction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPermitParams {
    #[serde(default)]
    pub permit: Option<ChatPermit>,
    #[serde(default)]
    pub permit_list: Option<Vec<ChatPermit>>,
    /// Absent for the legacy single-value style.
    #[serde(default)]
    pub allow: Option<bool>,
}

/// A permission update in one of its two styles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionUpdate {
    /// A single permit kind replaces everything older.
    Single(ChatPermit),
    /// `all` or `none` chosen through the allow-list style.
    Exclusive(ChatPermit),
    /// The set of allow-list kinds that are switched on.
    AllowList(Vec<ChatPermit>),
}

impl ChatPermitParams {
    pub fn update(&self) -> Result<PermissionUpdate, RpcError> {
        let list = self.permit_list.clone().unwrap_or_default();
        if self.allow.is_none() {
            return self
                .permit
                .map(PermissionUpdate::Single)
                .ok_or_else(|| RpcError::Invalid("permit is required".to_string()));
        }
        let chosen_exclusive = [ChatPermit::All, ChatPermit::None]
            .into_iter()
            .find(|p| list.contains(p) || self.permit == Some(*p));
        Ok(match chosen_exclusive {
            Some(permit) => PermissionUpdate::Exclusive(permit),
            None => PermissionUpdate::AllowList(list),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBlockParams {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBlastParams {
    pub blast_id: String,
    pub audience: Audience,
    #[serde(default)]
    pub audience_content_type: Option<ContentType>,
    #[serde(default)]
    pub audience_content_id: Option<String>,
    pub message: String,
}

impl ChatBlastParams {
    /// The decoded content scope, if any.
    pub fn content(&self, codec: &IdCodec) -> Result<Option<(ContentType, i64)>, RpcError> {
        match (&self.audience_content_type, &self.audience_content_id) {
            (Some(content_type), Some(encoded)) => {
                Ok(Some((*content_type, codec.decode(encoded)?)))
            }
            (None, None) => Ok(None),
            _ => Err(RpcError::Invalid(
                "audience_content_type and audience_content_id go together".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed rpc
// ---------------------------------------------------------------------------

/// A parsed chat RPC. Dispatch is an exhaustive match over this enum.
#[derive(Debug, Clone)]
pub enum ChatRpc {
    Create(ChatCreateParams),
    Delete(ChatTargetParams),
    Message(ChatMessageParams),
    React(ChatReactParams),
    Read(ChatTargetParams),
    Permit(ChatPermitParams),
    Block(ChatBlockParams),
    Unblock(ChatBlockParams),
    Blast(ChatBlastParams),
    /// Recognized as an RPC but not a method this core applies.
    Unknown(String),
}

impl ChatRpc {
    pub fn from_raw(raw: &RawRpc) -> Result<Self, RpcError> {
        let Some(method) = RpcMethod::parse(&raw.method) else {
            return Ok(ChatRpc::Unknown(raw.method.clone()));
        };
        let rpc = match method {
            RpcMethod::Create => ChatRpc::Create(params(raw)?),
            RpcMethod::Delete => ChatRpc::Delete(params(raw)?),
            RpcMethod::Message => ChatRpc::Message(params(raw)?),
            RpcMethod::React => ChatRpc::React(params(raw)?),
            RpcMethod::Read => ChatRpc::Read(params(raw)?),
            RpcMethod::Permit => ChatRpc::Permit(params(raw)?),
            RpcMethod::Block => ChatRpc::Block(params(raw)?),
            RpcMethod::Unblock => ChatRpc::Unblock(params(raw)?),
            RpcMethod::Blast => ChatRpc::Blast(params(raw)?),
        };
        Ok(rpc)
    }

    pub fn method(&self) -> Option<RpcMethod> {
        Some(match self {
            ChatRpc::Create(_) => RpcMethod::Create,
            ChatRpc::Delete(_) => RpcMethod::Delete,
            ChatRpc::Message(_) => RpcMethod::Message,
            ChatRpc::React(_) => RpcMethod::React,
            ChatRpc::Read(_) => RpcMethod::Read,
            ChatRpc::Permit(_) => RpcMethod::Permit,
            ChatRpc::Block(_) => RpcMethod::Block,
            ChatRpc::Unblock(_) => RpcMethod::Unblock,
            ChatRpc::Blast(_) => RpcMethod::Blast,
            ChatRpc::Unknown(_) => return None,
        })
    }
}

fn params<T: DeserializeOwned>(raw: &RawRpc) -> Result<T, RpcError> {
    T::deserialize(&raw.params).map_err(|source| RpcError::Params {
        method: raw.method.clone(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Outbound push
// ---------------------------------------------------------------------------

/// Delivery metadata attached to every realtime push. Ids are encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushMetadata {
    /// RFC 3339 with nanoseconds
    pub timestamp: String,
    pub sender_user_id: String,
    pub receiver_user_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct PushEnvelope<'a> {
    pub rpc: &'a RawValue,
    pub metadata: PushMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawRpc {
        RawRpc::from_slice(json.as_bytes()).unwrap()
    }

    #[test]
    fn parses_message_rpc() {
        let rpc = raw(
            r#"{"method":"chat.message","params":{"chat_id":"a:b","message_id":"m1","message":"hi"}}"#,
        );
        assert_eq!(rpc.chat_id(), Some("a:b"));
        match ChatRpc::from_raw(&rpc).unwrap() {
            ChatRpc::Message(params) => {
                assert_eq!(params.message_id, "m1");
                assert!(params.is_plaintext.is_none());
            }
            other => panic!("unexpected rpc: {other:?}"),
        }
    }

    #[test]
    fn unknown_and_internal_methods() {
        let unknown = raw(r#"{"method":"chat.typing","params":{}}"#);
        assert!(matches!(
            ChatRpc::from_raw(&unknown).unwrap(),
            ChatRpc::Unknown(m) if m == "chat.typing"
        ));
        assert!(raw(r#"{"method":"internal.sync","params":{}}"#).is_internal());
    }

    #[test]
    fn malformed_params_fail() {
        let rpc = raw(r#"{"method":"chat.react","params":{"chat_id":"a:b"}}"#);
        assert!(matches!(
            ChatRpc::from_raw(&rpc),
            Err(RpcError::Params { .. })
        ));
    }

    #[test]
    fn react_null_removes() {
        let rpc = raw(
            r#"{"method":"chat.react","params":{"chat_id":"a:b","message_id":"m","reaction":null}}"#,
        );
        let ChatRpc::React(params) = ChatRpc::from_raw(&rpc).unwrap() else {
            panic!("expected react");
        };
        assert!(params.reaction.is_none());
    }

    #[test]
    fn permission_styles() {
        let legacy = ChatPermitParams {
            permit: Some(ChatPermit::Followers),
            permit_list: None,
            allow: None,
        };
        assert_eq!(
            legacy.update().unwrap(),
            PermissionUpdate::Single(ChatPermit::Followers)
        );

        let list = ChatPermitParams {
            permit: Some(ChatPermit::Followers),
            permit_list: Some(vec![ChatPermit::Followers, ChatPermit::Verified]),
            allow: Some(true),
        };
        assert_eq!(
            list.update().unwrap(),
            PermissionUpdate::AllowList(vec![ChatPermit::Followers, ChatPermit::Verified])
        );

        let none = ChatPermitParams {
            permit: None,
            permit_list: Some(vec![ChatPermit::None]),
            allow: Some(true),
        };
        assert_eq!(
            none.update().unwrap(),
            PermissionUpdate::Exclusive(ChatPermit::None)
        );

        let empty = ChatPermitParams {
            permit: None,
            permit_list: None,
            allow: None,
        };
        assert!(empty.update().is_err());
    }

    #[test]
    fn blast_content_scope() {
        let codec = IdCodec::default();
        let mut params = ChatBlastParams {
            blast_id: "b".into(),
            audience: Audience::Remixer,
            audience_content_type: Some(ContentType::Track),
            audience_content_id: Some(codec.encode(9).unwrap()),
            message: "new stems".into(),
        };
        assert_eq!(
            params.content(&codec).unwrap(),
            Some((ContentType::Track, 9))
        );
        params.audience_content_type = None;
        assert!(params.content(&codec).is_err());
    }

    #[test]
    fn envelope_keeps_signed_bytes() {
        let json = r#"{"rpc":{"method":"chat.read", "params":{"chat_id":"a:b"}},"sig":"s","from_wallet":"0xab","relayed_by":"bridge","relayed_at":"2024-01-01T00:00:00Z"}"#;
        let envelope: SignedRpcEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(
            envelope.payload(),
            br#"{"method":"chat.read", "params":{"chat_id":"a:b"}}"#
        );
    }
}
