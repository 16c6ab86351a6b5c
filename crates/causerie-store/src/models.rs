//! Row types read back from the chat tables.
//!
//! User ids are numeric here; encoding for the wire happens at the edge.

use causerie_shared::rpc::ChatMessageParams;
use causerie_shared::types::{Audience, ChatPermit, ContentType};
use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RPC log
// ---------------------------------------------------------------------------

/// A committed RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcLogEntry {
    pub sig: String,
    /// Exact signed payload.
    pub rpc: String,
    pub from_wallet: String,
    pub relayed_by: String,
    pub relayed_at: DateTime<Utc>,
    pub applied_at: DateTime<Utc>,
}

/// Change event raised for a committed RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEvent {
    pub id: i64,
    pub sig: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    /// Ciphertext, or the plaintext of a blast.
    pub last_message: Option<String>,
    pub last_message_is_plaintext: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMember {
    pub chat_id: String,
    pub user_id: UserId,
    pub invited_by_user_id: UserId,
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub cleared_history_at: Option<DateTime<Utc>>,
    pub is_hidden: bool,
}

/// A message; exactly one of `ciphertext` and `blast_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub ciphertext: Option<String>,
    pub blast_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageReaction {
    pub user_id: UserId,
    pub message_id: String,
    /// `None` once removed.
    pub reaction: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Inbox settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatPermission {
    pub user_id: UserId,
    pub permit: ChatPermit,
    pub allowed: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBlock {
    pub blocker_user_id: UserId,
    pub blockee_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub unblocked_at: Option<DateTime<Utc>>,
}

impl ChatBlock {
    pub fn is_active(&self) -> bool {
        self.unblocked_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Blasts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBlast {
    pub blast_id: String,
    pub from_user_id: UserId,
    pub audience: Audience,
    pub audience_content_type: Option<ContentType>,
    pub audience_content_id: Option<i64>,
    pub plaintext: String,
    pub created_at: DateTime<Utc>,
}

impl ChatBlast {
    pub fn content(&self) -> Option<(ContentType, i64)> {
        self.audience_content_type.zip(self.audience_content_id)
    }
}

/// A blast a recipient qualifies for but has no chat for yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingBlast {
    /// Chat id the blast would land in once the chat is created.
    pub pending_chat_id: String,
    #[serde(flatten)]
    pub blast: ChatBlast,
}

/// A `chat.message` produced by fanning a blast out into an existing chat.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutgoingChatMessage {
    pub to_user_id: UserId,
    pub method: &'static str,
    pub params: ChatMessageParams,
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// A chat as one of its members sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxChat {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub last_message_is_plaintext: bool,
    pub invite_code: String,
    pub last_active_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub cleared_history_at: Option<DateTime<Utc>>,
    pub members: Vec<InboxMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxMember {
    pub user_id: UserId,
    pub cleared_history_at: Option<DateTime<Utc>>,
}

/// A message still visible to the reader, with its live reactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxMessage {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    /// Ciphertext, or the plaintext of a blast.
    pub message: Option<String>,
    pub is_plaintext: bool,
    pub audience: Option<Audience>,
    pub reactions: Vec<ChatMessageReaction>,
}

/// Another user's inbox settings, from the point of view of a would-be sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSummary {
    pub user_id: UserId,
    pub permits: Vec<ChatPermit>,
    pub current_user_has_permission: bool,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// A user row as written by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub wallet: Option<String>,
    pub handle: Option<String>,
    pub is_available: bool,
    pub is_deactivated: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// An active user with a handle, owning `wallet`.
    pub fn new(user_id: i64, wallet: &str, handle: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: UserId(user_id),
            wallet: Some(wallet.to_lowercase()),
            handle: Some(handle.to_string()),
            is_available: true,
            is_deactivated: false,
            is_verified: false,
            created_at,
        }
    }
}
