//! Audience-targeted broadcasts.
//!
//! A blast is stored once. Recipients that already share a chat with the
//! sender get it fanned out as a message immediately; everyone else sees it
//! as pending until a chat between the two is created, at which point
//! [`crate::chats::chat_create`] materializes it.

use std::collections::HashSet;

use causerie_shared::ids::blast_message_id;
use causerie_shared::rpc::{ChatBlastParams, ChatMessageParams, RpcMethod};
use causerie_shared::types::ContentType;
use causerie_shared::{IdCodec, UserId};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{named_params, params, Connection, OptionalExtension};

use crate::chats::update_latest_fields;
use crate::database::Database;
use crate::error::Result;
use crate::models::{ChatBlast, OutgoingChatMessage, PendingBlast};
use crate::permissions::chat_allowed;
use crate::timestamp;

/// Membership test for a blast's audience, evaluated against `recipient`
/// (a bind parameter or a column). Every relation must predate the blast.
fn audience_predicate(recipient: &str) -> String {
    format!(
        "(
            (blast.audience = 'follower_audience' AND EXISTS (
                SELECT 1 FROM follows f
                WHERE f.followee_user_id = blast.from_user_id
                  AND f.follower_user_id = {recipient}
                  AND f.is_delete = 0
                  AND f.created_at < blast.created_at))
            OR (blast.audience = 'tipper_audience' AND EXISTS (
                SELECT 1 FROM user_tips tip
                WHERE tip.receiver_user_id = blast.from_user_id
                  AND tip.sender_user_id = {recipient}
                  AND tip.created_at < blast.created_at))
            OR (blast.audience = 'remixer_audience' AND EXISTS (
                SELECT 1 FROM tracks t
                JOIN remixes r ON r.child_track_id = t.track_id
                JOIN tracks og ON og.track_id = r.parent_track_id
                WHERE og.owner_id = blast.from_user_id
                  AND t.owner_id = {recipient}
                  AND r.created_at < blast.created_at
                  AND (blast.audience_content_id IS NULL
                       OR (blast.audience_content_type = 'track'
                           AND blast.audience_content_id = og.track_id))))
            OR (blast.audience = 'customer_audience' AND EXISTS (
                SELECT 1 FROM usdc_purchases p
                WHERE p.seller_user_id = blast.from_user_id
                  AND p.buyer_user_id = {recipient}
                  AND p.created_at < blast.created_at
                  AND (blast.audience_content_id IS NULL
                       OR (blast.audience_content_type = p.content_type
                           AND blast.audience_content_id = p.content_id))))
            OR (blast.audience = 'coin_holder_audience' AND EXISTS (
                SELECT 1 FROM artist_coins ac
                JOIN sol_user_balances bal ON bal.mint = ac.mint
                WHERE ac.user_id = blast.from_user_id
                  AND bal.user_id = {recipient}
                  AND bal.balance > 0
                  AND bal.created_at < blast.created_at))
        )"
    )
}

const BLAST_COLUMNS: &str = "blast.blast_id, blast.from_user_id, blast.audience,
     blast.audience_content_type, blast.audience_content_id, blast.plaintext, blast.created_at";

fn row_to_blast(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatBlast> {
    let audience: String = row.get(2)?;
    let content_type: Option<String> = row.get(3)?;
    Ok(ChatBlast {
        blast_id: row.get(0)?,
        from_user_id: UserId(row.get(1)?),
        audience: audience
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        audience_content_type: content_type
            .map(|t| t.parse::<ContentType>())
            .transpose()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?,
        audience_content_id: row.get(4)?,
        plaintext: row.get(5)?,
        created_at: timestamp::from_sql(row.get(6)?)?,
    })
}

/// Store a blast and fan it out into every existing chat between the sender
/// and a qualifying recipient. Returns one outgoing message per fanned-out
/// chat.
pub fn chat_blast(
    conn: &Connection,
    sender: UserId,
    params: &ChatBlastParams,
    content: Option<(ContentType, i64)>,
    ts: DateTime<Utc>,
) -> Result<Vec<OutgoingChatMessage>> {
    let ts_sql = timestamp::to_sql(ts);
    conn.execute(
        "INSERT INTO chat_blast
             (blast_id, from_user_id, audience, audience_content_type, audience_content_id, plaintext, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (blast_id) DO NOTHING",
        params![
            params.blast_id,
            sender.0,
            params.audience.as_str(),
            content.map(|(t, _)| t.as_str()),
            content.map(|(_, id)| id),
            params.message,
            ts_sql,
        ],
    )?;

    let targets: Vec<(String, UserId)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT other.chat_id, other.user_id
             FROM chat_member mine
             JOIN chat_member other ON other.chat_id = mine.chat_id AND other.user_id != mine.user_id
             JOIN chat_blast blast ON blast.blast_id = :blast_id
             WHERE mine.user_id = :sender
               AND {}
             ORDER BY other.chat_id",
            audience_predicate("other.user_id")
        ))?;
        let rows = stmt.query_map(
            named_params! { ":blast_id": params.blast_id, ":sender": sender.0 },
            |row| Ok((row.get::<_, String>(0)?, UserId(row.get(1)?))),
        )?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut outgoing = Vec::new();
    for (chat_id, recipient) in targets {
        if !chat_allowed(conn, sender, recipient)? {
            continue;
        }

        let message_id = blast_message_id(&params.blast_id, &chat_id);
        conn.execute(
            "INSERT INTO chat_message (message_id, chat_id, user_id, created_at, blast_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (message_id) DO NOTHING",
            params![message_id, chat_id, sender.0, ts_sql, params.blast_id],
        )?;
        update_latest_fields(conn, &chat_id)?;

        outgoing.push(OutgoingChatMessage {
            to_user_id: recipient,
            method: RpcMethod::Message.as_str(),
            params: ChatMessageParams {
                chat_id,
                message_id,
                message: params.message.clone(),
                parent_message_id: None,
                is_plaintext: Some(true),
                audience: Some(params.audience),
            },
        });
    }
    Ok(outgoing)
}

/// Blasts `user` currently qualifies for and has no chat with the sender
/// for, oldest first. With `chat_filter`, only blasts that would land in that
/// chat are returned.
///
/// A blast is suppressed when it predates the recipient's latest permission
/// change or their active block of the sender, so tightening settings hides pending
/// blasts without deleting them.
pub fn get_new_blasts(
    conn: &Connection,
    codec: &IdCodec,
    user: UserId,
    chat_filter: Option<&str>,
) -> Result<Vec<PendingBlast>> {
    let blasts: Vec<ChatBlast> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLAST_COLUMNS}
             FROM chat_blast blast
             WHERE blast.from_user_id != :recipient
               AND {}
               AND blast.created_at > MAX(
                   COALESCE((SELECT MAX(updated_at) FROM chat_permissions
                             WHERE user_id = :recipient), 0),
                   COALESCE((SELECT MAX(created_at) FROM chat_blocked_users
                             WHERE blocker_user_id = :recipient
                               AND blockee_user_id = blast.from_user_id
                               AND unblocked_at IS NULL), 0))
             ORDER BY blast.created_at, blast.blast_id",
            audience_predicate(":recipient")
        ))?;
        let rows = stmt.query_map(named_params! { ":recipient": user.0 }, row_to_blast)?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let existing: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT chat_id FROM chat_member WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user.0], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut pending = Vec::new();
    for blast in blasts {
        let pending_chat_id = codec.chat_id(user, blast.from_user_id)?;
        if existing.contains(&pending_chat_id) {
            continue;
        }
        if chat_filter.is_some_and(|filter| filter != pending_chat_id) {
            continue;
        }
        if !chat_allowed(conn, blast.from_user_id, user)? {
            continue;
        }
        pending.push(PendingBlast { pending_chat_id, blast });
    }
    Ok(pending)
}

impl Database {
    pub fn get_blast(&self, blast_id: &str) -> Result<Option<ChatBlast>> {
        let blast = self
            .conn()
            .query_row(
                &format!("SELECT {BLAST_COLUMNS} FROM chat_blast blast WHERE blast.blast_id = ?1"),
                params![blast_id],
                row_to_blast,
            )
            .optional()?;
        Ok(blast)
    }

    pub fn get_new_blasts(&self, codec: &IdCodec, user: UserId) -> Result<Vec<PendingBlast>> {
        get_new_blasts(self.conn(), codec, user, None)
    }

    /// Whether `user` has a pending blast from `sender`.
    pub fn has_new_blast_from_user(
        &self,
        codec: &IdCodec,
        user: UserId,
        sender: UserId,
    ) -> Result<bool> {
        let chat_id = codec.chat_id(user, sender)?;
        Ok(!get_new_blasts(self.conn(), codec, user, Some(&chat_id))?.is_empty())
    }
}
