//! Chat and membership mutators.
//!
//! Every write here is a single conditional statement gated on the stored
//! timestamp, so applying RPCs in any order converges to the same rows.

use causerie_shared::ids::blast_message_id;
use causerie_shared::{IdCodec, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::blasts;
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{Chat, ChatMember};
use crate::timestamp;

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

/// Create (or converge) a two-party chat.
///
/// The earliest create wins for the chat row and for each member's invite
/// fields. Pending blasts either invitee qualifies for are materialized as
/// messages first. Returns how many blast messages were newly seeded.
pub fn chat_create(
    conn: &Connection,
    codec: &IdCodec,
    creator: UserId,
    chat_id: &str,
    invites: &[(UserId, String)],
    ts: DateTime<Utc>,
) -> Result<usize> {
    // Seeds must be gathered before the members exist, since pending blasts
    // exclude chats the recipient already belongs to.
    let mut seeds = Vec::new();
    for (invitee, _) in invites {
        seeds.extend(blasts::get_new_blasts(conn, codec, *invitee, Some(chat_id))?);
    }

    let ts = timestamp::to_sql(ts);
    conn.execute(
        "INSERT INTO chat (chat_id, created_at, last_message_at) VALUES (?1, ?2, ?2)
         ON CONFLICT (chat_id) DO UPDATE
         SET created_at = excluded.created_at, last_message_at = excluded.last_message_at
         WHERE chat.created_at > excluded.created_at",
        params![chat_id, ts],
    )?;

    for (invitee, invite_code) in invites {
        conn.execute(
            "INSERT INTO chat_member (chat_id, user_id, invited_by_user_id, invite_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (chat_id, user_id) DO UPDATE
             SET invited_by_user_id = excluded.invited_by_user_id,
                 invite_code = excluded.invite_code,
                 created_at = excluded.created_at
             WHERE chat_member.created_at > excluded.created_at",
            params![chat_id, invitee.0, creator.0, invite_code, ts],
        )?;
    }

    let mut seeded = 0;
    for pending in &seeds {
        let blast = &pending.blast;
        seeded += conn.execute(
            "INSERT INTO chat_message (message_id, chat_id, user_id, created_at, blast_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (message_id) DO NOTHING",
            params![
                blast_message_id(&blast.blast_id, chat_id),
                chat_id,
                blast.from_user_id.0,
                timestamp::to_sql(blast.created_at),
                blast.blast_id,
            ],
        )?;
    }

    update_latest_fields(conn, chat_id)?;
    Ok(seeded)
}

/// Clear the chat's history for `user` up to `ts`, which hides it until
/// something newer arrives. A delete at or before the current
/// `cleared_history_at` is ignored, and `last_active_at` never moves back.
pub fn chat_delete(conn: &Connection, user: UserId, chat_id: &str, ts: DateTime<Utc>) -> Result<()> {
    let updated = conn.execute(
        "UPDATE chat_member
         SET cleared_history_at = ?1, last_active_at = MAX(COALESCE(last_active_at, 0), ?1)
         WHERE chat_id = ?2 AND user_id = ?3
           AND (cleared_history_at IS NULL OR cleared_history_at < ?1)",
        params![timestamp::to_sql(ts), chat_id, user.0],
    )?;
    if updated > 0 {
        update_latest_fields(conn, chat_id)?;
    }
    Ok(())
}

/// Mark the chat read up to `ts`. Returns `false` when the member was
/// already active at or after `ts` and nothing changed.
///
/// Messages from others newer than `ts` stay unread.
pub fn chat_read(conn: &Connection, user: UserId, chat_id: &str, ts: DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE chat_member SET
             last_active_at = ?1,
             unread_count = (
                 SELECT COUNT(*) FROM chat_message msg
                 WHERE msg.chat_id = chat_member.chat_id
                   AND msg.user_id != chat_member.user_id
                   AND msg.created_at > ?1
             )
         WHERE chat_id = ?2 AND user_id = ?3
           AND (last_active_at IS NULL OR last_active_at < ?1)",
        params![timestamp::to_sql(ts), chat_id, user.0],
    )?;
    Ok(updated > 0)
}

/// Recompute the denormalized fields derived from a chat's messages:
/// the chat's latest message, and each member's visibility and unread count.
pub fn update_latest_fields(conn: &Connection, chat_id: &str) -> Result<()> {
    conn.execute(
        "WITH latest AS (
             SELECT m.chat_id, m.created_at, m.ciphertext, m.blast_id, b.plaintext
             FROM chat_message m
             LEFT JOIN chat_blast b ON b.blast_id = m.blast_id
             WHERE m.chat_id = ?1
             ORDER BY m.created_at DESC, m.message_id DESC
             LIMIT 1
         )
         UPDATE chat SET
             last_message_at = latest.created_at,
             last_message = COALESCE(latest.ciphertext, latest.plaintext),
             last_message_is_plaintext = (latest.blast_id IS NOT NULL)
         FROM latest
         WHERE chat.chat_id = latest.chat_id",
        params![chat_id],
    )?;

    // A member sees the chat once something other than their own blast, or
    // a reaction by the other member, lands after their cleared history.
    conn.execute(
        "UPDATE chat_member SET
             is_hidden = NOT EXISTS (
                 SELECT 1 FROM chat_message msg
                 LEFT JOIN chat_blast b ON b.blast_id = msg.blast_id
                 WHERE msg.chat_id = chat_member.chat_id
                   AND (chat_member.cleared_history_at IS NULL
                        OR msg.created_at > chat_member.cleared_history_at)
                   AND (msg.blast_id IS NULL OR b.from_user_id != chat_member.user_id)
                 UNION ALL
                 SELECT 1 FROM chat_message_reactions r
                 JOIN chat_message msg ON msg.message_id = r.message_id
                 WHERE msg.chat_id = chat_member.chat_id
                   AND r.user_id != chat_member.user_id
                   AND r.reaction IS NOT NULL
                   AND (chat_member.cleared_history_at IS NULL
                        OR (r.updated_at > chat_member.cleared_history_at
                            AND msg.created_at > chat_member.cleared_history_at))
             ),
             unread_count = (
                 SELECT COUNT(*) FROM chat_message msg
                 WHERE msg.chat_id = chat_member.chat_id
                   AND msg.user_id != chat_member.user_id
                   AND msg.created_at > COALESCE(chat_member.last_active_at, 0)
             )
         WHERE chat_id = ?1",
        params![chat_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

const MEMBER_COLUMNS: &str = "chat_id, user_id, invited_by_user_id, invite_code, created_at,
     last_active_at, unread_count, cleared_history_at, is_hidden";

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMember> {
    Ok(ChatMember {
        chat_id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        invited_by_user_id: UserId(row.get(2)?),
        invite_code: row.get(3)?,
        created_at: timestamp::from_sql(row.get(4)?)?,
        last_active_at: timestamp::opt_from_sql(row.get(5)?)?,
        unread_count: row.get(6)?,
        cleared_history_at: timestamp::opt_from_sql(row.get(7)?)?,
        is_hidden: row.get(8)?,
    })
}

pub(crate) fn member_ids(conn: &Connection, chat_id: &str) -> Result<Vec<UserId>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM chat_member WHERE chat_id = ?1 ORDER BY user_id")?;
    let ids = stmt
        .query_map(params![chat_id], |row| row.get::<_, i64>(0))?
        .map(|id| id.map(UserId))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

impl Database {
    pub fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        self.conn()
            .query_row(
                "SELECT chat_id, created_at, last_message_at, last_message, last_message_is_plaintext
                 FROM chat WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(Chat {
                        chat_id: row.get(0)?,
                        created_at: timestamp::from_sql(row.get(1)?)?,
                        last_message_at: timestamp::from_sql(row.get(2)?)?,
                        last_message: row.get(3)?,
                        last_message_is_plaintext: row.get(4)?,
                    })
                },
            )
            .map_err(not_found)
    }

    pub fn chat_exists(&self, chat_id: &str) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM chat WHERE chat_id = ?1)",
            params![chat_id],
            |row| row.get(0),
        )?)
    }

    pub fn get_chat_member(&self, chat_id: &str, user: UserId) -> Result<Option<ChatMember>> {
        let member = self
            .conn()
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM chat_member WHERE chat_id = ?1 AND user_id = ?2"),
                params![chat_id, user.0],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    pub fn is_member(&self, chat_id: &str, user: UserId) -> Result<bool> {
        Ok(self.get_chat_member(chat_id, user)?.is_some())
    }

    pub fn chat_members(&self, chat_id: &str) -> Result<Vec<ChatMember>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM chat_member WHERE chat_id = ?1 ORDER BY user_id"
        ))?;
        let members = stmt
            .query_map(params![chat_id], row_to_member)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    pub fn member_ids(&self, chat_id: &str) -> Result<Vec<UserId>> {
        member_ids(self.conn(), chat_id)
    }

    /// Members that currently see the chat.
    pub fn visible_member_ids(&self, chat_id: &str) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM chat_member WHERE chat_id = ?1 AND is_hidden = 0 ORDER BY user_id",
        )?;
        let ids = stmt
            .query_map(params![chat_id], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(UserId))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
