//! Read side for clients re-fetching state after a push: a member's chats,
//! the messages they can still see, unread totals and inbox settings.

use std::collections::HashMap;

use causerie_shared::types::{Audience, ChatPermit};
use causerie_shared::UserId;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{ChatMessageReaction, InboxChat, InboxMember, InboxMessage, PermissionSummary};
use crate::permissions::{chat_allowed, permissions_for};
use crate::reactions::row_to_reaction;
use crate::timestamp;

const INBOX_CHAT_QUERY: &str = "SELECT chat.chat_id, chat.created_at, chat.last_message,
         chat.last_message_at, chat.last_message_is_plaintext, m.invite_code,
         m.last_active_at, m.unread_count, m.cleared_history_at
     FROM chat_member m
     JOIN chat ON chat.chat_id = m.chat_id
     WHERE m.user_id = ?1";

fn row_to_inbox_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboxChat> {
    Ok(InboxChat {
        chat_id: row.get(0)?,
        created_at: timestamp::from_sql(row.get(1)?)?,
        last_message: row.get(2)?,
        last_message_at: timestamp::from_sql(row.get(3)?)?,
        last_message_is_plaintext: row.get(4)?,
        invite_code: row.get(5)?,
        last_active_at: timestamp::opt_from_sql(row.get(6)?)?,
        unread_count: row.get(7)?,
        cleared_history_at: timestamp::opt_from_sql(row.get(8)?)?,
        members: Vec::new(),
    })
}

impl Database {
    /// Chats `user` currently sees, most recent message first.
    pub fn user_chats(&self, user: UserId) -> Result<Vec<InboxChat>> {
        let mut stmt = self.conn().prepare(&format!(
            "{INBOX_CHAT_QUERY}
               AND m.is_hidden = 0
               AND chat.last_message IS NOT NULL
               AND (m.cleared_history_at IS NULL OR chat.last_message_at > m.cleared_history_at)
             ORDER BY chat.last_message_at DESC, chat.chat_id ASC"
        ))?;
        let mut chats = stmt
            .query_map(params![user.0], row_to_inbox_chat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for chat in &mut chats {
            chat.members = self.inbox_members(&chat.chat_id)?;
        }
        Ok(chats)
    }

    /// One chat of `user`, hidden or not. `None` if they are not a member.
    pub fn user_chat(&self, user: UserId, chat_id: &str) -> Result<Option<InboxChat>> {
        let chat = self
            .conn()
            .query_row(
                &format!("{INBOX_CHAT_QUERY} AND m.chat_id = ?2"),
                params![user.0, chat_id],
                row_to_inbox_chat,
            )
            .optional()?;
        match chat {
            Some(mut chat) => {
                chat.members = self.inbox_members(chat_id)?;
                Ok(Some(chat))
            }
            None => Ok(None),
        }
    }

    fn inbox_members(&self, chat_id: &str) -> Result<Vec<InboxMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, cleared_history_at FROM chat_member
             WHERE chat_id = ?1 ORDER BY user_id",
        )?;
        let members = stmt
            .query_map(params![chat_id], |row| {
                Ok(InboxMember {
                    user_id: UserId(row.get(0)?),
                    cleared_history_at: timestamp::opt_from_sql(row.get(1)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    /// Messages of `chat_id` after the reader's cleared history, newest
    /// first. Empty when `user` is not a member.
    pub fn visible_messages(&self, user: UserId, chat_id: &str) -> Result<Vec<InboxMessage>> {
        let mut reactions: HashMap<String, Vec<ChatMessageReaction>> = HashMap::new();
        {
            let mut stmt = self.conn().prepare(
                "SELECT r.user_id, r.message_id, r.reaction, r.created_at, r.updated_at
                 FROM chat_message_reactions r
                 JOIN chat_message msg ON msg.message_id = r.message_id
                 WHERE msg.chat_id = ?1 AND r.reaction IS NOT NULL
                 ORDER BY r.updated_at, r.user_id",
            )?;
            for reaction in stmt.query_map(params![chat_id], row_to_reaction)? {
                let reaction = reaction?;
                reactions
                    .entry(reaction.message_id.clone())
                    .or_default()
                    .push(reaction);
            }
        }

        let mut stmt = self.conn().prepare(
            "SELECT msg.message_id, msg.chat_id, msg.user_id, msg.created_at,
                    COALESCE(msg.ciphertext, b.plaintext), b.plaintext IS NOT NULL, b.audience
             FROM chat_message msg
             JOIN chat_member m ON m.chat_id = msg.chat_id AND m.user_id = ?1
             LEFT JOIN chat_blast b ON b.blast_id = msg.blast_id
             WHERE msg.chat_id = ?2
               AND (m.cleared_history_at IS NULL OR msg.created_at > m.cleared_history_at)
             ORDER BY msg.created_at DESC, msg.message_id ASC",
        )?;
        let rows = stmt.query_map(params![user.0, chat_id], |row| {
            let audience: Option<String> = row.get(6)?;
            Ok(InboxMessage {
                message_id: row.get(0)?,
                chat_id: row.get(1)?,
                user_id: UserId(row.get(2)?),
                created_at: timestamp::from_sql(row.get(3)?)?,
                message: row.get(4)?,
                is_plaintext: row.get(5)?,
                audience: audience
                    .map(|a| a.parse::<Audience>())
                    .transpose()
                    .map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into())
                    })?,
                reactions: Vec::new(),
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.reactions = reactions.remove(&message.message_id).unwrap_or_default();
            messages.push(message);
        }
        Ok(messages)
    }

    /// Number of chats with anything unread for `user`.
    pub fn unread_chat_count(&self, user: UserId) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM chat_member WHERE user_id = ?1 AND unread_count > 0",
            params![user.0],
            |row| row.get(0),
        )?)
    }

    /// Allowed permits of each of `users`, and whether `current` may
    /// message them right now. A user with no settings has an open inbox.
    pub fn permission_summaries(
        &self,
        current: UserId,
        users: &[UserId],
    ) -> Result<Vec<PermissionSummary>> {
        let mut summaries = Vec::with_capacity(users.len());
        for &user in users {
            let settings = permissions_for(self.conn(), user)?;
            let permits = if settings.is_empty() {
                vec![ChatPermit::All]
            } else {
                settings
                    .into_iter()
                    .filter(|p| p.allowed)
                    .map(|p| p.permit)
                    .collect()
            };
            summaries.push(PermissionSummary {
                user_id: user,
                permits,
                current_user_has_permission: chat_allowed(self.conn(), current, user)?,
            });
        }
        Ok(summaries)
    }

    /// Users with an active block on `user`.
    pub fn blockers_of(&self, user: UserId) -> Result<Vec<UserId>> {
        self.block_peers(
            "SELECT blocker_user_id FROM chat_blocked_users
             WHERE blockee_user_id = ?1 AND unblocked_at IS NULL
             ORDER BY blocker_user_id",
            user,
        )
    }

    /// Users `user` actively blocks.
    pub fn blocked_by(&self, user: UserId) -> Result<Vec<UserId>> {
        self.block_peers(
            "SELECT blockee_user_id FROM chat_blocked_users
             WHERE blocker_user_id = ?1 AND unblocked_at IS NULL
             ORDER BY blockee_user_id",
            user,
        )
    }

    fn block_peers(&self, sql: &str, user: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(sql)?;
        let ids = stmt
            .query_map(params![user.0], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(UserId))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
