use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::chats::update_latest_fields;
use crate::database::Database;
use crate::error::Result;
use crate::models::ChatMessageReaction;
use crate::timestamp;

/// Set or clear (`None`) the user's reaction to a message. Only a newer
/// write replaces the stored one.
pub fn chat_react(
    conn: &Connection,
    user: UserId,
    chat_id: &str,
    message_id: &str,
    reaction: Option<&str>,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_message_reactions (user_id, message_id, reaction, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (user_id, message_id) DO UPDATE
         SET reaction = excluded.reaction, updated_at = excluded.updated_at
         WHERE chat_message_reactions.updated_at < excluded.updated_at",
        params![user.0, message_id, reaction, timestamp::to_sql(ts)],
    )?;
    update_latest_fields(conn, chat_id)?;
    Ok(())
}

pub(crate) fn row_to_reaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessageReaction> {
    Ok(ChatMessageReaction {
        user_id: UserId(row.get(0)?),
        message_id: row.get(1)?,
        reaction: row.get(2)?,
        created_at: timestamp::from_sql(row.get(3)?)?,
        updated_at: timestamp::from_sql(row.get(4)?)?,
    })
}

impl Database {
    pub fn get_reaction(&self, user: UserId, message_id: &str) -> Result<Option<ChatMessageReaction>> {
        let reaction = self
            .conn()
            .query_row(
                "SELECT user_id, message_id, reaction, created_at, updated_at
                 FROM chat_message_reactions WHERE user_id = ?1 AND message_id = ?2",
                params![user.0, message_id],
                row_to_reaction,
            )
            .optional()?;
        Ok(reaction)
    }
}
