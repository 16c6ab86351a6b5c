use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::chats::{chat_read, update_latest_fields};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::ChatMessage;
use crate::timestamp;

/// Store an encrypted message, refresh the chat's derived fields and mark
/// the chat read for the sender.
pub fn chat_send_message(
    conn: &Connection,
    user: UserId,
    chat_id: &str,
    message_id: &str,
    ciphertext: &str,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_message (message_id, chat_id, user_id, created_at, ciphertext)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![message_id, chat_id, user.0, timestamp::to_sql(ts), ciphertext],
    )?;
    update_latest_fields(conn, chat_id)?;
    chat_read(conn, user, chat_id, ts)?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        message_id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: UserId(row.get(2)?),
        created_at: timestamp::from_sql(row.get(3)?)?,
        ciphertext: row.get(4)?,
        blast_id: row.get(5)?,
    })
}

impl Database {
    pub fn get_message(&self, message_id: &str) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                "SELECT message_id, chat_id, user_id, created_at, ciphertext, blast_id
                 FROM chat_message WHERE message_id = ?1",
                params![message_id],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn message_exists_in_chat(&self, chat_id: &str, message_id: &str) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM chat_message WHERE chat_id = ?1 AND message_id = ?2)",
            params![chat_id, message_id],
            |row| row.get(0),
        )?)
    }

    /// Messages in a chat, oldest first.
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, chat_id, user_id, created_at, ciphertext, blast_id
             FROM chat_message
             WHERE chat_id = ?1
             ORDER BY created_at ASC, message_id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}
