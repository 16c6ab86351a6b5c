//! Counters backing the rate limiter.

use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::timestamp;

impl Database {
    /// Messages sent by `user` strictly after `since`, across all chats.
    pub fn count_messages_since(&self, user: UserId, since: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM chat_message WHERE user_id = ?1 AND created_at > ?2",
            params![user.0, timestamp::to_sql(since)],
            |row| row.get(0),
        )?)
    }

    pub fn count_messages_in_chat_since(
        &self,
        user: UserId,
        chat_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM chat_message
             WHERE user_id = ?1 AND chat_id = ?2 AND created_at > ?3",
            params![user.0, chat_id, timestamp::to_sql(since)],
            |row| row.get(0),
        )?)
    }

    /// The largest number of chats created after `since` that any of
    /// `users` belongs to.
    pub fn max_new_chats_since(&self, users: &[UserId], since: DateTime<Utc>) -> Result<i64> {
        let mut stmt = self.conn().prepare(
            "SELECT COUNT(*) FROM chat
             JOIN chat_member ON chat_member.chat_id = chat.chat_id
             WHERE chat_member.user_id = ?1 AND chat.created_at > ?2",
        )?;
        let since = timestamp::to_sql(since);
        let mut max = 0;
        for user in users {
            let count: i64 = stmt.query_row(params![user.0, since], |row| row.get(0))?;
            max = max.max(count);
        }
        Ok(max)
    }
}
