//! User lookups: RPC author resolution, bans, handles.

use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::timestamp;

/// Row filter for a user allowed to act in chat.
const ACTIVE_USER: &str = "is_current = 1 AND handle IS NOT NULL
     AND is_available = 1 AND is_deactivated = 0";

impl Database {
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users
                 (user_id, wallet, handle, is_current, is_available, is_deactivated, is_verified, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
             ON CONFLICT (user_id) DO UPDATE SET
                 wallet = excluded.wallet,
                 handle = excluded.handle,
                 is_available = excluded.is_available,
                 is_deactivated = excluded.is_deactivated,
                 is_verified = excluded.is_verified",
            params![
                user.user_id.0,
                user.wallet.as_deref().map(str::to_lowercase),
                user.handle,
                user.is_available,
                user.is_deactivated,
                user.is_verified,
                timestamp::to_sql(user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT user_id, wallet, handle, is_available, is_deactivated, is_verified, created_at
                 FROM users WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok(User {
                        user_id: UserId(row.get(0)?),
                        wallet: row.get(1)?,
                        handle: row.get(2)?,
                        is_available: row.get(3)?,
                        is_deactivated: row.get(4)?,
                        is_verified: row.get(5)?,
                        created_at: timestamp::from_sql(row.get(6)?)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn handle_for(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.get_user(user_id)?.and_then(|user| user.handle))
    }

    /// Resolve the acting user of an RPC signed by `wallet`.
    ///
    /// A `claimed` id is honoured when it names an active user owning the
    /// wallet; otherwise the wallet alone must identify exactly one active
    /// user.
    pub fn resolve_user(&self, wallet: &str, claimed: Option<UserId>) -> Result<UserId> {
        if let Some(claimed) = claimed {
            let matches: bool = self.conn().query_row(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM users
                     WHERE user_id = ?1 AND wallet = lower(?2) AND {ACTIVE_USER})"
                ),
                params![claimed.0, wallet],
                |row| row.get(0),
            )?;
            if matches {
                return Ok(claimed);
            }
            tracing::debug!(
                claimed = %claimed,
                wallet,
                "claimed user does not own wallet, falling back to wallet lookup"
            );
        }

        let mut stmt = self.conn().prepare(&format!(
            "SELECT user_id FROM users
             WHERE wallet = lower(?1) AND {ACTIVE_USER}
             ORDER BY user_id ASC LIMIT 2"
        ))?;
        let ids = stmt
            .query_map(params![wallet], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match ids.as_slice() {
            [id] => Ok(UserId(*id)),
            [] => Err(StoreError::UnknownUser(wallet.to_string())),
            _ => Err(StoreError::AmbiguousUser(wallet.to_string())),
        }
    }

    /// Ban or unban a user. Older updates never override newer ones.
    pub fn set_ban(&self, user_id: UserId, banned: bool, ts: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_ban (user_id, is_banned, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE
             SET is_banned = excluded.is_banned, updated_at = excluded.updated_at
             WHERE chat_ban.updated_at < excluded.updated_at",
            params![user_id.0, banned, timestamp::to_sql(ts)],
        )?;
        Ok(())
    }

    pub fn is_banned(&self, user_id: UserId) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM chat_ban WHERE user_id = ?1 AND is_banned = 1)",
            params![user_id.0],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::database::tests::temp_db;

    #[test]
    fn resolves_by_claim_or_wallet() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        db.upsert_user(&User::new(7, "0xAbC", "ada", now)).unwrap();

        assert_eq!(db.resolve_user("0xabc", None).unwrap(), UserId(7));
        assert_eq!(db.resolve_user("0xABC", Some(UserId(7))).unwrap(), UserId(7));
        // A claim for someone else falls back to the wallet owner.
        assert_eq!(db.resolve_user("0xabc", Some(UserId(8))).unwrap(), UserId(7));
        assert!(matches!(
            db.resolve_user("0xdef", None),
            Err(StoreError::UnknownUser(_))
        ));
    }

    #[test]
    fn inactive_and_ambiguous_users_fail() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let mut gone = User::new(1, "0x1", "gone", now);
        gone.is_deactivated = true;
        db.upsert_user(&gone).unwrap();
        assert!(matches!(
            db.resolve_user("0x1", None),
            Err(StoreError::UnknownUser(_))
        ));

        db.upsert_user(&User::new(2, "0x2", "twin_a", now)).unwrap();
        db.upsert_user(&User::new(3, "0x2", "twin_b", now)).unwrap();
        assert!(matches!(
            db.resolve_user("0x2", None),
            Err(StoreError::AmbiguousUser(_))
        ));
        // An explicit claim disambiguates.
        assert_eq!(db.resolve_user("0x2", Some(UserId(3))).unwrap(), UserId(3));
    }

    #[test]
    fn bans_are_last_writer_wins() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        db.set_ban(UserId(1), true, now).unwrap();
        db.set_ban(UserId(1), false, now - Duration::minutes(5)).unwrap();
        assert!(db.is_banned(UserId(1)).unwrap());
        db.set_ban(UserId(1), false, now + Duration::minutes(5)).unwrap();
        assert!(!db.is_banned(UserId(1)).unwrap());
        assert!(!db.is_banned(UserId(2)).unwrap());
    }
}
