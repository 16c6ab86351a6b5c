//! Inbox permissions, blocks, and the allow predicate built from them.
//!
//! A user's permission rows behave as one last-writer-wins register: a write
//! at `t` never lands while any row of that user is newer than `t`.

use causerie_shared::rpc::PermissionUpdate;
use causerie_shared::types::ChatPermit;
use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ChatBlock, ChatPermission};
use crate::timestamp;

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

pub fn set_permissions(
    conn: &Connection,
    user: UserId,
    update: &PermissionUpdate,
    ts: DateTime<Utc>,
) -> Result<()> {
    let ts = timestamp::to_sql(ts);
    match update {
        PermissionUpdate::Single(permit) => {
            delete_older(conn, user, ts)?;
            conn.execute(
                "INSERT INTO chat_permissions (user_id, permits, allowed, updated_at)
                 SELECT ?1, ?2, 1, ?3
                 WHERE NOT EXISTS (
                     SELECT 1 FROM chat_permissions WHERE user_id = ?1 AND updated_at > ?3
                 )
                 ON CONFLICT (user_id, permits) DO NOTHING",
                params![user.0, permit.as_str(), ts],
            )?;
        }
        PermissionUpdate::Exclusive(permit) => {
            delete_older(conn, user, ts)?;
            upsert_permit(conn, user, *permit, true, ts)?;
        }
        PermissionUpdate::AllowList(list) => {
            conn.execute(
                "DELETE FROM chat_permissions
                 WHERE user_id = ?1 AND permits IN ('all', 'none') AND updated_at < ?2",
                params![user.0, ts],
            )?;
            for permit in ChatPermit::ALLOW_LIST {
                upsert_permit(conn, user, permit, list.contains(&permit), ts)?;
            }
        }
    }
    Ok(())
}

fn delete_older(conn: &Connection, user: UserId, ts: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM chat_permissions WHERE user_id = ?1 AND updated_at < ?2",
        params![user.0, ts],
    )?;
    Ok(())
}

fn upsert_permit(
    conn: &Connection,
    user: UserId,
    permit: ChatPermit,
    allowed: bool,
    ts: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_permissions (user_id, permits, allowed, updated_at)
         SELECT ?1, ?2, ?3, ?4
         WHERE NOT EXISTS (
             SELECT 1 FROM chat_permissions WHERE user_id = ?1 AND updated_at > ?4
         )
         ON CONFLICT (user_id, permits) DO UPDATE
         SET allowed = excluded.allowed, updated_at = excluded.updated_at
         WHERE chat_permissions.updated_at < excluded.updated_at",
        params![user.0, permit.as_str(), allowed, ts],
    )?;
    Ok(())
}

/// Block `blockee`. An active block is kept as is; a tombstoned one is
/// revived only when this block is newer than the unblock.
pub fn block(conn: &Connection, blocker: UserId, blockee: UserId, ts: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_blocked_users (blocker_user_id, blockee_user_id, created_at, unblocked_at)
         VALUES (?1, ?2, ?3, NULL)
         ON CONFLICT (blocker_user_id, blockee_user_id) DO UPDATE
         SET created_at = excluded.created_at, unblocked_at = NULL
         WHERE chat_blocked_users.unblocked_at IS NOT NULL
           AND chat_blocked_users.unblocked_at < excluded.created_at",
        params![blocker.0, blockee.0, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

/// Unblock `blockee`, leaving a tombstone so an older block delivered later
/// stays ignored.
pub fn unblock(
    conn: &Connection,
    blocker: UserId,
    blockee: UserId,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_blocked_users (blocker_user_id, blockee_user_id, created_at, unblocked_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT (blocker_user_id, blockee_user_id) DO UPDATE
         SET unblocked_at = excluded.unblocked_at
         WHERE chat_blocked_users.created_at < excluded.unblocked_at
           AND (chat_blocked_users.unblocked_at IS NULL
                OR chat_blocked_users.unblocked_at < excluded.unblocked_at)",
        params![blocker.0, blockee.0, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Whether `sender` may message `receiver` right now: no active block in
/// either direction, and the receiver's settings admit the sender.
pub fn chat_allowed(conn: &Connection, sender: UserId, receiver: UserId) -> Result<bool> {
    if is_blocked_either_way(conn, sender, receiver)? {
        return Ok(false);
    }

    let settings = permissions_for(conn, receiver)?;
    if settings.is_empty() {
        return Ok(true);
    }

    let allowed: Vec<ChatPermit> = settings
        .iter()
        .filter(|p| p.allowed)
        .map(|p| p.permit)
        .collect();
    if allowed.contains(&ChatPermit::All) {
        return Ok(true);
    }
    if allowed.contains(&ChatPermit::None) {
        return Ok(false);
    }

    for permit in allowed {
        if permit_admits(conn, permit, sender, receiver)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn permit_admits(
    conn: &Connection,
    permit: ChatPermit,
    sender: UserId,
    receiver: UserId,
) -> Result<bool> {
    let sql = match permit {
        ChatPermit::All => return Ok(true),
        ChatPermit::None => return Ok(false),
        ChatPermit::Followees => {
            "SELECT EXISTS (SELECT 1 FROM follows
             WHERE follower_user_id = ?2 AND followee_user_id = ?1 AND is_delete = 0)"
        }
        ChatPermit::Followers => {
            "SELECT EXISTS (SELECT 1 FROM follows
             WHERE follower_user_id = ?1 AND followee_user_id = ?2 AND is_delete = 0)"
        }
        ChatPermit::Tippers => {
            "SELECT EXISTS (SELECT 1 FROM user_tips
             WHERE sender_user_id = ?1 AND receiver_user_id = ?2)"
        }
        ChatPermit::Tippees => {
            "SELECT EXISTS (SELECT 1 FROM user_tips
             WHERE sender_user_id = ?2 AND receiver_user_id = ?1)"
        }
        ChatPermit::Verified => {
            return Ok(conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM users WHERE user_id = ?1 AND is_verified = 1)",
                params![sender.0],
                |row| row.get(0),
            )?);
        }
    };
    Ok(conn.query_row(sql, params![sender.0, receiver.0], |row| row.get(0))?)
}

pub(crate) fn is_blocked_either_way(conn: &Connection, a: UserId, b: UserId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM chat_blocked_users
         WHERE unblocked_at IS NULL
           AND ((blocker_user_id = ?1 AND blockee_user_id = ?2)
             OR (blocker_user_id = ?2 AND blockee_user_id = ?1)))",
        params![a.0, b.0],
        |row| row.get(0),
    )?)
}

pub(crate) fn permissions_for(conn: &Connection, user: UserId) -> Result<Vec<ChatPermission>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, permits, allowed, updated_at
         FROM chat_permissions WHERE user_id = ?1 ORDER BY permits",
    )?;
    let rows = stmt.query_map(params![user.0], |row| {
        let permit: String = row.get(1)?;
        Ok((
            row.get::<_, i64>(0)?,
            permit,
            row.get::<_, bool>(2)?,
            timestamp::from_sql(row.get(3)?)?,
        ))
    })?;

    let mut permissions = Vec::new();
    for row in rows {
        let (user_id, permit, allowed, updated_at) = row?;
        let permit = permit.parse::<ChatPermit>().map_err(StoreError::Corrupt)?;
        permissions.push(ChatPermission {
            user_id: UserId(user_id),
            permit,
            allowed,
            updated_at,
        });
    }
    Ok(permissions)
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

impl Database {
    pub fn chat_allowed(&self, sender: UserId, receiver: UserId) -> Result<bool> {
        chat_allowed(self.conn(), sender, receiver)
    }

    pub fn permissions_for(&self, user: UserId) -> Result<Vec<ChatPermission>> {
        permissions_for(self.conn(), user)
    }

    pub fn get_block(&self, blocker: UserId, blockee: UserId) -> Result<Option<ChatBlock>> {
        let block = self
            .conn()
            .query_row(
                "SELECT blocker_user_id, blockee_user_id, created_at, unblocked_at
                 FROM chat_blocked_users WHERE blocker_user_id = ?1 AND blockee_user_id = ?2",
                params![blocker.0, blockee.0],
                |row| {
                    Ok(ChatBlock {
                        blocker_user_id: UserId(row.get(0)?),
                        blockee_user_id: UserId(row.get(1)?),
                        created_at: timestamp::from_sql(row.get(2)?)?,
                        unblocked_at: timestamp::opt_from_sql(row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(block)
    }

    /// Whether `blocker` currently blocks `blockee`.
    pub fn is_blocked(&self, blocker: UserId, blockee: UserId) -> Result<bool> {
        Ok(self
            .get_block(blocker, blockee)?
            .is_some_and(|block| block.is_active()))
    }
}
