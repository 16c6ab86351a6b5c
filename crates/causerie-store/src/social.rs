//! Writers for the social graph tables.
//!
//! In production these rows come from the indexers; the helpers exist so
//! that indexer adapters and tests write them the same way.

use causerie_shared::types::ContentType;
use causerie_shared::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::timestamp;

pub fn record_follow(
    conn: &Connection,
    follower: UserId,
    followee: UserId,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO follows (follower_user_id, followee_user_id, is_delete, created_at)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT (follower_user_id, followee_user_id) DO UPDATE
         SET is_delete = 0, created_at = excluded.created_at",
        params![follower.0, followee.0, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

pub fn record_unfollow(conn: &Connection, follower: UserId, followee: UserId) -> Result<()> {
    conn.execute(
        "UPDATE follows SET is_delete = 1 WHERE follower_user_id = ?1 AND followee_user_id = ?2",
        params![follower.0, followee.0],
    )?;
    Ok(())
}

pub fn record_tip(
    conn: &Connection,
    sender: UserId,
    receiver: UserId,
    amount: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO user_tips (sender_user_id, receiver_user_id, amount, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![sender.0, receiver.0, amount, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

pub fn record_track(
    conn: &Connection,
    track_id: i64,
    owner: UserId,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO tracks (track_id, owner_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (track_id) DO UPDATE SET owner_id = excluded.owner_id",
        params![track_id, owner.0, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

/// `child` remixes `parent`.
pub fn record_remix(
    conn: &Connection,
    parent_track_id: i64,
    child_track_id: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO remixes (parent_track_id, child_track_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (parent_track_id, child_track_id) DO NOTHING",
        params![parent_track_id, child_track_id, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

pub fn record_purchase(
    conn: &Connection,
    buyer: UserId,
    seller: UserId,
    content_type: ContentType,
    content_id: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO usdc_purchases (buyer_user_id, seller_user_id, content_type, content_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![buyer.0, seller.0, content_type.as_str(), content_id, timestamp::to_sql(ts)],
    )?;
    Ok(())
}

pub fn record_artist_coin(conn: &Connection, owner: UserId, mint: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO artist_coins (mint, user_id) VALUES (?1, ?2)
         ON CONFLICT (mint) DO UPDATE SET user_id = excluded.user_id",
        params![mint, owner.0],
    )?;
    Ok(())
}

pub fn record_balance(
    conn: &Connection,
    holder: UserId,
    mint: &str,
    balance: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sol_user_balances (user_id, mint, balance, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, mint) DO UPDATE SET balance = excluded.balance",
        params![holder.0, mint, balance, timestamp::to_sql(ts)],
    )?;
    Ok(())
}
