//! v002 -- Social graph tables.
//!
//! These are written by the chain/event indexers; the chat core only reads
//! them to resolve users and evaluate permissions and blast audiences.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id         INTEGER PRIMARY KEY NOT NULL,
    wallet          TEXT,
    handle          TEXT,
    is_current      INTEGER NOT NULL DEFAULT 1,
    is_available    INTEGER NOT NULL DEFAULT 1,
    is_deactivated  INTEGER NOT NULL DEFAULT 0,
    is_verified     INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_wallet ON users(wallet);

CREATE TABLE IF NOT EXISTS follows (
    follower_user_id  INTEGER NOT NULL,
    followee_user_id  INTEGER NOT NULL,
    is_delete         INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL,

    PRIMARY KEY (follower_user_id, followee_user_id)
);

CREATE TABLE IF NOT EXISTS user_tips (
    sender_user_id    INTEGER NOT NULL,
    receiver_user_id  INTEGER NOT NULL,
    amount            INTEGER NOT NULL,
    created_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_tips_pair ON user_tips(receiver_user_id, sender_user_id);

CREATE TABLE IF NOT EXISTS tracks (
    track_id    INTEGER PRIMARY KEY NOT NULL,
    owner_id    INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS remixes (
    parent_track_id  INTEGER NOT NULL,
    child_track_id   INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,

    PRIMARY KEY (parent_track_id, child_track_id)
);

CREATE TABLE IF NOT EXISTS usdc_purchases (
    buyer_user_id   INTEGER NOT NULL,
    seller_user_id  INTEGER NOT NULL,
    content_type    TEXT NOT NULL,
    content_id      INTEGER NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usdc_purchases_pair ON usdc_purchases(seller_user_id, buyer_user_id);

CREATE TABLE IF NOT EXISTS artist_coins (
    mint     TEXT PRIMARY KEY NOT NULL,
    user_id  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sol_user_balances (
    user_id     INTEGER NOT NULL,
    mint        TEXT NOT NULL,
    balance     INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,

    PRIMARY KEY (user_id, mint)
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
