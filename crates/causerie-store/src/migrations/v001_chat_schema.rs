//! v001 -- Chat schema.
//!
//! Creates the RPC log, its change-event outbox and every table written by
//! the chat mutators. Timestamps are INTEGER microseconds since the epoch.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- RPC log (idempotency barrier, keyed by signature)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rpc_log (
    sig          TEXT PRIMARY KEY NOT NULL,
    rpc          TEXT NOT NULL,               -- exact signed payload
    from_wallet  TEXT NOT NULL,
    relayed_by   TEXT NOT NULL,
    relayed_at   INTEGER NOT NULL,            -- logical timestamp
    applied_at   INTEGER NOT NULL             -- server wall clock
);

CREATE INDEX IF NOT EXISTS idx_rpc_log_relayed_at ON rpc_log(relayed_at);

-- ----------------------------------------------------------------
-- Change events, written in the same transaction as the log row
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rpc_event (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sig         TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat (
    chat_id                    TEXT PRIMARY KEY NOT NULL,
    created_at                 INTEGER NOT NULL,
    last_message_at            INTEGER NOT NULL,
    last_message               TEXT,
    last_message_is_plaintext  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS chat_member (
    chat_id             TEXT NOT NULL,
    user_id             INTEGER NOT NULL,
    invited_by_user_id  INTEGER NOT NULL,
    invite_code         TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    last_active_at      INTEGER,
    unread_count        INTEGER NOT NULL DEFAULT 0,
    cleared_history_at  INTEGER,
    is_hidden           INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chat(chat_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_member_user ON chat_member(user_id);

-- ----------------------------------------------------------------
-- Blasts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_blast (
    blast_id               TEXT PRIMARY KEY NOT NULL,
    from_user_id           INTEGER NOT NULL,
    audience               TEXT NOT NULL,
    audience_content_type  TEXT,
    audience_content_id    INTEGER,
    plaintext              TEXT NOT NULL,
    created_at             INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_blast_from ON chat_blast(from_user_id, created_at);

-- ----------------------------------------------------------------
-- Messages and reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_message (
    message_id  TEXT PRIMARY KEY NOT NULL,
    chat_id     TEXT NOT NULL,
    user_id     INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    ciphertext  TEXT,                         -- NULL for blast messages
    blast_id    TEXT,

    FOREIGN KEY (chat_id) REFERENCES chat(chat_id) ON DELETE CASCADE,
    FOREIGN KEY (blast_id) REFERENCES chat_blast(blast_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_message_chat_ts ON chat_message(chat_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_chat_message_user_ts ON chat_message(user_id, created_at);

CREATE TABLE IF NOT EXISTS chat_message_reactions (
    user_id     INTEGER NOT NULL,
    message_id  TEXT NOT NULL,
    reaction    TEXT,                         -- NULL once removed
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,

    PRIMARY KEY (user_id, message_id),
    FOREIGN KEY (message_id) REFERENCES chat_message(message_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Inbox settings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_permissions (
    user_id     INTEGER NOT NULL,
    permits     TEXT NOT NULL,
    allowed     INTEGER NOT NULL DEFAULT 1,
    updated_at  INTEGER NOT NULL,

    PRIMARY KEY (user_id, permits)
);

CREATE TABLE IF NOT EXISTS chat_blocked_users (
    blocker_user_id  INTEGER NOT NULL,
    blockee_user_id  INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    unblocked_at     INTEGER,                 -- tombstone; NULL while active

    PRIMARY KEY (blocker_user_id, blockee_user_id)
);

CREATE TABLE IF NOT EXISTS chat_ban (
    user_id     INTEGER PRIMARY KEY NOT NULL,
    is_banned   INTEGER NOT NULL DEFAULT 1,
    updated_at  INTEGER NOT NULL
);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
