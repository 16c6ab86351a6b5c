//! The signature-keyed RPC log and its change-event outbox.

use causerie_shared::rpc::SignedRpcEnvelope;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{RpcEvent, RpcLogEntry};
use crate::timestamp;

/// Insert-if-absent on the signature.
///
/// Returns `false` when a row with the same signature already exists, in
/// which case the caller must abandon the apply.
pub fn insert_rpc_log(
    conn: &Connection,
    envelope: &SignedRpcEnvelope,
    applied_at: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO rpc_log (sig, rpc, from_wallet, relayed_by, relayed_at, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (sig) DO NOTHING",
        params![
            envelope.sig,
            envelope.rpc.get(),
            envelope.from_wallet,
            envelope.relayed_by,
            timestamp::to_sql(envelope.relayed_at),
            timestamp::to_sql(applied_at),
        ],
    )?;
    Ok(inserted == 1)
}

/// Record the change event for a committed RPC. Called inside the apply
/// transaction so an event exists exactly when its RPC does.
pub fn record_event(conn: &Connection, sig: &str, created_at: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO rpc_event (sig, created_at) VALUES (?1, ?2)",
        params![sig, timestamp::to_sql(created_at)],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub fn rpc_exists(&self, sig: &str) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM rpc_log WHERE sig = ?1)",
            params![sig],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_rpc_log(&self, sig: &str) -> Result<Option<RpcLogEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT sig, rpc, from_wallet, relayed_by, relayed_at, applied_at
                 FROM rpc_log WHERE sig = ?1",
                params![sig],
                |row| {
                    Ok(RpcLogEntry {
                        sig: row.get(0)?,
                        rpc: row.get(1)?,
                        from_wallet: row.get(2)?,
                        relayed_by: row.get(3)?,
                        relayed_at: timestamp::from_sql(row.get(4)?)?,
                        applied_at: timestamp::from_sql(row.get(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn count_rpc_log(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM rpc_log", [], |row| row.get(0))?)
    }

    /// Id of the newest event, or 0 when there is none.
    pub fn latest_event_id(&self) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COALESCE(MAX(id), 0) FROM rpc_event",
            [],
            |row| row.get(0),
        )?)
    }

    /// Events strictly after `after_id`, oldest first.
    pub fn events_after(&self, after_id: i64, limit: usize) -> Result<Vec<RpcEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sig, created_at FROM rpc_event
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            Ok(RpcEvent {
                id: row.get(0)?,
                sig: row.get(1)?,
                created_at: timestamp::from_sql(row.get(2)?)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Delete events older than `before`. Returns the number removed.
    pub fn prune_events(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM rpc_event WHERE created_at < ?1",
            params![timestamp::to_sql(before)],
        )?)
    }
}
