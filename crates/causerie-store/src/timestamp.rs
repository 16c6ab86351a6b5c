//! Timestamps are stored as microseconds since the Unix epoch so that the
//! last-writer-wins gates compare integers in SQL.

use chrono::{DateTime, Utc};

pub(crate) fn to_sql(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_sql(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, micros))
}

pub(crate) fn opt_from_sql(micros: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    micros.map(from_sql).transpose()
}
