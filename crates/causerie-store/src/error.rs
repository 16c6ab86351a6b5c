use causerie_shared::IdError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored rpc could not be decoded.
    #[error("Stored rpc is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Obfuscated id could not be encoded or decoded.
    #[error("Id error: {0}")]
    Id(#[from] IdError),

    /// A stored enum column held an unknown value.
    #[error("Unexpected stored value: {0}")]
    Corrupt(String),

    /// No active user matches the wallet (and claim, if any).
    #[error("No active user for wallet {0}")]
    UnknownUser(String),

    /// Several active users share the wallet and no claim disambiguates.
    #[error("Wallet {0} resolves to more than one user")]
    AmbiguousUser(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}
