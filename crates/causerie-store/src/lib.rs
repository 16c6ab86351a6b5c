//! # causerie-store
//!
//! SQLite persistence for the chat core.
//!
//! Mutators are free functions over a `rusqlite::Connection` so the RPC
//! processor can run several of them inside one transaction. Each one is a
//! conditional write gated on the stored timestamp, which makes applying
//! the same set of RPCs in any order converge to the same rows. Read
//! helpers hang off [`Database`].

pub mod activity;
pub mod blasts;
pub mod chats;
pub mod database;
pub mod inbox;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod permissions;
pub mod reactions;
pub mod rpc_log;
pub mod social;
pub mod users;

mod error;
mod timestamp;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use rusqlite::Connection;
