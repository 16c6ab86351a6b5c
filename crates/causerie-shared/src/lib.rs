//! # causerie-shared
//!
//! Wire-level vocabulary shared by the store and the server: the signed RPC
//! envelope, the closed set of chat methods with their typed params, the
//! obfuscated identifier codec and the wallet signature scheme.

pub mod constants;
pub mod error;
pub mod ids;
pub mod rpc;
pub mod signature;
pub mod types;

pub use error::{IdError, RpcError, SignatureError};
pub use ids::IdCodec;
pub use types::UserId;
