/// Header carrying the base64 signature of a client submission
pub const SIG_HEADER: &str = "x-sig";

/// `relayed_by` value for RPCs accepted directly over HTTP
pub const RELAYED_BY_BRIDGE: &str = "bridge";

/// Methods in this namespace belong to a prior protocol generation and are skipped
pub const INTERNAL_METHOD_PREFIX: &str = "internal.";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Default minimum length of an obfuscated id
pub const DEFAULT_ID_MIN_LENGTH: u8 = 5;

/// Separator between the two encoded user ids of a chat id
pub const CHAT_ID_SEPARATOR: char = ':';

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8925;
