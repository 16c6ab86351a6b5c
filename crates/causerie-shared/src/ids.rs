//! Obfuscated identifiers and the deterministic ids derived from them.
//!
//! Every user and content id that crosses the wire is encoded through
//! [`IdCodec`]. Chat ids are built from the *encoded* ids so that either
//! party can compute the same id without coordination.

use std::fmt;

use sqids::Sqids;

use crate::constants::{CHAT_ID_SEPARATOR, DEFAULT_ID_MIN_LENGTH};
use crate::error::IdError;
use crate::types::{Audience, ContentType, UserId};

/// Reversible integer <-> string mapping.
pub struct IdCodec {
    sqids: Sqids,
}

impl fmt::Debug for IdCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdCodec").finish_non_exhaustive()
    }
}

impl IdCodec {
    /// Build a codec with the given minimum length and an optional custom
    /// alphabet.
    pub fn new(min_length: u8, alphabet: Option<&str>) -> Result<Self, IdError> {
        let mut builder = Sqids::builder().min_length(min_length);
        if let Some(alphabet) = alphabet {
            builder = builder.alphabet(alphabet.chars().collect());
        }
        let sqids = builder
            .build()
            .map_err(|e| IdError::Codec(e.to_string()))?;
        Ok(Self { sqids })
    }

    pub fn encode(&self, id: i64) -> Result<String, IdError> {
        let value = u64::try_from(id).map_err(|_| IdError::Negative(id))?;
        self.sqids
            .encode(&[value])
            .map_err(|e| IdError::Codec(e.to_string()))
    }

    /// Decode an obfuscated id.
    ///
    /// Only the canonical encoding of a single id is accepted, so one
    /// number never has two valid spellings.
    pub fn decode(&self, encoded: &str) -> Result<i64, IdError> {
        let numbers = self.sqids.decode(encoded);
        let [value] = numbers.as_slice() else {
            return Err(IdError::Invalid(encoded.to_string()));
        };
        let id = i64::try_from(*value).map_err(|_| IdError::Invalid(encoded.to_string()))?;
        if self.encode(id)? != encoded {
            return Err(IdError::Invalid(encoded.to_string()));
        }
        Ok(id)
    }

    pub fn encode_user(&self, user: UserId) -> Result<String, IdError> {
        self.encode(user.0)
    }

    pub fn decode_user(&self, encoded: &str) -> Result<UserId, IdError> {
        self.decode(encoded).map(UserId)
    }

    /// Deterministic two-party chat id: both encoded ids, smaller first.
    pub fn chat_id(&self, a: UserId, b: UserId) -> Result<String, IdError> {
        let a = self.encode_user(a)?;
        let b = self.encode_user(b)?;
        let (first, second) = if b < a { (b, a) } else { (a, b) };
        Ok(format!("{first}{CHAT_ID_SEPARATOR}{second}"))
    }

    /// Id of a blast as seen from its sender's outbox:
    /// the audience, optionally followed by the content it is scoped to.
    pub fn blast_chat_id(
        &self,
        audience: Audience,
        content: Option<(ContentType, i64)>,
    ) -> Result<String, IdError> {
        match content {
            Some((content_type, content_id)) => Ok(format!(
                "{audience}{CHAT_ID_SEPARATOR}{content_type}{CHAT_ID_SEPARATOR}{}",
                self.encode(content_id)?
            )),
            None => Ok(audience.to_string()),
        }
    }
}

impl Default for IdCodec {
    fn default() -> Self {
        Self {
            sqids: Sqids::builder()
                .min_length(DEFAULT_ID_MIN_LENGTH)
                .build()
                .unwrap_or_default(),
        }
    }
}

/// Message id of a blast materialized in a given chat.
pub fn blast_message_id(blast_id: &str, chat_id: &str) -> String {
    format!("{blast_id}{chat_id}")
}
