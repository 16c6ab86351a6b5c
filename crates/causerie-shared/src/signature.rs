//! Wallet signatures over raw RPC payloads.
//!
//! A signature travels as standard base64 of `public key || signature`
//! (32 + 64 bytes). Recovering the wallet means verifying the signature
//! against the embedded key and deriving the address from that key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::SignatureError;

/// A wallet able to sign RPC payloads.
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
}

impl Wallet {
    /// Generate a new random wallet
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a wallet from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// The wallet address derived from the public key
    pub fn address(&self) -> String {
        wallet_address(&self.signing_key.verifying_key())
    }

    /// Sign a payload and encode it in the wire format.
    pub fn sign_payload(&self, payload: &[u8]) -> String {
        let signature = self.signing_key.sign(payload);
        let mut raw = Vec::with_capacity(PUBKEY_SIZE + SIGNATURE_SIZE);
        raw.extend_from_slice(&self.signing_key.verifying_key().to_bytes());
        raw.extend_from_slice(&signature.to_bytes());
        BASE64.encode(raw)
    }
}

/// `0x` followed by the lowercase hex public key.
pub fn wallet_address(key: &VerifyingKey) -> String {
    format!("0x{}", hex::encode(key.to_bytes()))
}

/// Recover the signing wallet of `payload`.
pub fn recover_wallet(payload: &[u8], signature_b64: &str) -> Result<String, SignatureError> {
    let raw = BASE64.decode(signature_b64.trim())?;
    if raw.len() != PUBKEY_SIZE + SIGNATURE_SIZE {
        return Err(SignatureError::Length(raw.len()));
    }
    let (key_bytes, sig_bytes) = raw.split_at(PUBKEY_SIZE);

    let mut key = [0u8; PUBKEY_SIZE];
    key.copy_from_slice(key_bytes);
    let verifying_key =
        VerifyingKey::from_bytes(&key).map_err(|_| SignatureError::InvalidKey)?;

    let signature =
        Signature::from_slice(sig_bytes).map_err(|_| SignatureError::Length(sig_bytes.len()))?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| SignatureError::Mismatch)?;

    Ok(wallet_address(&verifying_key))
}

/// Wallet addresses compare case-insensitively.
pub fn same_wallet(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
