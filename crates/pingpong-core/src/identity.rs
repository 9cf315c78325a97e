//! Process identity: a nostr key pair held for the lifetime of the process.

use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, PublicKey};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid secret key: {0}")]
    InvalidSecret(String),
    #[error("Invalid npub {input}: {reason}")]
    InvalidNpub { input: String, reason: String },
    #[error("Bech32 encoding failed: {0}")]
    Encoding(String),
}

/// A nostr key pair.
///
/// The secret half never leaves this type except through the explicit
/// `secret_hex`/`nsec` accessors used by key generation tooling.
#[derive(Clone)]
pub struct Identity {
    keys: Keys,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    /// Load an identity from a secret key in hex or `nsec` form.
    pub fn from_secret(secret: &str) -> Result<Self, IdentityError> {
        let keys = Keys::parse(secret.trim())
            .map_err(|e| IdentityError::InvalidSecret(e.to_string()))?;
        Ok(Self { keys })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Keys used to sign outgoing events.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn npub(&self) -> Result<String, IdentityError> {
        self.public_key()
            .to_bech32()
            .map_err(|e| IdentityError::Encoding(e.to_string()))
    }

    pub fn nsec(&self) -> Result<String, IdentityError> {
        self.keys
            .secret_key()
            .to_bech32()
            .map_err(|e| IdentityError::Encoding(e.to_string()))
    }

    pub fn secret_hex(&self) -> String {
        self.keys.secret_key().to_secret_hex()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Decode an externally supplied `npub` into the relay's native key form.
pub fn decode_npub(encoded: &str) -> Result<PublicKey, IdentityError> {
    PublicKey::from_bech32(encoded.trim()).map_err(|e| IdentityError::InvalidNpub {
        input: encoded.to_string(),
        reason: e.to_string(),
    })
}
