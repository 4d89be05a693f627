// src/sys/secrets.rs

use std::fmt;

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer};

/// Credential is an ephemeral, memory-safe wrapper for the encrypted SSH
/// private key and its passphrase as they arrive from the form.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When it goes out of scope the heap buffer is zeroized.
pub struct Credential {
    token: Secret<Vec<u8>>,
}

impl Credential {
    /// Takes ownership of the raw bytes so no plaintext copy stays behind.
    pub fn new(raw_token: Vec<u8>) -> Self {
        Self {
            token: Secret::new(raw_token),
        }
    }

    /// Exposes the secret to `action` only. The borrowed slice cannot
    /// escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.token.expose_secret().as_slice())
    }

    pub fn is_blank(&self) -> bool {
        self.use_secret(|bytes| bytes.iter().all(u8::is_ascii_whitespace))
    }

    /// Scrubs the buffer now rather than at end of scope.
    pub fn destroy(self) {
        drop(self);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw.into_bytes()))
    }
}
