//! Encryption of stored broker session material.
//!
//! Session tokens handed to the execution adapters are persisted by the
//! external configuration layer as fernet tokens; this is the shared
//! encrypt/decrypt boundary.

use anyhow::{anyhow, Context, Result};
use fernet::Fernet;

pub struct SecretBox {
    fernet: Fernet,
}

impl SecretBox {
    /// Builds a secret box from a base64 fernet key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid fernet key.
    pub fn new(key: &str) -> Result<Self> {
        let fernet = Fernet::new(key).ok_or_else(|| anyhow!("invalid fernet key"))?;
        Ok(Self { fernet })
    }

    /// Reads the key from `DELTA_DESK_ENCRYPT_KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or holds an invalid key.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("DELTA_DESK_ENCRYPT_KEY")
            .context("DELTA_DESK_ENCRYPT_KEY is not set")?;
        Self::new(&key)
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate_key() -> String {
        Fernet::generate_key()
    }

    #[must_use]
    pub fn encrypt(&self, plaintext: &str) -> String {
        self.fernet.encrypt(plaintext.as_bytes())
    }

    /// # Errors
    ///
    /// Returns an error if the token is malformed or was produced with a
    /// different key.
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let bytes = self
            .fernet
            .decrypt(token)
            .map_err(|_| anyhow!("fernet token failed to decrypt"))?;
        String::from_utf8(bytes).context("decrypted secret is not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let secrets = SecretBox::new(&SecretBox::generate_key()).unwrap();
        let token = secrets.encrypt("session-token-123");
        assert_ne!(token, "session-token-123");
        assert_eq!(secrets.decrypt(&token).unwrap(), "session-token-123");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = SecretBox::new(&SecretBox::generate_key()).unwrap();
        let b = SecretBox::new(&SecretBox::generate_key()).unwrap();
        let token = a.encrypt("secret");
        assert!(b.decrypt(&token).is_err());
    }
}
