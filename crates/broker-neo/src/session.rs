use delta_desk_core::SecretBox;
use serde::{Deserialize, Serialize};

/// Per-account login artifacts for the Neo gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeoSession {
    pub username: String,
    /// OAuth access token for the Authorization header.
    pub bearer: String,
    pub sid: String,
    /// Session token for the Auth header.
    pub auth: String,
    pub fin_key: String,
    /// Trade gateway shard, passed as the `sId` query parameter.
    pub server_id: String,
}

/// Session artifacts as persisted at rest, with tokens encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSession {
    pub username: String,
    pub bearer: String,
    pub sid: String,
    pub auth: String,
    pub fin_key: String,
    pub server_id: String,
}

impl SealedSession {
    #[must_use]
    pub fn seal(session: &NeoSession, secrets: &SecretBox) -> Self {
        Self {
            username: session.username.clone(),
            bearer: secrets.encrypt(&session.bearer),
            sid: secrets.encrypt(&session.sid),
            auth: secrets.encrypt(&session.auth),
            fin_key: session.fin_key.clone(),
            server_id: session.server_id.clone(),
        }
    }

    /// Decrypts the tokens back into a usable session.
    ///
    /// # Errors
    ///
    /// Returns an error when a token was sealed under a different key.
    pub fn unseal(&self, secrets: &SecretBox) -> anyhow::Result<NeoSession> {
        Ok(NeoSession {
            username: self.username.clone(),
            bearer: secrets.decrypt(&self.bearer)?,
            sid: secrets.decrypt(&self.sid)?,
            auth: secrets.decrypt(&self.auth)?,
            fin_key: self.fin_key.clone(),
            server_id: self.server_id.clone(),
        })
    }
}
