//! Credential vault: OAuth tokens encrypted at rest, one row per owner.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialVault                    │
//! │  - one credential per owner id           │
//! │  - account switch detection              │
//! │  - transparent encryption/decryption     │
//! └─────────────────────────────────────────┘
//!          ↓ (switch / disconnect)      ↓
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  PurgeQueue → Worker │   │  Encryption Module   │
//! │  analytics + cache   │   │  AES-256-GCM         │
//! └──────────────────────┘   └──────────────────────┘
//!          ↓                            ↓
//! ┌─────────────────────────────────────────┐
//! │       SQLite (stored_credentials)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Access and refresh tokens encrypted separately, unique nonce each
//! - Master key must be 32 bytes (256 bits), held in memory only
//! - Tokens are redacted from `Debug` output

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

mod encryption;
mod purge;
mod storage;

pub use encryption::{decrypt, encrypt, EncryptionError, EncryptionKey};
pub use purge::{purge_channel, PurgeQueue, PurgeReason, PurgeRequest, PurgeStats, PurgeWorker};
pub use storage::{CredentialVault, StoreOutcome};

/// Access/refresh token pair plus the metadata needed to use it.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// True when the token expires within `leeway` of `now` (or already has).
    ///
    /// Tokens without an expiry never need a refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + leeway,
            None => false,
        }
    }

    /// Byte-for-byte comparison of the secret parts only.
    pub fn same_secrets(&self, other: &OAuthToken) -> bool {
        self.access_token == other.access_token && self.refresh_token == other.refresh_token
    }
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Decrypted credential row.
#[derive(Clone, Debug)]
pub struct StoredCredential {
    pub owner_id: String,
    pub external_account_id: String,
    pub token: OAuthToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Connection summary for the status endpoint. Never carries secrets.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_id: Option<String>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            external_account_id: None,
            scopes: Vec::new(),
            expires_at: None,
            updated_at: None,
        }
    }
}
