//! Error taxonomy shared by every component.
//!
//! Handler-facing code only ever needs to distinguish two user-visible
//! outcomes: "connect" (no credential) and "reconnect" (credential existed
//! but is unusable). [`Error::banner`] performs that mapping.

use thiserror::Error as ThisError;

use crate::credentials::EncryptionError;
use crate::platform::PlatformError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("no stored credential for owner {owner_id} (connect required)")]
    CredentialNotFound { owner_id: String },

    #[error("credential for owner {owner_id} can no longer be used: {reason} (reconnect required)")]
    ReauthRequired { owner_id: String, reason: String },

    #[error("external account for owner {owner_id} changed during collection")]
    AccountSwitched { owner_id: String },

    #[error("upstream error: {0}")]
    Upstream(#[from] PlatformError),

    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("OAuth session is missing or expired")]
    SessionExpiredOrInvalid,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

/// Which prompt the UI should show for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
    Connect,
    Reconnect,
    None,
}

impl Error {
    pub fn banner(&self) -> Banner {
        match self {
            Error::CredentialNotFound { .. } => Banner::Connect,
            Error::ReauthRequired { .. } => Banner::Reconnect,
            _ => Banner::None,
        }
    }

    pub fn reauth(owner_id: &str, reason: impl Into<String>) -> Self {
        Error::ReauthRequired {
            owner_id: owner_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn account_switched(owner_id: &str) -> Self {
        Error::AccountSwitched {
            owner_id: owner_id.to_string(),
        }
    }

    pub fn not_found(owner_id: &str) -> Self {
        Error::CredentialNotFound {
            owner_id: owner_id.to_string(),
        }
    }
}
