//! Streaming platform API contract.
//!
//! The collection manager and the OAuth callback only see [`PlatformApi`];
//! [`HttpPlatformClient`] is the production implementation.

mod client;

pub use client::HttpPlatformClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum PlatformError {
    #[error("platform returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("platform rejected the access token")]
    Unauthorized,

    #[error("platform rate limit exceeded")]
    RateLimited,

    #[error("request to platform failed: {0}")]
    Transport(String),

    #[error("malformed platform response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PlatformError::Malformed(e.to_string())
        } else {
            PlatformError::Transport(e.to_string())
        }
    }
}

/// Channel metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub broadcaster_id: String,
    pub broadcaster_login: String,
    pub broadcaster_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
}

/// A published video (VOD, highlight or upload).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: String,
    pub title: String,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    /// Platform duration string, e.g. "1h2m3s"
    #[serde(default)]
    pub duration: String,
}

/// Subscriber totals for a channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriberSummary {
    pub total: u64,
    #[serde(default)]
    pub points: u64,
}

/// Result of validating an access token with the identity endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenValidation {
    /// External account id the token belongs to
    pub user_id: String,
    pub login: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: i64,
}

/// Typed calls against the streaming platform, each taking a bearer token.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn get_channel_info(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<ChannelInfo, PlatformError>;

    async fn get_follower_count(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<u64, PlatformError>;

    async fn get_videos(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<Vec<Video>, PlatformError>;

    async fn get_subscribers(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<SubscriberSummary, PlatformError>;

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidation, PlatformError>;
}
