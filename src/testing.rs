//! In-process fakes for the external contracts, shared by unit tests, the
//! integration tests and the collection manager's tests.

use crate::credentials::OAuthToken;
use crate::error::{Error, Result};
use crate::oauth::TokenExchange;
use crate::platform::{
    ChannelInfo, PlatformApi, PlatformError, SubscriberSummary, TokenValidation, Video,
};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Token pair expiring `expires_in_secs` from now, refresh token `<access>-refresh`.
pub fn sample_token(access_token: &str, expires_in_secs: i64) -> OAuthToken {
    OAuthToken {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("{}-refresh", access_token)),
        scopes: vec!["channel:read:subscriptions".to_string()],
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
    }
}

fn provider_error(message: &str) -> Error {
    Error::Upstream(PlatformError::Status {
        status: 400,
        body: message.to_string(),
    })
}

/// Scripted [`TokenExchange`]. Unconfigured calls fail with a 400.
#[derive(Default)]
pub struct FakeTokenExchange {
    exchange_result: Mutex<Option<std::result::Result<OAuthToken, String>>>,
    refresh_result: Mutex<Option<std::result::Result<OAuthToken, String>>>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl FakeTokenExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exchange_result(&self, result: std::result::Result<OAuthToken, String>) {
        *self.exchange_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    }

    pub fn set_refresh_result(&self, result: std::result::Result<OAuthToken, String>) {
        *self.refresh_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn scripted(slot: &Mutex<Option<std::result::Result<OAuthToken, String>>>) -> Result<OAuthToken> {
        match slot.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(Ok(token)) => Ok(token),
            Some(Err(message)) => Err(provider_error(&message)),
            None => Err(provider_error("no scripted response")),
        }
    }
}

#[async_trait]
impl TokenExchange for FakeTokenExchange {
    async fn exchange_code(&self, _code: &str, _redirect_uri: &str) -> Result<OAuthToken> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Self::scripted(&self.exchange_result)
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<OAuthToken> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Self::scripted(&self.refresh_result)
    }
}

/// Deterministic [`PlatformApi`].
///
/// Every broadcaster has [`FakePlatform::FOLLOWERS`] followers and two
/// videos (30 and 10 views). Broadcasters marked with `fail_broadcaster`
/// get a 500; `set_delay` makes every data call sleep first.
/// `set_blocking_delay` parks the calling thread instead, so the call
/// cannot be interrupted by cancellation or timeouts.
#[derive(Default)]
pub struct FakePlatform {
    accounts: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<std::time::Duration>>,
    blocking_delay: Mutex<Option<std::time::Duration>>,
    calls: AtomicUsize,
}

impl FakePlatform {
    pub const FOLLOWERS: u64 = 1_250;
    pub const SUBSCRIBERS: u64 = 42;

    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `validate_token(access_token)` resolve to `user_id`.
    pub fn set_account(&self, access_token: &str, user_id: &str) {
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(access_token.to_string(), user_id.to_string());
    }

    pub fn fail_broadcaster(&self, broadcaster_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(broadcaster_id.to_string());
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn set_blocking_delay(&self, delay: std::time::Duration) {
        *self.blocking_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Data calls made so far (excludes `validate_token`).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, broadcaster_id: &str) -> std::result::Result<(), PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let blocking = *self.blocking_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(blocking) = blocking {
            std::thread::sleep(blocking);
        }
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(broadcaster_id)
        {
            return Err(PlatformError::Status {
                status: 500,
                body: "internal server error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn get_channel_info(
        &self,
        _access_token: &str,
        broadcaster_id: &str,
    ) -> std::result::Result<ChannelInfo, PlatformError> {
        self.enter(broadcaster_id).await?;
        Ok(ChannelInfo {
            broadcaster_id: broadcaster_id.to_string(),
            broadcaster_login: format!("login_{}", broadcaster_id.to_lowercase()),
            broadcaster_name: format!("Creator {}", broadcaster_id),
            game_name: "Just Chatting".to_string(),
            title: "Live".to_string(),
        })
    }

    async fn get_follower_count(
        &self,
        _access_token: &str,
        broadcaster_id: &str,
    ) -> std::result::Result<u64, PlatformError> {
        self.enter(broadcaster_id).await?;
        Ok(Self::FOLLOWERS)
    }

    async fn get_videos(
        &self,
        _access_token: &str,
        broadcaster_id: &str,
    ) -> std::result::Result<Vec<Video>, PlatformError> {
        self.enter(broadcaster_id).await?;
        let created_at = Utc
            .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(vec![
            Video {
                id: "v-low".to_string(),
                title: "Short stream".to_string(),
                view_count: 10,
                created_at,
                duration: "30m".to_string(),
            },
            Video {
                id: "v-high".to_string(),
                title: "Long stream".to_string(),
                view_count: 30,
                created_at,
                duration: "3h".to_string(),
            },
        ])
    }

    async fn get_subscribers(
        &self,
        _access_token: &str,
        broadcaster_id: &str,
    ) -> std::result::Result<SubscriberSummary, PlatformError> {
        self.enter(broadcaster_id).await?;
        Ok(SubscriberSummary {
            total: Self::SUBSCRIBERS,
            points: Self::SUBSCRIBERS,
        })
    }

    async fn validate_token(
        &self,
        access_token: &str,
    ) -> std::result::Result<TokenValidation, PlatformError> {
        let user_id = self
            .accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(access_token)
            .cloned()
            .ok_or(PlatformError::Unauthorized)?;
        Ok(TokenValidation {
            login: format!("login_{}", user_id.to_lowercase()),
            user_id,
            scopes: vec!["channel:read:subscriptions".to_string()],
            expires_in: 14_400,
        })
    }
}
