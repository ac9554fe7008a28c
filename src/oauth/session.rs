//! OAuth session store for CSRF protection.
//!
//! Maps a random state token to the owner who initiated the flow. One
//! instance is constructed at startup and shared by handle. Sessions are
//! single-use and expire after the configured TTL (10 minutes by default);
//! an expired session is never returned, even before the sweep removes it.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Number of random bytes in a state token (hex encoded to 64 chars)
const STATE_BYTES: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthSession {
    pub state: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthSession {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, OAuthSession>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Generates a fresh state token for `owner_id` and stores the session.
    pub fn create_session(&self, owner_id: &str) -> OAuthSession {
        let mut bytes = [0u8; STATE_BYTES];
        OsRng.fill_bytes(&mut bytes);

        let now = Utc::now();
        let session = OAuthSession {
            state: hex::encode(bytes),
            owner_id: owner_id.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.write()
            .insert(session.state.clone(), session.clone());

        debug!(owner_id = %owner_id, expires_at = %session.expires_at, "OAuth session created");
        session
    }

    /// Looks up a live session. Expired entries are removed on sight.
    pub fn get_session(&self, state: &str) -> Option<OAuthSession> {
        let now = Utc::now();
        {
            let sessions = self.read();
            match sessions.get(state) {
                None => return None,
                Some(session) if !session.is_expired(now) => return Some(session.clone()),
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, another reader may have won
        let mut sessions = self.write();
        if sessions.get(state).is_some_and(|s| s.is_expired(now)) {
            sessions.remove(state);
            debug!("Removed expired OAuth session on lookup");
        }
        None
    }

    /// Removes a session. Returns whether it was present.
    pub fn delete_session(&self, state: &str) -> bool {
        self.write().remove(state).is_some()
    }

    /// Validates and deletes in one step for the callback path.
    pub fn consume_session(&self, state: &str) -> Result<OAuthSession> {
        let session = self.get_session(state).ok_or(Error::SessionExpiredOrInvalid)?;
        if !self.delete_session(state) {
            // Lost a race with a concurrent callback for the same state
            return Err(Error::SessionExpiredOrInvalid);
        }
        Ok(session)
    }

    /// Removes every expired session, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }

    /// Number of sessions held, expired or not (for monitoring).
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, OAuthSession>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, OAuthSession>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background task to periodically sweep expired sessions.
///
/// Runs independently of request traffic so abandoned flows are bounded.
pub async fn run_session_sweep(
    store: SessionStore,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = store.sweep_expired();
                debug!(removed = removed, remaining = store.len(), "OAuth session sweep complete");
            }
        }
    }

    info!("OAuth session sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_session() {
        let store = SessionStore::new(Duration::minutes(10));

        let session = store.create_session("U1");
        assert_eq!(session.state.len(), STATE_BYTES * 2);
        assert!(session.state.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(session.expires_at - session.created_at, Duration::minutes(10));

        let found = store.get_session(&session.state).unwrap();
        assert_eq!(found.owner_id, "U1");
    }

    #[test]
    fn test_deleted_session_is_gone() {
        let store = SessionStore::new(Duration::minutes(10));
        let session = store.create_session("U1");

        assert!(store.delete_session(&session.state));
        assert!(store.get_session(&session.state).is_none());
        assert!(!store.delete_session(&session.state));
    }

    #[test]
    fn test_consume_is_single_use() {
        let store = SessionStore::new(Duration::minutes(10));
        let session = store.create_session("U1");

        assert_eq!(store.consume_session(&session.state).unwrap().owner_id, "U1");
        assert!(matches!(
            store.consume_session(&session.state),
            Err(Error::SessionExpiredOrInvalid)
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let store = SessionStore::new(Duration::minutes(10));
        assert!(store.get_session("invalid_state").is_none());
    }

    #[test]
    fn test_states_are_unique() {
        let store = SessionStore::new(Duration::minutes(10));
        let a = store.create_session("U1");
        let b = store.create_session("U1");
        assert_ne!(a.state, b.state);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_expired_session_not_returned_before_sweep() {
        let store = SessionStore::new(Duration::milliseconds(20));
        let session = store.create_session("U1");

        std::thread::sleep(std::time::Duration::from_millis(40));

        assert!(store.get_session(&session.state).is_none());
        // Lazily removed by the lookup itself
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let short = SessionStore::new(Duration::milliseconds(20));
        short.create_session("U1");
        short.create_session("U2");
        std::thread::sleep(std::time::Duration::from_millis(40));

        assert_eq!(short.sweep_expired(), 2);
        assert!(short.is_empty());

        let long = SessionStore::new(Duration::minutes(10));
        long.create_session("U3");
        assert_eq!(long.sweep_expired(), 0);
        assert_eq!(long.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_task_runs_and_stops() {
        let store = SessionStore::new(Duration::milliseconds(10));
        store.create_session("U1");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_session_sweep(
            store.clone(),
            std::time::Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(store.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
