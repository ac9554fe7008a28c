//! Token refresher: keeps stored credentials usable.
//!
//! Wraps the vault and the provider's token exchange. A refresh never
//! changes which external account an owner is linked to, and any refresh
//! failure is terminal for the credential.

use crate::config::RefreshConfig;
use crate::credentials::{CredentialVault, OAuthToken, StoredCredential};
use crate::error::{Error, Result};
use crate::oauth::TokenExchange;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TokenRefresher {
    vault: Arc<CredentialVault>,
    exchange: Arc<dyn TokenExchange>,
    leeway: Duration,
    timeout: std::time::Duration,
}

impl TokenRefresher {
    pub fn new(
        vault: Arc<CredentialVault>,
        exchange: Arc<dyn TokenExchange>,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            vault,
            exchange,
            leeway: Duration::seconds(config.leeway_seconds),
            timeout: std::time::Duration::from_secs(config.timeout_seconds),
        }
    }

    /// How close to expiry a token may get before it is refreshed.
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Returns a currently valid access token for the owner.
    ///
    /// # Errors
    /// - [`Error::CredentialNotFound`] if the owner never connected
    /// - [`Error::ReauthRequired`] if the stored token could not be refreshed
    pub async fn get_valid_token(&self, owner_id: &str) -> Result<OAuthToken> {
        self.vault.get_valid_token(owner_id, self).await
    }

    /// Valid token together with the external account it belongs to.
    pub async fn get_valid_credential(&self, owner_id: &str) -> Result<StoredCredential> {
        self.vault.get_valid_credential(owner_id, self).await
    }

    /// Exchanges the stored refresh token and persists the result if it changed.
    pub(crate) async fn refresh(&self, stored: &StoredCredential) -> Result<StoredCredential> {
        let owner_id = stored.owner_id.as_str();

        let fresh = match self.exchange_refresh(stored).await {
            Ok(token) => token,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Token refresh failed, invalidating credential");
                self.vault
                    .invalidate_credential(owner_id, &stored.external_account_id)?;
                return Err(match e {
                    Error::ReauthRequired { .. } => e,
                    other => Error::reauth(owner_id, other.to_string()),
                });
            }
        };

        if fresh.same_secrets(&stored.token) {
            debug!(owner_id = %owner_id, "Refresh returned the stored token, nothing to persist");
            return Ok(StoredCredential {
                token: fresh,
                ..stored.clone()
            });
        }

        let persisted =
            self.vault
                .store_refreshed_tokens(owner_id, &stored.external_account_id, &fresh)?;

        if !persisted {
            // Relinked while the refresh was in flight; the new credential wins.
            warn!(owner_id = %owner_id, "Credential changed during refresh, discarding refreshed token");
            return self.vault.get_stored_tokens(owner_id);
        }

        info!(
            owner_id = %owner_id,
            expires_at = ?fresh.expires_at,
            rotated_refresh_token = fresh.refresh_token != stored.token.refresh_token,
            "OAuth token refreshed"
        );

        Ok(StoredCredential {
            token: fresh,
            updated_at: Utc::now(),
            ..stored.clone()
        })
    }

    async fn exchange_refresh(&self, stored: &StoredCredential) -> Result<OAuthToken> {
        let refresh_token = stored
            .token
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::reauth(&stored.owner_id, "no refresh token stored"))?;

        let mut fresh = tokio::time::timeout(self.timeout, self.exchange.refresh(refresh_token))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        // Keep the existing refresh token if the provider did not rotate it
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = stored.token.refresh_token.clone();
        }
        if fresh.scopes.is_empty() {
            fresh.scopes = stored.token.scopes.clone();
        }

        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsStore;
    use crate::cache::{AnalyticsCache, CachePolicy};
    use crate::credentials::{purge_channel, EncryptionKey};
    use crate::db::Database;
    use crate::testing::FakeTokenExchange;

    fn setup(exchange: Arc<FakeTokenExchange>) -> (Database, TokenRefresher) {
        let db = Database::in_memory().unwrap();
        let (queue, _worker) = purge_channel(
            AnalyticsStore::new(db.clone()),
            AnalyticsCache::new(db.clone(), CachePolicy::default()),
        );
        let key = EncryptionKey::from_bytes(&[3u8; 32]).unwrap();
        let vault = Arc::new(CredentialVault::new(db.clone(), key, queue));
        let refresher = TokenRefresher::new(vault, exchange, &RefreshConfig::default());
        (db, refresher)
    }

    fn token(access: &str, expires_in_secs: i64) -> OAuthToken {
        OAuthToken {
            access_token: access.to_string(),
            refresh_token: Some(format!("{}-refresh", access)),
            scopes: vec!["channel:read:subscriptions".to_string()],
            expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
        }
    }

    fn raw_access_ciphertext(db: &Database) -> String {
        db.conn()
            .unwrap()
            .query_row("SELECT encrypted_access_token FROM stored_credentials", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_credential_is_not_found() {
        let (_db, refresher) = setup(Arc::new(FakeTokenExchange::new()));

        let result = refresher.get_valid_token("U1").await;
        assert!(matches!(result, Err(Error::CredentialNotFound { .. })));
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_network() {
        let exchange = Arc::new(FakeTokenExchange::new());
        let (_db, refresher) = setup(Arc::clone(&exchange));
        refresher
            .vault()
            .store_tokens("U1", "E1", &token("a", 3600))
            .unwrap();

        let valid = refresher.get_valid_token("U1").await.unwrap();
        assert_eq!(valid.access_token, "a");
        assert_eq!(exchange.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let exchange = Arc::new(FakeTokenExchange::new());
        exchange.set_refresh_result(Ok(token("b", 14_400)));
        let (db, refresher) = setup(Arc::clone(&exchange));

        refresher
            .vault()
            .store_tokens("U1", "E1", &token("a", 60))
            .unwrap();
        let before = raw_access_ciphertext(&db);

        let valid = refresher.get_valid_token("U1").await.unwrap();
        assert_eq!(valid.access_token, "b");
        assert_eq!(exchange.refresh_calls(), 1);

        let after = raw_access_ciphertext(&db);
        assert_ne!(before, after);

        let stored = refresher.vault().get_stored_tokens("U1").unwrap();
        assert_eq!(stored.token.access_token, "b");
        assert_eq!(stored.token.refresh_token.as_deref(), Some("b-refresh"));
        assert_eq!(stored.external_account_id, "E1");
    }

    #[tokio::test]
    async fn test_refreshed_credential_keeps_account() {
        let exchange = Arc::new(FakeTokenExchange::new());
        exchange.set_refresh_result(Ok(token("b", 14_400)));
        let (_db, refresher) = setup(Arc::clone(&exchange));

        refresher
            .vault()
            .store_tokens("U1", "E1", &token("a", 60))
            .unwrap();

        let credential = refresher.get_valid_credential("U1").await.unwrap();
        assert_eq!(credential.external_account_id, "E1");
        assert_eq!(credential.token.access_token, "b");
    }

    #[tokio::test]
    async fn test_unrotated_refresh_token_is_kept() {
        let exchange = Arc::new(FakeTokenExchange::new());
        let mut renewed = token("b", 14_400);
        renewed.refresh_token = None;
        exchange.set_refresh_result(Ok(renewed));
        let (_db, refresher) = setup(Arc::clone(&exchange));

        refresher
            .vault()
            .store_tokens("U1", "E1", &token("a", 30))
            .unwrap();
        refresher.get_valid_token("U1").await.unwrap();

        let stored = refresher.vault().get_stored_tokens("U1").unwrap();
        assert_eq!(stored.token.refresh_token.as_deref(), Some("a-refresh"));
    }

    #[tokio::test]
    async fn test_refresh_failure_requires_reauth_and_deletes() {
        let exchange = Arc::new(FakeTokenExchange::new());
        exchange.set_refresh_result(Err("invalid_grant".to_string()));
        let (_db, refresher) = setup(Arc::clone(&exchange));

        refresher
            .vault()
            .store_tokens("U1", "E1", &token("a", -5))
            .unwrap();

        let result = refresher.get_valid_token("U1").await;
        assert!(matches!(result, Err(Error::ReauthRequired { .. })));

        // Subsequent calls fail fast instead of retrying the dead token
        let again = refresher.get_valid_token("U1").await;
        assert!(matches!(again, Err(Error::CredentialNotFound { .. })));
        assert_eq!(exchange.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_requires_reauth() {
        let exchange = Arc::new(FakeTokenExchange::new());
        let (_db, refresher) = setup(Arc::clone(&exchange));

        let mut expiring = token("a", 10);
        expiring.refresh_token = None;
        refresher.vault().store_tokens("U1", "E1", &expiring).unwrap();

        let result = refresher.get_valid_token("U1").await;
        assert!(matches!(result, Err(Error::ReauthRequired { .. })));
        assert_eq!(exchange.refresh_calls(), 0);
    }
}
