//! Encrypted credential storage using SQLite.
//!
//! Stores exactly zero or one credential per owner id. The external account
//! id is unique across owners: connecting an account already claimed by a
//! different owner removes that owner's row first.

use super::purge::{PurgeQueue, PurgeReason};
use super::{encryption, ConnectionStatus, EncryptionKey, OAuthToken, StoredCredential};
use crate::db::{parse_timestamp, Database};
use crate::error::{Error, Result};
use crate::refresh::TokenRefresher;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info, warn};

/// What [`CredentialVault::store_tokens`] changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    /// No credential existed for the owner before this call
    pub created: bool,
    /// The owner was previously linked to a different external account
    pub is_switch: bool,
    /// Other owners whose rows claimed the same external account and were removed
    pub displaced_owners: Vec<String>,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE stored_credentials (
///     owner_id TEXT PRIMARY KEY,
///     external_account_id TEXT NOT NULL UNIQUE,
///     encrypted_access_token TEXT NOT NULL,   -- base64(nonce || ct || tag)
///     encrypted_refresh_token TEXT,           -- same format (optional)
///     scopes TEXT NOT NULL,                   -- space separated
///     expires_at TEXT,                        -- RFC 3339 (optional)
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
pub struct CredentialVault {
    db: Database,
    encryption_key: EncryptionKey,
    purge: PurgeQueue,
}

impl CredentialVault {
    pub fn new(db: Database, encryption_key: EncryptionKey, purge: PurgeQueue) -> Self {
        Self {
            db,
            encryption_key,
            purge,
        }
    }

    /// Encrypts and upserts the owner's credential.
    ///
    /// A change of external account for the same owner is an account switch:
    /// the owner's analytics and cache rows are purged in the background.
    /// The purge never delays or fails this call.
    pub fn store_tokens(
        &self,
        owner_id: &str,
        external_account_id: &str,
        token: &OAuthToken,
    ) -> Result<StoreOutcome> {
        let encrypted_access = encryption::encrypt(&token.access_token, &self.encryption_key)
            .map_err(|e| {
                error!(owner_id = %owner_id, error = %e, "Failed to encrypt access token");
                e
            })?;
        let encrypted_refresh = token
            .refresh_token
            .as_deref()
            .map(|t| encryption::encrypt(t, &self.encryption_key))
            .transpose()
            .map_err(|e| {
                error!(owner_id = %owner_id, error = %e, "Failed to encrypt refresh token");
                e
            })?;

        let scopes = token.scopes.join(" ");
        let expires_at = token.expires_at.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT external_account_id FROM stored_credentials WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;

        let displaced_owners = {
            let mut stmt = tx.prepare(
                "SELECT owner_id FROM stored_credentials WHERE external_account_id = ?1 AND owner_id != ?2",
            )?;
            let owners = stmt
                .query_map(params![external_account_id, owner_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            owners
        };

        if !displaced_owners.is_empty() {
            tx.execute(
                "DELETE FROM stored_credentials WHERE external_account_id = ?1 AND owner_id != ?2",
                params![external_account_id, owner_id],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO stored_credentials (
                owner_id, external_account_id,
                encrypted_access_token, encrypted_refresh_token,
                scopes, expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(owner_id) DO UPDATE SET
                external_account_id = excluded.external_account_id,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                scopes = excluded.scopes,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                owner_id,
                external_account_id,
                encrypted_access,
                encrypted_refresh,
                scopes,
                expires_at,
                now,
                now,
            ],
        )?;

        tx.commit()?;
        drop(conn);

        let is_switch = matches!(&previous, Some(prev) if prev != external_account_id);
        let outcome = StoreOutcome {
            created: previous.is_none(),
            is_switch,
            displaced_owners,
        };

        for displaced in &outcome.displaced_owners {
            warn!(
                owner_id = %displaced,
                new_owner_id = %owner_id,
                external_account_id = %external_account_id,
                "External account reassigned to a different owner, removed previous credential"
            );
            self.purge.submit(displaced, PurgeReason::Reassigned);
        }

        if outcome.is_switch {
            info!(
                owner_id = %owner_id,
                previous_account = previous.as_deref().unwrap_or_default(),
                external_account_id = %external_account_id,
                "Account switch detected, purging previous analytics"
            );
            self.purge.submit(owner_id, PurgeReason::AccountSwitch);
        }

        debug!(
            owner_id = %owner_id,
            created = outcome.created,
            has_refresh_token = token.refresh_token.is_some(),
            "Stored credential"
        );

        Ok(outcome)
    }

    /// Loads and decrypts the owner's credential.
    pub fn get_stored_tokens(&self, owner_id: &str) -> Result<StoredCredential> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT external_account_id, encrypted_access_token, encrypted_refresh_token,
                       scopes, expires_at, created_at, updated_at
                FROM stored_credentials
                WHERE owner_id = ?1
                "#,
                params![owner_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let (external_account_id, access, refresh, scopes, expires_at, created_at, updated_at) =
            row.ok_or_else(|| Error::not_found(owner_id))?;

        let access_token = encryption::decrypt(&access, &self.encryption_key).map_err(|e| {
            error!(owner_id = %owner_id, error = %e, "Failed to decrypt access token");
            e
        })?;
        let refresh_token = refresh
            .map(|r| encryption::decrypt(&r, &self.encryption_key))
            .transpose()
            .map_err(|e| {
                error!(owner_id = %owner_id, error = %e, "Failed to decrypt refresh token");
                e
            })?;

        Ok(StoredCredential {
            owner_id: owner_id.to_string(),
            external_account_id,
            token: OAuthToken {
                access_token,
                refresh_token,
                scopes: split_scopes(&scopes),
                expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
            },
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    /// Returns a usable access token for the owner.
    ///
    /// Tokens outside the refresh window are returned as stored. Otherwise
    /// the refresher renews them; if that fails the credential is removed
    /// and the caller gets [`Error::ReauthRequired`].
    pub async fn get_valid_token(
        &self,
        owner_id: &str,
        refresher: &TokenRefresher,
    ) -> Result<OAuthToken> {
        self.get_valid_credential(owner_id, refresher)
            .await
            .map(|credential| credential.token)
    }

    /// Like [`CredentialVault::get_valid_token`], but keeps the token paired
    /// with the external account it was issued for.
    pub async fn get_valid_credential(
        &self,
        owner_id: &str,
        refresher: &TokenRefresher,
    ) -> Result<StoredCredential> {
        let stored = self.get_stored_tokens(owner_id)?;

        if !stored.token.needs_refresh(Utc::now(), refresher.leeway()) {
            return Ok(stored);
        }

        refresher.refresh(&stored).await
    }

    /// Persists a refreshed token pair without touching the account link.
    ///
    /// Only updates the row while it still points at `external_account_id`;
    /// returns `false` if the owner was relinked in the meantime.
    pub fn store_refreshed_tokens(
        &self,
        owner_id: &str,
        external_account_id: &str,
        token: &OAuthToken,
    ) -> Result<bool> {
        let encrypted_access = encryption::encrypt(&token.access_token, &self.encryption_key)?;
        let encrypted_refresh = token
            .refresh_token
            .as_deref()
            .map(|t| encryption::encrypt(t, &self.encryption_key))
            .transpose()?;

        let rows = self.db.conn()?.execute(
            r#"
            UPDATE stored_credentials SET
                encrypted_access_token = ?3,
                encrypted_refresh_token = ?4,
                scopes = ?5,
                expires_at = ?6,
                updated_at = ?7
            WHERE owner_id = ?1 AND external_account_id = ?2
            "#,
            params![
                owner_id,
                external_account_id,
                encrypted_access,
                encrypted_refresh,
                token.scopes.join(" "),
                token.expires_at.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(rows > 0)
    }

    /// Disconnect: hard delete followed by the same purge as a switch.
    ///
    /// Returns `false` when there was nothing to delete; the purge is
    /// queued either way so stale analytics never outlive a disconnect.
    pub fn delete_stored_tokens(&self, owner_id: &str) -> Result<bool> {
        let deleted = self.remove_credential(owner_id)?;
        self.purge.submit(owner_id, PurgeReason::Disconnect);

        info!(owner_id = %owner_id, deleted = deleted, "Credential disconnected");
        Ok(deleted)
    }

    /// Deletes the row without purging derived data.
    fn remove_credential(&self, owner_id: &str) -> Result<bool> {
        let rows = self.db.conn()?.execute(
            "DELETE FROM stored_credentials WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(rows > 0)
    }

    /// Invalidates a dead credential after a failed refresh.
    ///
    /// Scoped to the account that failed so a concurrent reconnect survives.
    pub fn invalidate_credential(&self, owner_id: &str, external_account_id: &str) -> Result<bool> {
        let rows = self.db.conn()?.execute(
            "DELETE FROM stored_credentials WHERE owner_id = ?1 AND external_account_id = ?2",
            params![owner_id, external_account_id],
        )?;
        Ok(rows > 0)
    }

    /// Connection summary without decrypting anything.
    pub fn connection_status(&self, owner_id: &str) -> Result<ConnectionStatus> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT external_account_id, scopes, expires_at, updated_at FROM stored_credentials WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((external_account_id, scopes, expires_at, updated_at)) => Ok(ConnectionStatus {
                connected: true,
                external_account_id: Some(external_account_id),
                scopes: split_scopes(&scopes),
                expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
                updated_at: Some(parse_timestamp(&updated_at)?),
            }),
            None => Ok(ConnectionStatus::disconnected()),
        }
    }

    /// Lists every owner holding a credential.
    ///
    /// Used by the daily collection path.
    pub fn list_owners(&self) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT owner_id FROM stored_credentials ORDER BY owner_id")?;
        let owners = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(owners)
    }
}

fn split_scopes(scopes: &str) -> Vec<String> {
    scopes.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AnalyticsSnapshot, AnalyticsStore};
    use crate::cache::{AnalyticsCache, CachePolicy};
    use crate::credentials::purge_channel;
    use crate::credentials::PurgeStats;
    use chrono::{Duration, NaiveDate};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        db: Database,
        vault: CredentialVault,
        analytics: AnalyticsStore,
        cache: AnalyticsCache,
        stats: Arc<PurgeStats>,
        _cancel: tokio_util::sync::DropGuard,
    }

    fn create_fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let analytics = AnalyticsStore::new(db.clone());
        let cache = AnalyticsCache::new(db.clone(), CachePolicy::default());
        let (queue, worker) = purge_channel(analytics.clone(), cache.clone());
        let stats = queue.stats();
        let cancel = CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));

        let key = EncryptionKey::from_bytes(&[0u8; 32]).unwrap();
        Fixture {
            vault: CredentialVault::new(db.clone(), key, queue),
            db,
            analytics,
            cache,
            stats,
            _cancel: cancel.drop_guard(),
        }
    }

    fn create_test_token(access: &str) -> OAuthToken {
        OAuthToken {
            access_token: access.to_string(),
            refresh_token: Some(format!("{}-refresh", access)),
            scopes: vec!["user:read:email".to_string(), "channel:read:subscriptions".to_string()],
            expires_at: Some(Utc::now() + Duration::hours(1)),
        }
    }

    async fn wait_for_purges(stats: &PurgeStats, expected: u64) {
        for _ in 0..200 {
            if stats.completed() >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("purge did not complete in time");
    }

    fn credential_rows(db: &Database) -> i64 {
        db.conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM stored_credentials", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let f = create_fixture();
        let token = create_test_token("access-1");

        let outcome = f.vault.store_tokens("u1", "ext-1", &token).unwrap();
        assert!(outcome.created);
        assert!(!outcome.is_switch);

        let stored = f.vault.get_stored_tokens("u1").unwrap();
        assert_eq!(stored.external_account_id, "ext-1");
        assert_eq!(stored.token, token);
    }

    #[tokio::test]
    async fn test_tokens_are_encrypted_at_rest() {
        let f = create_fixture();
        f.vault
            .store_tokens("u1", "ext-1", &create_test_token("plain-access"))
            .unwrap();

        let raw: String = f
            .db
            .conn()
            .unwrap()
            .query_row("SELECT encrypted_access_token FROM stored_credentials", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("plain-access"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let f = create_fixture();
        assert!(matches!(
            f.vault.get_stored_tokens("u1"),
            Err(Error::CredentialNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_ciphertext_is_encryption_error() {
        let f = create_fixture();
        f.vault
            .store_tokens("u1", "ext-1", &create_test_token("access"))
            .unwrap();
        f.db.conn()
            .unwrap()
            .execute("UPDATE stored_credentials SET encrypted_access_token = 'AAAA'", [])
            .unwrap();

        assert!(matches!(f.vault.get_stored_tokens("u1"), Err(Error::Encryption(_))));
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_owner() {
        let f = create_fixture();
        f.vault.store_tokens("u1", "ext-1", &create_test_token("a")).unwrap();
        let outcome = f.vault.store_tokens("u1", "ext-1", &create_test_token("b")).unwrap();

        assert!(!outcome.created);
        assert!(!outcome.is_switch);
        assert_eq!(credential_rows(&f.db), 1);
        assert_eq!(f.vault.get_stored_tokens("u1").unwrap().token.access_token, "b");
        assert_eq!(f.stats.submitted(), 0);
    }

    #[tokio::test]
    async fn test_account_switch_purges_previous_data() {
        let f = create_fixture();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        f.vault.store_tokens("u1", "E1", &create_test_token("a")).unwrap();
        f.analytics
            .write_snapshot(&AnalyticsSnapshot::sample("u1", date))
            .unwrap();
        f.cache
            .set("u1", "summary", &serde_json::json!({"followers": 10}), Duration::minutes(5))
            .unwrap();

        let outcome = f.vault.store_tokens("u1", "E2", &create_test_token("b")).unwrap();
        assert!(outcome.is_switch);

        // The new association is visible immediately
        assert_eq!(f.vault.get_stored_tokens("u1").unwrap().external_account_id, "E2");

        wait_for_purges(&f.stats, 1).await;
        assert!(f.analytics.latest_snapshot("u1").unwrap().is_none());
        assert!(f.cache.get("u1", "summary").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_external_account_reassigned_between_owners() {
        let f = create_fixture();
        f.vault.store_tokens("u1", "E1", &create_test_token("a")).unwrap();

        let outcome = f.vault.store_tokens("u2", "E1", &create_test_token("b")).unwrap();
        assert_eq!(outcome.displaced_owners, vec!["u1".to_string()]);
        assert!(!outcome.is_switch);

        assert!(matches!(
            f.vault.get_stored_tokens("u1"),
            Err(Error::CredentialNotFound { .. })
        ));
        assert_eq!(f.vault.get_stored_tokens("u2").unwrap().external_account_id, "E1");
        assert_eq!(credential_rows(&f.db), 1);
        wait_for_purges(&f.stats, 1).await;
    }

    #[tokio::test]
    async fn test_delete_stored_tokens() {
        let f = create_fixture();
        f.vault.store_tokens("u1", "E1", &create_test_token("a")).unwrap();
        f.cache
            .set("u1", "summary", &serde_json::json!({}), Duration::minutes(5))
            .unwrap();

        assert!(f.vault.delete_stored_tokens("u1").unwrap());
        assert!(!f.vault.delete_stored_tokens("u1").unwrap());

        assert!(matches!(
            f.vault.get_stored_tokens("u1"),
            Err(Error::CredentialNotFound { .. })
        ));
        wait_for_purges(&f.stats, 2).await;
        assert!(f.cache.get("u1", "summary").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_status_and_list_owners() {
        let f = create_fixture();
        assert_eq!(
            f.vault.connection_status("u1").unwrap(),
            ConnectionStatus::disconnected()
        );

        f.vault.store_tokens("u2", "E2", &create_test_token("a")).unwrap();
        f.vault.store_tokens("u1", "E1", &create_test_token("b")).unwrap();

        let status = f.vault.connection_status("u1").unwrap();
        assert!(status.connected);
        assert_eq!(status.external_account_id.as_deref(), Some("E1"));
        assert_eq!(status.scopes.len(), 2);

        assert_eq!(f.vault.list_owners().unwrap(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_token_without_refresh_or_expiry() {
        let f = create_fixture();
        let token = OAuthToken {
            access_token: "access-only".to_string(),
            refresh_token: None,
            scopes: Vec::new(),
            expires_at: None,
        };
        f.vault.store_tokens("u1", "E1", &token).unwrap();

        let stored = f.vault.get_stored_tokens("u1").unwrap();
        assert_eq!(stored.token, token);
    }
}
