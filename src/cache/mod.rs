//! Owner-scoped TTL cache for computed analytics payloads.
//!
//! Entries live in `cache_entries` keyed by `(owner_id, cache_key)`. Reads
//! never return an entry at or past its expiry; expired rows are removed by
//! [`AnalyticsCache::purge_expired`] or overwritten on the next `set`.

use crate::config::CacheConfig;
use crate::db::{parse_timestamp, Database};
use crate::error::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, warn};

/// Per-family TTLs, chosen by cache key prefix.
#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub default_ttl: Duration,
    pub summary_ttl: Duration,
    pub enhanced_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_ttl: Duration::seconds(config.default_ttl_seconds),
            summary_ttl: Duration::seconds(config.summary_ttl_seconds),
            enhanced_ttl: Duration::seconds(config.enhanced_ttl_seconds),
        }
    }

    /// TTL for a key: `summary*` and `enhanced_*` families have their own.
    pub fn ttl_for(&self, cache_key: &str) -> Duration {
        if cache_key.starts_with("enhanced_") {
            self.enhanced_ttl
        } else if cache_key.starts_with("summary") {
            self.summary_ttl
        } else {
            self.default_ttl
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsCache {
    db: Database,
    policy: CachePolicy,
}

impl AnalyticsCache {
    pub fn new(db: Database, policy: CachePolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Returns the payload for `(owner_id, cache_key)` if present and unexpired.
    pub fn get(&self, owner_id: &str, cache_key: &str) -> Result<Option<Value>> {
        let conn = self.db.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT payload, expires_at FROM cache_entries
                 WHERE owner_id = ?1 AND cache_key = ?2",
                params![owner_id, cache_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        drop(conn);

        let Some((payload, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = parse_timestamp(&expires_at)?;
        if Utc::now() >= expires_at {
            debug!(owner_id = %owner_id, cache_key = %cache_key, "Cache entry expired");
            return Ok(None);
        }

        match serde_json::from_str(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Treat an unreadable payload as a miss; the next set overwrites it
                warn!(owner_id = %owner_id, cache_key = %cache_key, error = %e, "Discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    /// Stores a payload, replacing any existing entry for the same key.
    pub fn set(&self, owner_id: &str, cache_key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let expires_at = (Utc::now() + ttl).to_rfc3339();
        let payload = value.to_string();

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO cache_entries (owner_id, cache_key, payload, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, cache_key) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at",
            params![owner_id, cache_key, payload, expires_at],
        )?;
        Ok(())
    }

    /// Stores a payload with the TTL the policy assigns to its key family.
    pub fn set_default(&self, owner_id: &str, cache_key: &str, value: &Value) -> Result<()> {
        self.set(owner_id, cache_key, value, self.policy.ttl_for(cache_key))
    }

    /// Removes the owner's entries matching any pattern.
    ///
    /// A pattern ending in `*` matches by prefix; any other pattern is an
    /// exact key. Returns the number of rows removed.
    pub fn invalidate_pattern(&self, owner_id: &str, patterns: &[&str]) -> Result<usize> {
        let conn = self.db.conn()?;
        let mut removed = 0;

        for pattern in patterns {
            removed += match pattern.strip_suffix('*') {
                Some(prefix) => conn.execute(
                    "DELETE FROM cache_entries
                     WHERE owner_id = ?1 AND cache_key LIKE ?2 ESCAPE '\\'",
                    params![owner_id, format!("{}%", escape_like(prefix))],
                )?,
                None => conn.execute(
                    "DELETE FROM cache_entries WHERE owner_id = ?1 AND cache_key = ?2",
                    params![owner_id, pattern],
                )?,
            };
        }

        if removed > 0 {
            debug!(owner_id = %owner_id, removed = removed, "Invalidated cache entries");
        }
        Ok(removed)
    }

    /// Removes every entry for the owner.
    pub fn invalidate_owner(&self, owner_id: &str) -> Result<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(removed)
    }

    /// Deletes expired rows across all owners.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }

    /// Read-through helper: returns the cached value or computes and stores it.
    ///
    /// A failed computation is not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        owner_id: &str,
        cache_key: &str,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.get(owner_id, cache_key)? {
            return Ok(value);
        }

        let value = compute().await?;
        self.set_default(owner_id, cache_key, &value)?;
        Ok(value)
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
