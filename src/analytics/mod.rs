//! Per-owner analytics snapshots written by collection jobs.

use crate::db::{parse_timestamp, Database};
use crate::error::{Error, Result};
use crate::platform::{ChannelInfo, SubscriberSummary, Video};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Snapshot kind written by the daily collection.
pub const CHANNEL_DAILY: &str = "channel_daily";

/// Number of videos kept in the daily summary.
const TOP_VIDEOS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct AnalyticsSnapshot {
    pub owner_id: String,
    pub snapshot_kind: String,
    pub data_date: NaiveDate,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    #[cfg(test)]
    pub fn sample(owner_id: &str, data_date: NaiveDate) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            snapshot_kind: CHANNEL_DAILY.to_string(),
            data_date,
            payload: serde_json::json!({"followers": 1}),
            created_at: Utc::now(),
        }
    }
}

/// Aggregate written under [`CHANNEL_DAILY`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelDaily {
    pub channel: ChannelInfo,
    pub followers: u64,
    pub subscribers: SubscriberSummary,
    pub video_count: usize,
    pub total_video_views: u64,
    pub top_videos: Vec<Video>,
}

impl ChannelDaily {
    /// Assembles the daily aggregate from the four platform reads.
    pub fn from_parts(
        channel: ChannelInfo,
        followers: u64,
        subscribers: SubscriberSummary,
        mut videos: Vec<Video>,
    ) -> Self {
        let video_count = videos.len();
        let total_video_views = videos.iter().map(|v| v.view_count).sum();
        videos.sort_by(|a, b| b.view_count.cmp(&a.view_count));
        videos.truncate(TOP_VIDEOS);

        Self {
            channel,
            followers,
            subscribers,
            video_count,
            total_video_views,
            top_videos: videos,
        }
    }

    pub fn into_snapshot(self, owner_id: &str, data_date: NaiveDate) -> Result<AnalyticsSnapshot> {
        let payload = serde_json::to_value(&self)
            .map_err(|e| Error::Config(format!("failed to serialize snapshot: {}", e)))?;
        Ok(AnalyticsSnapshot {
            owner_id: owner_id.to_string(),
            snapshot_kind: CHANNEL_DAILY.to_string(),
            data_date,
            payload,
            created_at: Utc::now(),
        })
    }
}

/// Owner-partitioned snapshot table.
#[derive(Clone)]
pub struct AnalyticsStore {
    db: Database,
}

impl AnalyticsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or replaces the snapshot for `(owner, kind, date)`.
    pub fn write_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let conn = self.db.conn()?;
        upsert(&conn, snapshot)
    }

    /// Writes the snapshot only while the owner is still linked to
    /// `external_account_id`. Returns `false` (and writes nothing) otherwise.
    ///
    /// The check and the write share one transaction on the locked
    /// connection, so a switch either lands before the check or its purge
    /// runs after the write.
    pub fn write_snapshot_if_linked(
        &self,
        snapshot: &AnalyticsSnapshot,
        external_account_id: &str,
    ) -> Result<bool> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let linked: Option<String> = tx
            .query_row(
                "SELECT external_account_id FROM stored_credentials WHERE owner_id = ?1",
                params![snapshot.owner_id],
                |row| row.get(0),
            )
            .optional()?;

        if linked.as_deref() != Some(external_account_id) {
            debug!(
                owner_id = %snapshot.owner_id,
                expected = %external_account_id,
                linked = linked.as_deref().unwrap_or("none"),
                "Owner relinked since collection started, dropping snapshot"
            );
            return Ok(false);
        }

        upsert(&tx, snapshot)?;
        tx.commit()?;
        Ok(true)
    }

    /// Most recent snapshot of any kind for the owner.
    pub fn latest_snapshot(&self, owner_id: &str) -> Result<Option<AnalyticsSnapshot>> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT owner_id, snapshot_kind, data_date, payload, created_at
                 FROM analytics_snapshots WHERE owner_id = ?1
                 ORDER BY data_date DESC, id DESC LIMIT 1",
                params![owner_id],
                read_row,
            )
            .optional()?;
        row.map(into_snapshot).transpose()
    }

    /// Snapshots for the owner, newest first.
    pub fn list_snapshots(&self, owner_id: &str, limit: usize) -> Result<Vec<AnalyticsSnapshot>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner_id, snapshot_kind, data_date, payload, created_at
             FROM analytics_snapshots WHERE owner_id = ?1
             ORDER BY data_date DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![owner_id, limit as i64], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_snapshot).collect()
    }

    /// Deletes every snapshot for the owner.
    pub fn purge_owner(&self, owner_id: &str) -> Result<usize> {
        let conn = self.db.conn()?;
        let deleted = conn.execute(
            "DELETE FROM analytics_snapshots WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(deleted)
    }
}

fn upsert(conn: &Connection, snapshot: &AnalyticsSnapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO analytics_snapshots (owner_id, snapshot_kind, data_date, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(owner_id, snapshot_kind, data_date) DO UPDATE SET
            payload = excluded.payload,
            created_at = excluded.created_at",
        params![
            snapshot.owner_id,
            snapshot.snapshot_kind,
            snapshot.data_date.to_string(),
            snapshot.payload.to_string(),
            snapshot.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

type RawRow = (String, String, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_snapshot(raw: RawRow) -> Result<AnalyticsSnapshot> {
    let (owner_id, snapshot_kind, data_date, payload, created_at) = raw;
    let conversion = |e: Box<dyn std::error::Error + Send + Sync>| {
        Error::Storage(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e,
        ))
    };

    Ok(AnalyticsSnapshot {
        owner_id,
        snapshot_kind,
        data_date: data_date
            .parse::<NaiveDate>()
            .map_err(|e| conversion(Box::new(e)))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion(Box::new(e)))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformApi;
    use crate::testing::FakePlatform;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn test_write_is_idempotent_per_day() {
        let store = AnalyticsStore::new(Database::in_memory().unwrap());
        let mut snapshot = AnalyticsSnapshot::sample("u1", date(1));
        store.write_snapshot(&snapshot).unwrap();
        snapshot.payload = serde_json::json!({"followers": 2});
        store.write_snapshot(&snapshot).unwrap();

        let all = store.list_snapshots("u1", 10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, serde_json::json!({"followers": 2}));
    }

    fn link(db: &Database, owner_id: &str, external_account_id: &str) {
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO stored_credentials (owner_id, external_account_id, encrypted_access_token,
                     scopes, created_at, updated_at)
                 VALUES (?1, ?2, 'x', '', '2026-03-01T00:00:00Z', '2026-03-01T00:00:00Z')
                 ON CONFLICT(owner_id) DO UPDATE SET external_account_id = excluded.external_account_id",
                params![owner_id, external_account_id],
            )
            .unwrap();
    }

    #[test]
    fn test_conditional_write_requires_current_link() {
        let db = Database::in_memory().unwrap();
        let store = AnalyticsStore::new(db.clone());
        let snapshot = AnalyticsSnapshot::sample("u1", date(1));

        // Never connected
        assert!(!store.write_snapshot_if_linked(&snapshot, "E1").unwrap());

        link(&db, "u1", "E1");
        assert!(store.write_snapshot_if_linked(&snapshot, "E1").unwrap());
        assert_eq!(store.list_snapshots("u1", 10).unwrap().len(), 1);

        link(&db, "u1", "E2");
        store.purge_owner("u1").unwrap();
        assert!(!store.write_snapshot_if_linked(&snapshot, "E1").unwrap());
        assert!(store.latest_snapshot("u1").unwrap().is_none());
    }

    #[test]
    fn test_latest_and_purge() {
        let store = AnalyticsStore::new(Database::in_memory().unwrap());
        store.write_snapshot(&AnalyticsSnapshot::sample("u1", date(1))).unwrap();
        store.write_snapshot(&AnalyticsSnapshot::sample("u1", date(3))).unwrap();
        store.write_snapshot(&AnalyticsSnapshot::sample("u2", date(2))).unwrap();

        let latest = store.latest_snapshot("u1").unwrap().unwrap();
        assert_eq!(latest.data_date, date(3));

        assert_eq!(store.purge_owner("u1").unwrap(), 2);
        assert!(store.latest_snapshot("u1").unwrap().is_none());
        assert_eq!(store.list_snapshots("u2", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_daily_from_platform() {
        let platform = FakePlatform::new();
        let daily = ChannelDaily::from_parts(
            platform.get_channel_info("token", "E1").await.unwrap(),
            platform.get_follower_count("token", "E1").await.unwrap(),
            platform.get_subscribers("token", "E1").await.unwrap(),
            platform.get_videos("token", "E1").await.unwrap(),
        );

        assert_eq!(daily.channel.broadcaster_id, "E1");
        assert_eq!(daily.video_count, 2);
        assert_eq!(daily.top_videos[0].view_count, 30);
        assert_eq!(daily.total_video_views, 40);

        let snapshot = daily.into_snapshot("u1", date(4)).unwrap();
        assert_eq!(snapshot.snapshot_kind, CHANNEL_DAILY);
        assert_eq!(snapshot.payload["followers"], serde_json::json!(FakePlatform::FOLLOWERS));
    }
}
