//! Durable record of collection attempts.
//!
//! Transitions are guarded in SQL: `pending → running → completed`, and
//! `pending | running → failed`. Terminal rows never change.

use crate::db::{parse_timestamp, Database};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(unreadable_column(3, format!("unknown job status '{}'", other))),
        }
    }
}

/// What triggered the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Daily,
    OnDemand,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Daily => "daily",
            JobType::OnDemand => "on_demand",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "daily" => Ok(JobType::Daily),
            "on_demand" => Ok(JobType::OnDemand),
            other => Err(unreadable_column(2, format!("unknown job type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionJob {
    pub id: i64,
    pub owner_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub data_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, owner_id, job_type, status, started_at, completed_at, \
                           error_message, data_date, created_at";

#[derive(Clone)]
pub struct JobLedger {
    db: Database,
}

impl JobLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a new job in `pending`. Returns its id.
    pub fn create_pending(&self, owner_id: &str, job_type: JobType, data_date: NaiveDate) -> Result<i64> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO collection_jobs (owner_id, job_type, status, data_date, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![
                owner_id,
                job_type.as_str(),
                data_date.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(job_id = id, owner_id = %owner_id, job_type = job_type.as_str(), "Job pending");
        Ok(id)
    }

    /// `pending → running`. Fails if the job is in any other state.
    pub fn mark_running(&self, job_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE collection_jobs SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![job_id, Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        self.expect_transition(job_id, updated, JobStatus::Running)
    }

    pub fn mark_completed(&self, job_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE collection_jobs SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![job_id, Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        self.expect_transition(job_id, updated, JobStatus::Completed)
    }

    pub fn mark_failed(&self, job_id: i64, error_message: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE collection_jobs SET status = 'failed', completed_at = ?2, error_message = ?3
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![job_id, Utc::now().to_rfc3339(), error_message],
        )?;
        drop(conn);
        self.expect_transition(job_id, updated, JobStatus::Failed)
    }

    fn expect_transition(&self, job_id: i64, updated: usize, target: JobStatus) -> Result<()> {
        if updated == 1 {
            return Ok(());
        }
        let current = self.get(job_id)?.map(|job| job.status);
        warn!(job_id = job_id, target = target.as_str(), current = ?current, "Rejected job transition");
        Err(Error::Config(format!(
            "job {} cannot move to {} from {}",
            job_id,
            target.as_str(),
            current.map(|s| s.as_str()).unwrap_or("missing")
        )))
    }

    pub fn get(&self, job_id: i64) -> Result<Option<CollectionJob>> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM collection_jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                read_row,
            )
            .optional()?;
        raw.map(into_job).transpose()
    }

    /// Newest jobs for an owner.
    pub fn recent_jobs(&self, owner_id: &str, limit: usize) -> Result<Vec<CollectionJob>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM collection_jobs WHERE owner_id = ?1 ORDER BY id DESC LIMIT ?2",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![owner_id, limit as i64], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_job).collect()
    }

    /// Failed jobs created at or after `since`, across all owners.
    pub fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<CollectionJob>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM collection_jobs WHERE status = 'failed' AND created_at >= ?1 ORDER BY id DESC",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_job).collect()
    }

    /// Fails every non-terminal job with `reason`. Returns how many changed.
    pub fn fail_running(&self, reason: &str) -> Result<usize> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE collection_jobs SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE status IN ('pending', 'running')",
            params![Utc::now().to_rfc3339(), reason],
        )?;
        if updated > 0 {
            info!(jobs = updated, reason = %reason, "Failed unfinished collection jobs");
        }
        Ok(updated)
    }
}

type RawJob = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

/// A stored value this build cannot interpret; reported as a storage fault.
fn unreadable_column(index: usize, message: String) -> Error {
    Error::Storage(rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    ))
}

fn into_job(raw: RawJob) -> Result<CollectionJob> {
    let (id, owner_id, job_type, status, started_at, completed_at, error_message, data_date, created_at) = raw;
    let data_date = data_date
        .parse::<NaiveDate>()
        .map_err(|e| unreadable_column(7, e.to_string()))?;

    Ok(CollectionJob {
        id,
        owner_id,
        job_type: JobType::parse(&job_type)?,
        status: JobStatus::parse(&status)?,
        started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        error_message,
        data_date,
        created_at: parse_timestamp(&created_at)?,
    })
}
