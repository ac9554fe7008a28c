//! One collection attempt for one owner.
//!
//! The ledger row is created at dispatch (`pending`), moved to `running`
//! once a worker slot is held, and always ends `completed` or `failed`.

use crate::jitter::Jitter;
use chrono::Utc;
use creatorsync::analytics::{AnalyticsStore, ChannelDaily};
use creatorsync::cache::AnalyticsCache;
use creatorsync::ledger::{JobLedger, JobStatus, JobType};
use creatorsync::platform::PlatformApi;
use creatorsync::refresh::TokenRefresher;
use creatorsync::{Error, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ledger message for jobs interrupted by shutdown.
pub const SHUTDOWN_REASON: &str = "collection manager shut down before job finished";

pub struct Collector {
    refresher: Arc<TokenRefresher>,
    platform: Arc<dyn PlatformApi>,
    ledger: JobLedger,
    analytics: AnalyticsStore,
    cache: AnalyticsCache,
    jitter: Jitter,
    call_timeout: Duration,
    /// Owners with a job between dispatch and its terminal state
    in_flight: Arc<DashMap<String, i64>>,
}

/// Exclusive right to run one job for an owner. Released on drop.
pub struct Claim {
    in_flight: Arc<DashMap<String, i64>>,
    owner_id: String,
    job_id: i64,
}

impl Claim {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.owner_id);
    }
}

impl Collector {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        platform: Arc<dyn PlatformApi>,
        ledger: JobLedger,
        analytics: AnalyticsStore,
        cache: AnalyticsCache,
        jitter: Jitter,
        call_timeout: Duration,
    ) -> Self {
        Self {
            refresher,
            platform,
            ledger,
            analytics,
            cache,
            jitter,
            call_timeout,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    /// Owners with a job in flight.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Records a `pending` job and claims the owner.
    ///
    /// Returns `Ok(None)` when the owner already has a job in flight.
    pub fn dispatch(&self, owner_id: &str, job_type: JobType) -> Result<Option<Claim>> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(owner_id.to_string()) {
            Entry::Occupied(existing) => {
                debug!(owner_id = %owner_id, job_id = *existing.get(), "Collection already in flight, skipping");
                Ok(None)
            }
            Entry::Vacant(slot) => {
                let job_id =
                    self.ledger
                        .create_pending(owner_id, job_type, Utc::now().date_naive())?;
                slot.insert(job_id);
                Ok(Some(Claim {
                    in_flight: Arc::clone(&self.in_flight),
                    owner_id: owner_id.to_string(),
                    job_id,
                }))
            }
        }
    }

    /// Runs a dispatched job to a terminal state. Never returns an error:
    /// every failure is recorded on the job.
    pub async fn execute(&self, claim: Claim, cancel: &CancellationToken) -> JobStatus {
        let job_id = claim.job_id;
        let owner_id = claim.owner_id.clone();

        if cancel.is_cancelled() {
            self.record_failure(job_id, &owner_id, SHUTDOWN_REASON);
            return JobStatus::Failed;
        }

        if let Err(e) = self.ledger.mark_running(job_id) {
            error!(job_id = job_id, owner_id = %owner_id, error = %e, "Failed to mark job running");
            self.record_failure(job_id, &owner_id, &e.to_string());
            return JobStatus::Failed;
        }
        debug!(job_id = job_id, owner_id = %owner_id, "Job running");

        let started = std::time::Instant::now();
        let result = self.collect(&owner_id, cancel).await;

        match result {
            Ok(()) => match self.ledger.mark_completed(job_id) {
                Ok(()) => {
                    info!(
                        job_id = job_id,
                        owner_id = %owner_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Collection job completed"
                    );
                    JobStatus::Completed
                }
                Err(e) => {
                    error!(job_id = job_id, owner_id = %owner_id, error = %e, "Failed to mark job completed");
                    JobStatus::Failed
                }
            },
            Err(e) => {
                let message = match &e {
                    Error::Cancelled(_) => SHUTDOWN_REASON.to_string(),
                    other => other.to_string(),
                };
                self.record_failure(job_id, &owner_id, &message);
                JobStatus::Failed
            }
        }
    }

    fn record_failure(&self, job_id: i64, owner_id: &str, message: &str) {
        warn!(job_id = job_id, owner_id = %owner_id, error = %message, "Collection job failed");
        if let Err(e) = self.ledger.mark_failed(job_id, message) {
            error!(job_id = job_id, owner_id = %owner_id, error = %e, "Failed to record job failure");
        }
    }

    async fn collect(&self, owner_id: &str, cancel: &CancellationToken) -> Result<()> {
        // Token and account id come from the same row
        let credential = self
            .guarded(cancel, self.refresher.get_valid_credential(owner_id))
            .await?;
        let broadcaster_id = credential.external_account_id.as_str();
        let access_token = credential.token.access_token.as_str();
        let platform = self.platform.as_ref();

        let channel = self
            .guarded(cancel, platform.get_channel_info(access_token, broadcaster_id))
            .await?;
        let followers = self
            .guarded(cancel, platform.get_follower_count(access_token, broadcaster_id))
            .await?;
        let subscribers = self
            .guarded(cancel, platform.get_subscribers(access_token, broadcaster_id))
            .await?;
        let videos = self
            .guarded(cancel, platform.get_videos(access_token, broadcaster_id))
            .await?;

        let snapshot = ChannelDaily::from_parts(channel, followers, subscribers, videos)
            .into_snapshot(owner_id, Utc::now().date_naive())?;
        if !self
            .analytics
            .write_snapshot_if_linked(&snapshot, broadcaster_id)?
        {
            return Err(Error::account_switched(owner_id));
        }

        if let Err(e) = self.cache.invalidate_owner(owner_id) {
            warn!(owner_id = %owner_id, error = %e, "Failed to invalidate cache after collection");
        }
        Ok(())
    }

    /// Jitter, then the call under the per-call timeout; cancellation wins.
    async fn guarded<T, E, F>(&self, cancel: &CancellationToken, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        Error: From<E>,
    {
        if !self.jitter.sleep(cancel).await {
            return Err(Error::Cancelled(SHUTDOWN_REASON.to_string()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(SHUTDOWN_REASON.to_string())),
            outcome = tokio::time::timeout(self.call_timeout, call) => match outcome {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Timeout(self.call_timeout)),
            },
        }
    }
}
