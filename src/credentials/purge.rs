//! Background purge of per-owner analytics and cache rows.
//!
//! The vault never blocks on cleanup: it submits a [`PurgeRequest`] and
//! returns. The [`PurgeWorker`] drains the queue, and its outcome is
//! observable only through logs and [`PurgeStats`].

use crate::analytics::AnalyticsStore;
use crate::cache::AnalyticsCache;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why an owner's derived data is being purged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeReason {
    /// Owner relinked to a different external account
    AccountSwitch,
    /// Owner disconnected
    Disconnect,
    /// Another owner connected this owner's external account
    Reassigned,
}

impl PurgeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeReason::AccountSwitch => "account_switch",
            PurgeReason::Disconnect => "disconnect",
            PurgeReason::Reassigned => "reassigned",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PurgeRequest {
    pub owner_id: String,
    pub reason: PurgeReason,
    pub requested_at: DateTime<Utc>,
}

/// Counters for submitted and finished purges.
#[derive(Debug, Default)]
pub struct PurgeStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl PurgeStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Purges accepted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.submitted()
            .saturating_sub(self.completed() + self.failed())
    }
}

/// Sending half, held by the vault.
#[derive(Clone)]
pub struct PurgeQueue {
    tx: mpsc::UnboundedSender<PurgeRequest>,
    stats: Arc<PurgeStats>,
}

impl PurgeQueue {
    /// Queues a purge. Never fails the caller; a closed queue is logged.
    pub fn submit(&self, owner_id: &str, reason: PurgeReason) {
        let request = PurgeRequest {
            owner_id: owner_id.to_string(),
            reason,
            requested_at: Utc::now(),
        };

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                owner_id = %owner_id,
                reason = reason.as_str(),
                "Purge worker is not running, derived data was not purged"
            );
            return;
        }

        debug!(owner_id = %owner_id, reason = reason.as_str(), "Purge queued");
    }

    pub fn stats(&self) -> Arc<PurgeStats> {
        Arc::clone(&self.stats)
    }
}

/// Receiving half, run as a long-lived task.
pub struct PurgeWorker {
    rx: mpsc::UnboundedReceiver<PurgeRequest>,
    analytics: AnalyticsStore,
    cache: AnalyticsCache,
    stats: Arc<PurgeStats>,
}

/// Creates a connected queue/worker pair.
pub fn purge_channel(analytics: AnalyticsStore, cache: AnalyticsCache) -> (PurgeQueue, PurgeWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(PurgeStats::default());

    let queue = PurgeQueue {
        tx,
        stats: Arc::clone(&stats),
    };
    let worker = PurgeWorker {
        rx,
        analytics,
        cache,
        stats,
    };

    (queue, worker)
}

impl PurgeWorker {
    /// Processes requests until cancelled or every queue handle is dropped.
    ///
    /// Requests already queued when cancellation arrives are still drained.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Purge worker started");

        loop {
            tokio::select! {
                biased;
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(request) = self.rx.recv().await {
                        self.handle(request);
                    }
                    break;
                }
            }
        }

        info!("Purge worker stopped");
    }

    fn handle(&self, request: PurgeRequest) {
        let owner_id = request.owner_id.as_str();
        let result = self
            .analytics
            .purge_owner(owner_id)
            .and_then(|snapshots| self.cache.invalidate_owner(owner_id).map(|entries| (snapshots, entries)));

        match result {
            Ok((snapshots, entries)) => {
                self.stats.completed.fetch_add(1, Ordering::SeqCst);
                info!(
                    owner_id = %owner_id,
                    reason = request.reason.as_str(),
                    snapshots_deleted = snapshots,
                    cache_entries_deleted = entries,
                    queued_ms = (Utc::now() - request.requested_at).num_milliseconds(),
                    "Purged owner analytics"
                );
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    owner_id = %owner_id,
                    reason = request.reason.as_str(),
                    error = %e,
                    "Failed to purge owner analytics"
                );
            }
        }
    }
}
