//! Daily-path batch runner.
//!
//! Owners are split into fixed-size batches that run one after another.
//! Within a batch, owners run concurrently, bounded by the shared worker
//! semaphore. A failure is recorded on that owner's job and never stops
//! the batch.

use crate::collector::{Collector, SHUTDOWN_REASON};
use creatorsync::ledger::{JobStatus, JobType};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    /// Owners not run: already in flight, dispatch error, or shutdown
    pub skipped: usize,
}

impl BatchSummary {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            _ => self.failed += 1,
        }
    }
}

/// Runs `owners` in batches of `batch_size`. Returns once every dispatched
/// job is terminal.
pub async fn run_batches(
    collector: Arc<Collector>,
    owners: Vec<String>,
    job_type: JobType,
    batch_size: usize,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    let batch_size = batch_size.max(1);
    let total_batches = owners.len().div_ceil(batch_size);

    info!(owners = owners.len(), batches = total_batches, "Collection run starting");

    for (index, batch) in owners.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            let remaining = owners.len() - index * batch_size;
            warn!(remaining = remaining, "Collection run cancelled, skipping remaining owners");
            summary.skipped += remaining;
            break;
        }

        let mut tasks = JoinSet::new();
        for owner_id in batch {
            let claim = match collector.dispatch(owner_id, job_type) {
                Ok(Some(claim)) => claim,
                Ok(None) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(owner_id = %owner_id, error = %e, "Failed to dispatch collection job");
                    summary.skipped += 1;
                    continue;
                }
            };

            let collector = Arc::clone(&collector);
            let workers = Arc::clone(&workers);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = workers.acquire_owned() => permit.ok(),
                };
                match permit {
                    Some(_permit) => collector.execute(claim, &cancel).await,
                    None => {
                        // Never got a worker slot; close the pending row
                        if let Err(e) = collector.ledger().mark_failed(claim.job_id(), SHUTDOWN_REASON) {
                            error!(job_id = claim.job_id(), error = %e, "Failed to record job failure");
                        }
                        JobStatus::Failed
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) => summary.record(status),
                Err(e) => {
                    // The job row stays non-terminal; Stop() or the next startup fails it
                    error!(error = %e, "Collection task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            batch = index + 1,
            batches = total_batches,
            completed = summary.completed,
            failed = summary.failed,
            "Collection batch finished"
        );
    }

    info!(
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        "Collection run finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::Harness;

    #[tokio::test]
    async fn test_one_owner_failure_does_not_abort_batch() {
        let h = Harness::new();
        h.connect("u1", "E1");
        h.connect("u2", "E2");
        h.connect("u3", "E3");
        h.platform.fail_broadcaster("E2");

        let summary = run_batches(
            Arc::clone(&h.collector),
            vec!["u1".to_string(), "u2".to_string(), "u3".to_string()],
            JobType::Daily,
            10,
            Arc::new(Semaphore::new(4)),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(summary, BatchSummary { completed: 2, failed: 1, skipped: 0 });
        for (owner, expected) in [
            ("u1", JobStatus::Completed),
            ("u2", JobStatus::Failed),
            ("u3", JobStatus::Completed),
        ] {
            let jobs = h.ledger.recent_jobs(owner, 1).unwrap();
            assert_eq!(jobs[0].status, expected, "owner {}", owner);
        }
        assert!(h.ledger.recent_jobs("u2", 1).unwrap()[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_batches_respect_size_and_worker_cap() {
        let h = Harness::new();
        let owners: Vec<String> = (0..5).map(|i| format!("u{}", i)).collect();
        for (i, owner) in owners.iter().enumerate() {
            h.connect(owner, &format!("E{}", i));
        }

        let summary = run_batches(
            Arc::clone(&h.collector),
            owners.clone(),
            JobType::Daily,
            2,
            Arc::new(Semaphore::new(1)),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(summary.completed, 5);
        for owner in &owners {
            assert!(h.analytics.latest_snapshot(owner).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_running_jobs() {
        let h = Harness::new();
        h.connect("u1", "E1");
        h.connect("u2", "E2");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_batches(
            Arc::clone(&h.collector),
            vec!["u1".to_string(), "u2".to_string()],
            JobType::Daily,
            1,
            Arc::new(Semaphore::new(1)),
            cancel,
        )
        .await;

        assert_eq!(summary.skipped, 2);
        assert_eq!(h.ledger.fail_running("unused").unwrap(), 0);
    }
}
