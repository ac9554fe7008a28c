//! Collection manager: schedules daily runs and serves on-demand requests.
//!
//! # Lifecycle
//! - `start()` spawns the scheduler loop
//! - `trigger()` queues an owner without waiting (HTTP "collect now")
//! - `stop()` cancels, waits `stop_grace_seconds`, then fails any job that
//!   is still not terminal

use crate::batch::{run_batches, BatchSummary};
use crate::collector::{Collector, SHUTDOWN_REASON};
use crate::schedule::DailySchedule;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use creatorsync::api::{CollectionTrigger, TriggerError};
use creatorsync::config::CollectionConfig;
use creatorsync::ledger::JobType;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct CollectionManager {
    collector: Arc<Collector>,
    schedule: DailySchedule,
    batch_size: usize,
    stop_grace: Duration,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl CollectionManager {
    /// `shutdown` is the process-wide token; the manager stops when either
    /// it or [`CollectionManager::stop`] fires.
    pub fn new(
        collector: Arc<Collector>,
        config: &CollectionConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let schedule = DailySchedule::new(config.daily_hour_utc, config.daily_minute_utc)?;
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        Ok(Self {
            collector,
            schedule,
            batch_size: config.batch_size,
            stop_grace: Duration::from_secs(config.stop_grace_seconds),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            cancel: shutdown.child_token(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            scheduler: Mutex::new(None),
        })
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Launches the scheduler loop. Fails if already started.
    pub fn start(&self) -> Result<()> {
        let rx = self
            .queue_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("collection manager lock poisoned"))?
            .take();
        let Some(rx) = rx else {
            bail!("collection manager already started");
        };

        let scheduler = Scheduler {
            collector: Arc::clone(&self.collector),
            schedule: self.schedule,
            batch_size: self.batch_size,
            workers: Arc::clone(&self.workers),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(scheduler.run(rx));

        *self
            .scheduler
            .lock()
            .map_err(|_| anyhow::anyhow!("collection manager lock poisoned"))? = Some(handle);

        info!(
            next_run = %self.schedule.next_after(Utc::now()),
            "Collection manager started"
        );
        Ok(())
    }

    /// Runs the daily path immediately and waits for it.
    pub async fn run_daily(&self) -> Result<BatchSummary> {
        daily_run(&self.collector, self.batch_size, &self.workers, &self.cancel).await
    }

    /// Stops the scheduler and in-flight jobs.
    ///
    /// Returns the number of jobs that had to be failed because they did not
    /// reach a terminal state within the grace period.
    pub async fn stop(&self) -> Result<usize> {
        info!("Stopping collection manager");
        self.cancel.cancel();

        let handle = self
            .scheduler
            .lock()
            .map_err(|_| anyhow::anyhow!("collection manager lock poisoned"))?
            .take();

        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.stop_grace, &mut handle).await {
                Ok(Ok(())) => debug!("Scheduler exited"),
                Ok(Err(e)) => error!(error = %e, "Scheduler task failed"),
                Err(_) => {
                    warn!(
                        grace_seconds = self.stop_grace.as_secs(),
                        "In-flight jobs did not finish in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        let failed = self
            .collector
            .ledger()
            .fail_running(SHUTDOWN_REASON)
            .context("Failed to close unfinished jobs")?;
        info!(jobs_failed = failed, "Collection manager stopped");
        Ok(failed)
    }
}

impl CollectionTrigger for CollectionManager {
    fn trigger(&self, owner_id: &str) -> std::result::Result<(), TriggerError> {
        if self.cancel.is_cancelled() {
            return Err(TriggerError::Stopped);
        }
        match self.queue_tx.try_send(owner_id.to_string()) {
            Ok(()) => {
                debug!(owner_id = %owner_id, "On-demand collection queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(owner_id = %owner_id, "On-demand collection queue full");
                Err(TriggerError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(TriggerError::Stopped),
        }
    }
}

struct Scheduler {
    collector: Arc<Collector>,
    schedule: DailySchedule,
    batch_size: usize,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(self, mut rx: mpsc::Receiver<String>) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let wait = self.schedule.wait_from(Utc::now());

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Collection task panicked");
                    }
                }
                request = rx.recv() => match request {
                    Some(owner_id) => self.spawn_on_demand(&mut tasks, owner_id),
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {
                    info!("Daily collection triggered");
                    let collector = Arc::clone(&self.collector);
                    let workers = Arc::clone(&self.workers);
                    let cancel = self.cancel.clone();
                    let batch_size = self.batch_size;
                    tasks.spawn(async move {
                        if let Err(e) = daily_run(&collector, batch_size, &workers, &cancel).await {
                            error!(error = %e, "Daily collection run failed");
                        }
                    });
                }
            }
        }

        rx.close();
        info!(in_flight = tasks.len(), "Scheduler stopping, waiting for in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Collection task panicked");
            }
        }
    }

    fn spawn_on_demand(&self, tasks: &mut JoinSet<()>, owner_id: String) {
        let claim = match self.collector.dispatch(&owner_id, JobType::OnDemand) {
            Ok(Some(claim)) => claim,
            Ok(None) => return,
            Err(e) => {
                error!(owner_id = %owner_id, error = %e, "Failed to dispatch on-demand job");
                return;
            }
        };

        let collector = Arc::clone(&self.collector);
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = workers.acquire_owned() => permit.ok(),
            };
            match permit {
                Some(_permit) => {
                    collector.execute(claim, &cancel).await;
                }
                None => {
                    if let Err(e) = collector.ledger().mark_failed(claim.job_id(), SHUTDOWN_REASON) {
                        error!(job_id = claim.job_id(), error = %e, "Failed to record job failure");
                    }
                }
            }
        });
    }
}

async fn daily_run(
    collector: &Arc<Collector>,
    batch_size: usize,
    workers: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<BatchSummary> {
    let owners = collector
        .refresher()
        .vault()
        .list_owners()
        .context("Failed to enumerate connected owners")?;

    if owners.is_empty() {
        info!("No connected owners, nothing to collect");
        return Ok(BatchSummary::default());
    }

    Ok(run_batches(
        Arc::clone(collector),
        owners,
        JobType::Daily,
        batch_size,
        Arc::clone(workers),
        cancel.clone(),
    )
    .await)
}
