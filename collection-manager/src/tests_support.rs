use crate::collector::Collector;
use crate::jitter::Jitter;
use creatorsync::analytics::AnalyticsStore;
use creatorsync::cache::{AnalyticsCache, CachePolicy};
use creatorsync::config::RefreshConfig;
use creatorsync::credentials::{purge_channel, CredentialVault, EncryptionKey, PurgeStats, PurgeWorker};
use creatorsync::db::Database;
use creatorsync::ledger::JobLedger;
use creatorsync::refresh::TokenRefresher;
use creatorsync::testing::{sample_token, FakePlatform, FakeTokenExchange};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Collector wired to an in-memory database and fake upstreams.
pub struct Harness {
    pub vault: Arc<CredentialVault>,
    pub platform: Arc<FakePlatform>,
    pub ledger: JobLedger,
    pub analytics: AnalyticsStore,
    pub cache: AnalyticsCache,
    pub collector: Arc<Collector>,
    pub purge_stats: Arc<PurgeStats>,
    purge_worker: Mutex<Option<PurgeWorker>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_call_timeout(Duration::from_secs(5))
    }

    pub fn with_call_timeout(call_timeout: Duration) -> Self {
        let db = Database::in_memory().unwrap();
        let analytics = AnalyticsStore::new(db.clone());
        let cache = AnalyticsCache::new(db.clone(), CachePolicy::default());
        let ledger = JobLedger::new(db.clone());
        let (queue, purge_worker) = purge_channel(analytics.clone(), cache.clone());
        let purge_stats = queue.stats();
        let key = EncryptionKey::from_bytes(&[5u8; 32]).unwrap();
        let vault = Arc::new(CredentialVault::new(db, key, queue));
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&vault),
            Arc::new(FakeTokenExchange::new()),
            &RefreshConfig::default(),
        ));
        let platform = Arc::new(FakePlatform::new());

        let collector = Arc::new(Collector::new(
            refresher,
            platform.clone(),
            ledger.clone(),
            analytics.clone(),
            cache.clone(),
            Jitter::none(),
            call_timeout,
        ));

        Self {
            vault,
            platform,
            ledger,
            analytics,
            cache,
            collector,
            purge_stats,
            purge_worker: Mutex::new(Some(purge_worker)),
        }
    }

    /// Starts the purge worker; queued purges otherwise wait forever.
    pub fn spawn_purge_worker(&self, cancel: CancellationToken) {
        if let Some(worker) = self.purge_worker.lock().unwrap().take() {
            tokio::spawn(worker.run(cancel));
        }
    }

    /// Stores a long-lived credential linking `owner_id` to `external_id`.
    pub fn connect(&self, owner_id: &str, external_id: &str) {
        self.vault
            .store_tokens(owner_id, external_id, &sample_token(&format!("tok-{}", owner_id), 3600))
            .unwrap();
    }
}
