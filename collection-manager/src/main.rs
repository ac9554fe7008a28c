use anyhow::{Context, Result};
use collection_manager::{CollectionManager, Collector, Jitter, SHUTDOWN_REASON};
use creatorsync::analytics::AnalyticsStore;
use creatorsync::api::{create_oauth_router, OAuthAppState};
use creatorsync::cache::{AnalyticsCache, CachePolicy};
use creatorsync::config::{load_from_env, Secrets};
use creatorsync::credentials::{purge_channel, CredentialVault};
use creatorsync::db::Database;
use creatorsync::ledger::JobLedger;
use creatorsync::oauth::{run_session_sweep, verifier_for, HttpTokenExchange, SessionStore};
use creatorsync::platform::HttpPlatformClient;
use creatorsync::refresh::TokenRefresher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collection_manager=info,creatorsync=info".into()),
        )
        .init();

    info!("Collection manager starting...");

    let config = load_from_env().context("Failed to load configuration")?;
    let secrets = Secrets::from_env().context("Failed to read secrets from environment")?;

    info!(
        database = %config.database.path.display(),
        provider = %config.oauth.provider,
        bind = %config.server.bind,
        environment = ?config.auth.environment,
        "Configuration loaded"
    );

    let db = Database::open(&config.database.path).context("Failed to open database")?;

    // Jobs left non-terminal by a previous process
    let ledger = JobLedger::new(db.clone());
    let stale = ledger
        .fail_running(SHUTDOWN_REASON)
        .context("Failed to close stale jobs")?;
    if stale > 0 {
        warn!(jobs = stale, "Closed jobs left running by a previous run");
    }

    let shutdown = CancellationToken::new();

    let analytics = AnalyticsStore::new(db.clone());
    let cache = AnalyticsCache::new(db.clone(), CachePolicy::from_config(&config.cache));
    let (purge_queue, purge_worker) = purge_channel(analytics.clone(), cache.clone());
    let purge_handle = tokio::spawn(purge_worker.run(shutdown.clone()));

    let vault = Arc::new(CredentialVault::new(
        db.clone(),
        secrets.encryption_key.clone(),
        purge_queue,
    ));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.collection.call_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let exchange = Arc::new(HttpTokenExchange::new(
        http_client.clone(),
        config.oauth.token_url.clone(),
        secrets.oauth_client_id.clone(),
        secrets.oauth_client_secret.clone(),
    ));
    let platform = Arc::new(HttpPlatformClient::new(
        http_client,
        config.oauth.api_base_url.clone(),
        config.oauth.validate_url.clone(),
        secrets.oauth_client_id.clone(),
    ));
    let refresher = Arc::new(TokenRefresher::new(
        Arc::clone(&vault),
        exchange.clone(),
        &config.refresh,
    ));

    let sessions = SessionStore::new(chrono::Duration::seconds(config.sessions.ttl_seconds));
    let sweep_interval = Duration::from_secs(config.sessions.sweep_interval_seconds);
    let sweep_handle = tokio::spawn(run_session_sweep(
        sessions.clone(),
        sweep_interval,
        shutdown.clone(),
    ));

    // Expired cache rows are unreadable anyway; this only reclaims space
    let cache_sweep = cache.clone();
    let cache_cancel = shutdown.clone();
    let cache_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = cache_cancel.cancelled() => break,
                _ = ticker.tick() => match cache_sweep.purge_expired() {
                    Ok(0) => {}
                    Ok(removed) => info!(removed = removed, "Purged expired cache entries"),
                    Err(e) => warn!(error = %e, "Failed to purge expired cache entries"),
                },
            }
        }
    });

    let verifier = verifier_for(&config.auth, secrets.jwt_secret.as_deref())
        .context("Failed to configure bearer token verification")?;

    let collector = Arc::new(Collector::new(
        refresher,
        platform.clone(),
        ledger,
        analytics,
        cache.clone(),
        Jitter::new(config.collection.jitter_min_ms, config.collection.jitter_max_ms),
        Duration::from_secs(config.collection.call_timeout_seconds),
    ));
    let manager = Arc::new(CollectionManager::new(collector, &config.collection, &shutdown)?);
    manager.start()?;

    let state = OAuthAppState {
        provider: config.oauth.provider_config(&secrets.oauth_client_id),
        sessions,
        exchange,
        platform,
        vault,
        cache,
        verifier,
        trigger: manager.clone(),
        callback_base_url: config.oauth.callback_base_url.clone(),
        frontend_redirect_url: config.oauth.frontend_redirect_url.clone(),
    };
    let router = create_oauth_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "HTTP API listening");

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "HTTP API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    let failed = manager.stop().await?;
    shutdown.cancel();

    for (name, handle) in [
        ("http server", server_handle),
        ("session sweep", sweep_handle),
        ("cache sweep", cache_handle),
        ("purge worker", purge_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!(jobs_failed_on_stop = failed, "Collection manager stopped");
    Ok(())
}
