//! Service configuration.
//!
//! Non-secret settings come from a TOML file; every section falls back to
//! defaults when absent. Secrets are read from the environment only.

use crate::credentials::EncryptionKey;
use crate::error::{Error, Result};
use crate::oauth::OAuthProviderConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Path to the TOML configuration file (optional).
pub const CONFIG_PATH_ENV: &str = "CREATORSYNC_CONFIG";
pub const ENCRYPTION_KEY_ENV: &str = "CREATORSYNC_ENCRYPTION_KEY";
pub const OAUTH_CLIENT_ID_ENV: &str = "CREATORSYNC_OAUTH_CLIENT_ID";
pub const OAUTH_CLIENT_SECRET_ENV: &str = "CREATORSYNC_OAUTH_CLIENT_SECRET";
pub const AUTH_JWT_SECRET_ENV: &str = "CREATORSYNC_AUTH_JWT_SECRET";

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./creatorsync.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// OAuth session store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of a CSRF state token (seconds)
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: i64,
    /// How often expired sessions are swept (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_session_ttl() -> i64 {
    600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Token refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh tokens expiring within this window (seconds)
    #[serde(default = "default_refresh_leeway")]
    pub leeway_seconds: i64,
    /// Timeout for a single refresh request (seconds)
    #[serde(default = "default_refresh_timeout")]
    pub timeout_seconds: u64,
}

fn default_refresh_leeway() -> i64 {
    300
}

fn default_refresh_timeout() -> u64 {
    30
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            leeway_seconds: default_refresh_leeway(),
            timeout_seconds: default_refresh_timeout(),
        }
    }
}

/// Background collection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    /// Owners per batch on the daily path
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent owners within a batch
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_daily_hour")]
    pub daily_hour_utc: u32,
    #[serde(default)]
    pub daily_minute_utc: u32,
    /// Timeout for each per-owner network call (seconds)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// How long Stop() waits for in-flight jobs (seconds)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
    /// Capacity of the on-demand submission queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_workers() -> usize {
    4
}

fn default_jitter_min_ms() -> u64 {
    250
}

fn default_jitter_max_ms() -> u64 {
    1500
}

fn default_daily_hour() -> u32 {
    3
}

fn default_call_timeout() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    20
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            daily_hour_utc: default_daily_hour(),
            daily_minute_utc: 0,
            call_timeout_seconds: default_call_timeout(),
            stop_grace_seconds: default_stop_grace(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl CollectionConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_workers == 0 || self.queue_capacity == 0 {
            return Err(Error::Config(
                "collection batch_size, max_workers and queue_capacity must be positive".to_string(),
            ));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(Error::Config(format!(
                "collection jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.daily_hour_utc > 23 || self.daily_minute_utc > 59 {
            return Err(Error::Config(format!(
                "invalid daily run time {:02}:{:02}",
                self.daily_hour_utc, self.daily_minute_utc
            )));
        }
        Ok(())
    }
}

/// Cache TTLs per key family (seconds)
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: i64,
    #[serde(default = "default_summary_ttl")]
    pub summary_ttl_seconds: i64,
    #[serde(default = "default_enhanced_ttl")]
    pub enhanced_ttl_seconds: i64,
}

fn default_cache_ttl() -> i64 {
    300
}

fn default_summary_ttl() -> i64 {
    600
}

fn default_enhanced_ttl() -> i64 {
    120
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_cache_ttl(),
            summary_ttl_seconds: default_summary_ttl(),
            enhanced_ttl_seconds: default_enhanced_ttl(),
        }
    }
}

/// Streaming platform OAuth and API endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_validate_url")]
    pub validate_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Public base URL the provider redirects back to
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Dashboard URL the callback redirects the browser to
    #[serde(default = "default_frontend_redirect_url")]
    pub frontend_redirect_url: String,
    #[serde(default = "default_force_verify")]
    pub force_verify: bool,
}

fn default_provider() -> String {
    "twitch".to_string()
}

fn default_auth_url() -> String {
    "https://id.twitch.tv/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

fn default_validate_url() -> String {
    "https://id.twitch.tv/oauth2/validate".to_string()
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "user:read:email".to_string(),
        "channel:read:subscriptions".to_string(),
        "moderator:read:followers".to_string(),
    ]
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_frontend_redirect_url() -> String {
    "http://localhost:3000/dashboard".to_string()
}

fn default_force_verify() -> bool {
    true
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            validate_url: default_validate_url(),
            api_base_url: default_api_base_url(),
            scopes: default_scopes(),
            callback_base_url: default_callback_base_url(),
            frontend_redirect_url: default_frontend_redirect_url(),
            force_verify: default_force_verify(),
        }
    }
}

impl OAuthConfig {
    pub fn provider_config(&self, client_id: &str) -> OAuthProviderConfig {
        OAuthProviderConfig {
            name: self.provider.clone(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            scopes: self.scopes.clone(),
            client_id: client_id.to_string(),
            force_verify: self.force_verify,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

/// Application bearer token verification
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.collection.validate()?;
        if self.sessions.ttl_seconds <= 0 || self.sessions.sweep_interval_seconds == 0 {
            return Err(Error::Config(
                "session ttl and sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path, e)))?;
    let config: AppConfig = toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path, e)))?;
    config.validate()?;
    Ok(config)
}

/// Loads the file named by `CREATORSYNC_CONFIG`, or defaults when unset.
pub fn load_from_env() -> Result<AppConfig> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_config(&path),
        Err(_) => {
            let config = AppConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Secrets, read from the environment only.
pub struct Secrets {
    pub encryption_key: EncryptionKey,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub jwt_secret: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{} must be set", name)))
        };

        let encryption_key = EncryptionKey::from_base64(&required(ENCRYPTION_KEY_ENV)?)?;

        Ok(Self {
            encryption_key,
            oauth_client_id: required(OAUTH_CLIENT_ID_ENV)?,
            oauth_client_secret: required(OAUTH_CLIENT_SECRET_ENV)?,
            jwt_secret: lookup(AUTH_JWT_SECRET_ENV).filter(|v| !v.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.sessions.ttl_seconds, 600);
        assert_eq!(config.sessions.sweep_interval_seconds, 300);
        assert_eq!(config.refresh.leeway_seconds, 300);
        assert_eq!(config.collection.batch_size, 10);
        assert_eq!(config.collection.call_timeout_seconds, 30);
        assert_eq!(config.cache.enhanced_ttl_seconds, 120);
        assert_eq!(config.auth.environment, Environment::Production);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [database]
            path = "/var/lib/creatorsync/data.db"

            [collection]
            batch_size = 5
            max_workers = 2
            daily_hour_utc = 6
            daily_minute_utc = 30

            [auth]
            environment = "development"

            [oauth]
            provider = "twitch"
            frontend_redirect_url = "https://app.example.com/dashboard"
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/creatorsync/data.db"));
        assert_eq!(config.collection.batch_size, 5);
        assert_eq!(config.collection.daily_minute_utc, 30);
        // Unspecified fields keep defaults
        assert_eq!(config.collection.jitter_max_ms, 1500);
        assert_eq!(config.auth.environment, Environment::Development);
        assert_eq!(config.oauth.token_url, "https://id.twitch.tv/oauth2/token");
        assert_eq!(config.sessions.ttl_seconds, 600);
    }

    #[test]
    fn test_invalid_collection_settings_rejected() {
        let mut config = AppConfig::default();
        config.collection.jitter_min_ms = 2000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.collection.daily_hour_utc = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("creatorsync.toml");
        std::fs::write(&path, "[server]\nbind = \"127.0.0.1:9000\"\n").unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");

        assert!(load_config("/nonexistent/creatorsync.toml").is_err());
    }

    #[test]
    fn test_secrets_from_lookup() {
        let key = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode([9u8; 32])
        };
        let mut vars = HashMap::new();
        vars.insert(ENCRYPTION_KEY_ENV, key);
        vars.insert(OAUTH_CLIENT_ID_ENV, "client".to_string());
        vars.insert(OAUTH_CLIENT_SECRET_ENV, "secret".to_string());

        let secrets = Secrets::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(secrets.oauth_client_id, "client");
        assert!(secrets.jwt_secret.is_none());

        vars.insert(ENCRYPTION_KEY_ENV, "c2hvcnQ=".to_string());
        assert!(matches!(
            Secrets::from_lookup(|name| vars.get(name).cloned()),
            Err(Error::Encryption(_))
        ));

        vars.remove(OAUTH_CLIENT_SECRET_ENV);
        assert!(Secrets::from_lookup(|name| vars.get(name).cloned()).is_err());
    }
}
