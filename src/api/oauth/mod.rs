//! OAuth connect flow and per-owner connection endpoints.
//!
//! 1. Dashboard calls POST /auth/:provider/initiate → `{oauth_url, state}`
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to GET /auth/:provider/callback?code&state
//! 4. Session consumed, code exchanged, external account resolved,
//!    credential stored (switch detection happens in the vault)
//! 5. Browser redirected to the dashboard with `connected=true` or `error=...`

use super::{AppError, CollectionTrigger};
use crate::auth::authenticate;
use crate::cache::AnalyticsCache;
use crate::credentials::{ConnectionStatus, CredentialVault};
use crate::oauth::{OAuthProviderConfig, SessionStore, TokenExchange, TokenVerifier};
use crate::platform::PlatformApi;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared application state for the auth endpoints
#[derive(Clone)]
pub struct OAuthAppState {
    pub provider: OAuthProviderConfig,
    pub sessions: SessionStore,
    pub exchange: Arc<dyn TokenExchange>,
    pub platform: Arc<dyn PlatformApi>,
    pub vault: Arc<CredentialVault>,
    pub cache: AnalyticsCache,
    pub verifier: Arc<dyn TokenVerifier>,
    pub trigger: Arc<dyn CollectionTrigger>,
    pub callback_base_url: String,
    pub frontend_redirect_url: String,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct InitiateResponse {
    oauth_url: String,
    state: String,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    disconnected: bool,
}

#[derive(Serialize)]
pub struct CollectResponse {
    accepted: bool,
}

/// Error codes carried in the callback redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackError {
    SessionExpired,
    ExchangeFailed,
    StorageFailed,
    ProviderDenied,
}

impl CallbackError {
    fn as_str(&self) -> &'static str {
        match self {
            CallbackError::SessionExpired => "session_expired",
            CallbackError::ExchangeFailed => "exchange_failed",
            CallbackError::StorageFailed => "storage_failed",
            CallbackError::ProviderDenied => "provider_denied",
        }
    }
}

/// Create auth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/auth/:provider/initiate", post(initiate))
        .route("/auth/:provider/callback", get(callback))
        .route("/auth/:provider/disconnect", delete(disconnect))
        .route("/auth/:provider/collect", post(collect))
        .route("/auth/:provider/connection-status", get(connection_status))
        .with_state(Arc::new(state))
}

fn check_provider(state: &OAuthAppState, provider: &str) -> Result<(), AppError> {
    if provider != state.provider.name {
        warn!(provider = %provider, "Unknown OAuth provider");
        return Err(AppError::NotFound(format!("Provider '{}' not found", provider)));
    }
    Ok(())
}

fn owner_from(state: &OAuthAppState, headers: &HeaderMap) -> Result<String, AppError> {
    authenticate(headers, state.verifier.as_ref())
        .map_err(|e| AppError::Unauthorized(e.to_string()))
}

/// POST /auth/:provider/initiate
///
/// Creates a single-use CSRF state bound to the caller's owner id and
/// returns the provider authorization URL.
async fn initiate(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<InitiateResponse>, AppError> {
    check_provider(&state, &provider)?;
    let owner_id = owner_from(&state, &headers)?;

    let session = state.sessions.create_session(&owner_id);
    let redirect_uri = state.provider.redirect_uri(&state.callback_base_url);
    let oauth_url = state.provider.build_auth_url(&session.state, &redirect_uri);

    info!(owner_id = %owner_id, provider = %provider, "OAuth flow initiated");

    Ok(Json(InitiateResponse {
        oauth_url,
        state: session.state,
    }))
}

/// GET /auth/:provider/callback
///
/// Always answers with a redirect to the dashboard; failures are carried in
/// the `error` query flag and never retried.
async fn callback(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    Query(params): Query<OAuthCallback>,
) -> Result<Redirect, AppError> {
    check_provider(&state, &provider)?;

    let outcome = complete_callback(&state, params).await;
    let target = match outcome {
        Ok(()) => format!("{}?connected=true", state.frontend_redirect_url),
        Err(code) => format!("{}?error={}", state.frontend_redirect_url, code.as_str()),
    };

    Ok(Redirect::to(&target))
}

async fn complete_callback(state: &OAuthAppState, params: OAuthCallback) -> Result<(), CallbackError> {
    if let Some(error) = params.error {
        warn!(
            error = %error,
            description = params.error_description.as_deref().unwrap_or("none"),
            "OAuth authorization denied by provider"
        );
        return Err(CallbackError::ProviderDenied);
    }

    let csrf_state = params.state.ok_or(CallbackError::SessionExpired)?;
    let session = state.sessions.consume_session(&csrf_state).map_err(|_| {
        warn!("OAuth callback with missing or expired state");
        CallbackError::SessionExpired
    })?;
    let owner_id = session.owner_id;

    let code = params.code.ok_or_else(|| {
        warn!(owner_id = %owner_id, "OAuth callback without code");
        CallbackError::ExchangeFailed
    })?;

    let redirect_uri = state.provider.redirect_uri(&state.callback_base_url);
    debug!(owner_id = %owner_id, "Exchanging authorization code");
    let token = state
        .exchange
        .exchange_code(&code, &redirect_uri)
        .await
        .map_err(|e| {
            error!(owner_id = %owner_id, error = %e, "Token exchange failed");
            CallbackError::ExchangeFailed
        })?;

    let account = state
        .platform
        .validate_token(&token.access_token)
        .await
        .map_err(|e| {
            error!(owner_id = %owner_id, error = %e, "Failed to resolve external account");
            CallbackError::ExchangeFailed
        })?;

    let outcome = state
        .vault
        .store_tokens(&owner_id, &account.user_id, &token)
        .map_err(|e| {
            error!(owner_id = %owner_id, error = %e, "Failed to store credential");
            CallbackError::StorageFailed
        })?;

    if let Err(e) = state.cache.invalidate_owner(&owner_id) {
        warn!(owner_id = %owner_id, error = %e, "Failed to invalidate cache after connect");
    }

    info!(
        owner_id = %owner_id,
        external_account_id = %account.user_id,
        created = outcome.created,
        is_switch = outcome.is_switch,
        "OAuth flow completed"
    );
    Ok(())
}

/// DELETE /auth/:provider/disconnect
async fn disconnect(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    check_provider(&state, &provider)?;
    let owner_id = owner_from(&state, &headers)?;

    let disconnected = state.vault.delete_stored_tokens(&owner_id)?;
    if let Err(e) = state.cache.invalidate_owner(&owner_id) {
        warn!(owner_id = %owner_id, error = %e, "Failed to invalidate cache after disconnect");
    }

    Ok(Json(DisconnectResponse { disconnected }))
}

/// POST /auth/:provider/collect
///
/// Queues an on-demand collection and returns 202 without waiting for it.
async fn collect(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_provider(&state, &provider)?;
    let owner_id = owner_from(&state, &headers)?;

    if !state.vault.connection_status(&owner_id)?.connected {
        return Err(crate::error::Error::not_found(&owner_id).into());
    }

    if let Err(e) = state.cache.invalidate_owner(&owner_id) {
        warn!(owner_id = %owner_id, error = %e, "Failed to invalidate cache before collection");
    }

    match state.trigger.trigger(&owner_id) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(CollectResponse { accepted: true })).into_response()),
        Err(e) => {
            warn!(owner_id = %owner_id, error = %e, "On-demand collection rejected");
            Err(AppError::ServiceUnavailable(e.to_string()))
        }
    }
}

/// GET /auth/:provider/connection-status
async fn connection_status(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ConnectionStatus>, AppError> {
    check_provider(&state, &provider)?;
    let owner_id = owner_from(&state, &headers)?;
    Ok(Json(state.vault.connection_status(&owner_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("csrf_state_456".to_string()));
        assert_eq!(callback.error, None);

        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_callback_error_codes() {
        assert_eq!(CallbackError::SessionExpired.as_str(), "session_expired");
        assert_eq!(CallbackError::ExchangeFailed.as_str(), "exchange_failed");
        assert_eq!(CallbackError::StorageFailed.as_str(), "storage_failed");
        assert_eq!(CallbackError::ProviderDenied.as_str(), "provider_denied");
    }
}
