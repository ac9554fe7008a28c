//! OAuth provider configuration for the streaming platform.

use serde::{Deserialize, Serialize};

/// OAuth provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// Provider name as it appears in routes (e.g. "twitch")
    pub name: String,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Required OAuth scopes
    pub scopes: Vec<String>,

    /// Client ID (from environment variable)
    pub client_id: String,

    /// Ask the provider to show the consent screen even if already granted,
    /// so the user can pick a different account
    pub force_verify: bool,
}

impl OAuthProviderConfig {
    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        if self.force_verify {
            url.push_str("&force_verify=true");
        }
        url
    }

    /// Callback URL registered with the provider.
    pub fn redirect_uri(&self, callback_base_url: &str) -> String {
        format!(
            "{}/auth/{}/callback",
            callback_base_url.trim_end_matches('/'),
            self.name
        )
    }
}
