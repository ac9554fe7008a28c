//! OAuth token exchange: authorization code and refresh grants.
//!
//! The provider's token response has exactly one accepted shape
//! ([`TokenResponse`]). Anything else is rejected at this boundary and
//! logged rather than guessed at.

use crate::credentials::OAuthToken;
use crate::error::Result;
use crate::platform::PlatformError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

/// Provider token endpoint contract.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchanges an authorization code from the callback for a token pair.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken>;

    /// Performs a `grant_type=refresh_token` request.
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthToken>;
}

/// OAuth token response (standard OAuth 2.0, scopes as a JSON array)
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Checks the invariants the rest of the system relies on.
    pub fn validate(self) -> std::result::Result<OAuthToken, PlatformError> {
        if self.access_token.trim().is_empty() {
            return Err(PlatformError::Malformed("empty access_token".to_string()));
        }
        if let Some(token_type) = &self.token_type {
            if !token_type.eq_ignore_ascii_case("bearer") {
                return Err(PlatformError::Malformed(format!(
                    "unsupported token_type '{}'",
                    token_type
                )));
            }
        }
        if let Some(expires_in) = self.expires_in {
            if expires_in <= 0 {
                return Err(PlatformError::Malformed(format!(
                    "non-positive expires_in {}",
                    expires_in
                )));
            }
        }
        if self.refresh_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(PlatformError::Malformed("empty refresh_token".to_string()));
        }

        Ok(OAuthToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            scopes: self.scope,
            expires_at: self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

/// Token exchange over HTTP against the provider's token endpoint.
pub struct HttpTokenExchange {
    http_client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenExchange {
    pub fn new(
        http_client: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http_client,
            token_url,
            client_id,
            client_secret,
        }
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<OAuthToken> {
        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(PlatformError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(PlatformError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let body = response.text().await.map_err(PlatformError::from)?;
        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            warn!(error = %e, "Rejected malformed token response");
            PlatformError::Malformed(e.to_string())
        })?;

        let token = parsed.validate().map_err(|e| {
            warn!(error = %e, "Rejected invalid token response");
            e
        })?;

        debug!(
            has_refresh_token = token.refresh_token.is_some(),
            expires_at = ?token.expires_at,
            "Token endpoint call successful"
        );

        Ok(token)
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken> {
        debug!("Exchanging authorization code for token at {}", self.token_url);
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthToken> {
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use mockito::{Matcher, Server};

    fn exchange_for(server: &mockito::ServerGuard) -> HttpTokenExchange {
        HttpTokenExchange::new(
            reqwest::Client::new(),
            format!("{}/oauth2/token", server.url()),
            "client-id".to_string(),
            "client-secret".to_string(),
        )
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "abc123",
            "refresh_token": "def456",
            "expires_in": 14400,
            "scope": ["channel:read:subscriptions", "user:read:email"],
            "token_type": "bearer"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let token = response.validate().unwrap();
        assert_eq!(token.access_token, "abc123");
        assert_eq!(token.refresh_token.as_deref(), Some("def456"));
        assert_eq!(token.scopes.len(), 2);
        assert!(token.expires_at.is_some());
    }

    #[test]
    fn test_token_response_minimal() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token": "t"}"#).unwrap();
        let token = response.validate().unwrap();
        assert!(token.refresh_token.is_none());
        assert!(token.expires_at.is_none());
        assert!(token.scopes.is_empty());
    }

    #[test]
    fn test_invalid_token_responses_rejected() {
        for json in [
            r#"{"access_token": ""}"#,
            r#"{"access_token": "t", "expires_in": 0}"#,
            r#"{"access_token": "t", "token_type": "mac"}"#,
            r#"{"access_token": "t", "refresh_token": " "}"#,
        ] {
            let response: TokenResponse = serde_json::from_str(json).unwrap();
            assert!(response.validate().is_err(), "accepted {}", json);
        }

        // Scope as a bare string is not the provider's contract
        assert!(serde_json::from_str::<TokenResponse>(r#"{"access_token": "t", "scope": "a b"}"#).is_err());
    }

    #[tokio::test]
    async fn test_exchange_code_posts_form() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new","refresh_token":"r","expires_in":3600,"scope":["a"],"token_type":"bearer"}"#)
            .create_async()
            .await;

        let token = exchange_for(&server)
            .exchange_code("the-code", "http://localhost/callback")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(token.access_token, "new");
        assert_eq!(token.scopes, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_non_2xx_is_upstream_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(r#"{"status":400,"message":"Invalid refresh token"}"#)
            .create_async()
            .await;

        let result = exchange_for(&server).refresh("dead").await;
        match result {
            Err(Error::Upstream(PlatformError::Status { status, body })) => {
                assert_eq!(status, 400);
                assert!(body.contains("Invalid refresh token"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(r#"{"data": {"token": "nested"}}"#)
            .create_async()
            .await;

        let result = exchange_for(&server).refresh("r").await;
        assert!(matches!(result, Err(Error::Upstream(PlatformError::Malformed(_)))));
    }
}
