use super::{
    ChannelInfo, PlatformApi, PlatformError, SubscriberSummary, TokenValidation, Video,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

/// Page size requested from the videos endpoint.
const VIDEOS_PAGE_SIZE: u32 = 20;

/// `{"data": [...]}` envelope used by the list endpoints.
#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

/// `{"total": N, ...}` envelope used by the counting endpoints.
#[derive(Deserialize)]
struct TotalEnvelope {
    total: u64,
    #[serde(default)]
    points: u64,
}

/// HTTP client for the platform REST API.
///
/// Authenticates with a Bearer token and the application's `Client-Id`.
pub struct HttpPlatformClient {
    http_client: Client,
    api_base_url: String,
    validate_url: String,
    client_id: String,
}

impl HttpPlatformClient {
    pub fn new(
        http_client: Client,
        api_base_url: String,
        validate_url: String,
        client_id: String,
    ) -> Self {
        Self {
            http_client,
            api_base_url,
            validate_url,
            client_id,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let url = format!("{}{}", self.api_base_url, path);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .header("Client-Id", &self.client_id)
            .query(query)
            .send()
            .await?;

        let response = check_response_status(response).await?;
        response.json::<T>().await.map_err(|e| {
            warn!(path = path, error = %e, "Failed to parse platform response");
            PlatformError::Malformed(e.to_string())
        })
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformClient {
    async fn get_channel_info(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<ChannelInfo, PlatformError> {
        let envelope: DataEnvelope<ChannelInfo> = self
            .get_json(access_token, "/channels", &[("broadcaster_id", broadcaster_id)])
            .await?;
        envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Malformed("channel not found in response".to_string()))
    }

    async fn get_follower_count(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<u64, PlatformError> {
        let envelope: TotalEnvelope = self
            .get_json(
                access_token,
                "/channels/followers",
                &[("broadcaster_id", broadcaster_id)],
            )
            .await?;
        Ok(envelope.total)
    }

    async fn get_videos(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<Vec<Video>, PlatformError> {
        let first = VIDEOS_PAGE_SIZE.to_string();
        let envelope: DataEnvelope<Video> = self
            .get_json(
                access_token,
                "/videos",
                &[("user_id", broadcaster_id), ("first", first.as_str())],
            )
            .await?;
        Ok(envelope.data)
    }

    async fn get_subscribers(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<SubscriberSummary, PlatformError> {
        let envelope: TotalEnvelope = self
            .get_json(
                access_token,
                "/subscriptions",
                &[("broadcaster_id", broadcaster_id)],
            )
            .await?;
        Ok(SubscriberSummary {
            total: envelope.total,
            points: envelope.points,
        })
    }

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidation, PlatformError> {
        let response = self
            .http_client
            .get(&self.validate_url)
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await?;

        let response = check_response_status(response).await?;
        response
            .json::<TokenValidation>()
            .await
            .map_err(|e| PlatformError::Malformed(e.to_string()))
    }
}

/// Check the response status and map known error codes to descriptive errors.
///
/// - 401 → token expired or revoked
/// - 429 → rate limit (logs Ratelimit-Reset)
/// - Other non-2xx → status with body
async fn check_response_status(response: Response) -> Result<Response, PlatformError> {
    match response.status() {
        StatusCode::UNAUTHORIZED => Err(PlatformError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => {
            let reset = response
                .headers()
                .get("Ratelimit-Reset")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            warn!(reset = %reset, "Platform rate limit exceeded");
            Err(PlatformError::RateLimited)
        }
        s if !s.is_success() => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            Err(PlatformError::Status {
                status: s.as_u16(),
                body,
            })
        }
        _ => Ok(response),
    }
}
