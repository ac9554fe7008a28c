use crate::error::{Banner, Error};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    /// "connect" or "reconnect" when the UI should prompt the user
    #[serde(skip_serializing_if = "Option::is_none")]
    banner: Option<&'static str>,
}

/// Application error types for the auth endpoints
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    NotFound(String),
    ServiceUnavailable(String),
    Core(Error),
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError::Core(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, banner) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
            AppError::Core(e) => {
                let status = match &e {
                    Error::CredentialNotFound { .. } => StatusCode::NOT_FOUND,
                    Error::ReauthRequired { .. } | Error::AccountSwitched { .. } => StatusCode::CONFLICT,
                    Error::SessionExpiredOrInvalid => StatusCode::BAD_REQUEST,
                    Error::Upstream(_) => StatusCode::BAD_GATEWAY,
                    Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
                    Error::Encryption(_)
                    | Error::Storage(_)
                    | Error::StorageUnavailable(_)
                    | Error::Config(_) => {
                        error!(error = %e, "Request failed with internal error");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let banner = match e.banner() {
                    Banner::Connect => Some("connect"),
                    Banner::Reconnect => Some("reconnect"),
                    Banner::None => None,
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else {
                    e.to_string()
                };
                (status, message, banner)
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            banner,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(err: Error) -> (StatusCode, serde_json::Value) {
        let response = AppError::from(err).into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_reconnect_banner_on_reauth() {
        let (status, body) = render(Error::reauth("u1", "refresh rejected")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["banner"], "reconnect");
    }

    #[tokio::test]
    async fn test_storage_faults_are_internal() {
        let (status, body) =
            render(Error::StorageUnavailable("database mutex poisoned".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
        assert!(body.get("banner").is_none());
    }
}
