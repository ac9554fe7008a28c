//! Verification of the application's own bearer tokens.
//!
//! The strategy is chosen once at startup from the configured environment
//! and injected into the handlers; handlers never branch on environment.

use crate::config::{AuthConfig, Environment};
use crate::error::{Error, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, warn};

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("token has no subject")]
    MissingSubject,
}

/// Claims we read from the application's identity tokens.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Resolves an application bearer token to an owner id.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> std::result::Result<String, VerifyError>;
}

/// Strict verification: HS256 signature and expiry are mandatory.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> std::result::Result<String, VerifyError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "Bearer token rejected");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid,
            }
        })?;
        subject(data.claims)
    }
}

/// Development verification: claims are read without checking the signature.
pub struct RelaxedVerifier {
    validation: Validation,
}

impl RelaxedVerifier {
    pub fn new() -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        Self { validation }
    }
}

impl Default for RelaxedVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVerifier for RelaxedVerifier {
    fn verify(&self, token: &str) -> std::result::Result<String, VerifyError> {
        let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &self.validation)
            .map_err(|_| VerifyError::Invalid)?;
        subject(data.claims)
    }
}

fn subject(claims: Claims) -> std::result::Result<String, VerifyError> {
    claims
        .sub
        .filter(|s| !s.trim().is_empty())
        .ok_or(VerifyError::MissingSubject)
}

/// Builds the verifier for the configured environment.
pub fn verifier_for(config: &AuthConfig, jwt_secret: Option<&str>) -> Result<Arc<dyn TokenVerifier>> {
    match config.environment {
        Environment::Production => {
            let secret = jwt_secret.ok_or_else(|| {
                Error::Config("a JWT secret is required in production".to_string())
            })?;
            Ok(Arc::new(JwtVerifier::new(secret)))
        }
        Environment::Development => {
            warn!("Using relaxed bearer token verification (development only)");
            Ok(Arc::new(RelaxedVerifier::new()))
        }
    }
}
