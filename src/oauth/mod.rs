//! OAuth 2.0 authorization code flow for linking a platform account.
//!
//! 1. Owner calls initiate → [`SessionStore::create_session`] issues a state
//! 2. Owner authorizes on the provider's site
//! 3. Provider redirects to the callback with `code` and `state`
//! 4. State is consumed (single-use), code exchanged via [`TokenExchange`]
//! 5. Vault stores the encrypted tokens, detecting account switches

mod exchange;
mod provider;
mod session;
mod verifier;

pub use exchange::{HttpTokenExchange, TokenExchange, TokenResponse};
pub use provider::OAuthProviderConfig;
pub use session::{run_session_sweep, OAuthSession, SessionStore};
pub use verifier::{verifier_for, JwtVerifier, RelaxedVerifier, TokenVerifier, VerifyError};
