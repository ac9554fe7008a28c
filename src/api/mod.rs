// HTTP boundary: OAuth connect flow and per-owner collection controls

mod error;
pub mod oauth;
mod trigger;

pub use error::AppError;
pub use oauth::{create_oauth_router, OAuthAppState};
pub use trigger::{CollectionTrigger, TriggerError};
