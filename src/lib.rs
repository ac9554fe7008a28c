// OAuth credential vault and analytics collection core

pub mod analytics;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod ledger;
pub mod oauth;
pub mod platform;
pub mod refresh;
pub mod testing;

pub use error::{Error, Result};
