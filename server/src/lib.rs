//! MatchMates server library
//!
//! Exposes modules for testing and reuse

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod router;
pub mod state;
pub mod validation;

pub use router::build_router;
pub use state::{AppState, SharedState};
