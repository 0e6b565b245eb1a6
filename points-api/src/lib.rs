//! JSON HTTP surface over the points ledger

pub mod errors;
pub mod handlers;
pub mod models;

pub use errors::{ApiError, Result};
pub use handlers::{configure_routes, ACTOR_HEADER};
