//! Upstream API access: endpoint registry, HTTP client, query validation

mod client;
pub mod endpoints;
mod error;
mod query_system;

pub use client::{Client, RESPONSE_HEADERS_KEY, RESPONSE_TIME_KEY};
pub use error::ApiError;
pub use query_system::{Query, QueryPlanItem, QuerySystem};
