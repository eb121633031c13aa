//! HTTP API Module
//!
//! Provides metrics, health and admin endpoints for the reputation engine.

mod routes;
mod metrics;

pub use routes::{router, run_api_server, ApiState};
pub use metrics::Metrics;
