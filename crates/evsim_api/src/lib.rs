//! EVSIM API Library
//!
//! Read-only HTTP view over the stations running in the simulator.

mod station;

pub use crate::station::ErrorResponse;

use axum::{Router, routing::get};
use evsim_core::StationRegistry;
use tower_http::trace::TraceLayer;

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Create the application router with all endpoints
pub fn create_app(registry: StationRegistry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stations", get(station::list_stations))
        .route("/stations/{station_id}", get(station::get_station))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}
