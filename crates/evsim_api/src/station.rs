use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use evsim_core::{StationRegistry, StationSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

/// List every running station
pub async fn list_stations(State(registry): State<StationRegistry>) -> Json<Vec<StationSnapshot>> {
    tracing::info!("Listing stations");
    Json(registry.snapshots())
}

/// Get one station by id
pub async fn get_station(
    State(registry): State<StationRegistry>,
    Path(station_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!("Getting station {}", station_id);
    match registry.snapshot(&station_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Station {} not found", station_id),
            }),
        )
            .into_response(),
    }
}
