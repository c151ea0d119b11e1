use service_core::axum::{extract::State, response::IntoResponse, Json};
use service_core::error::AppError;
use service_core::serde_json::json;

use crate::services::ServiceError;
use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state
        .records
        .health_check()
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn metrics() -> impl IntoResponse {
    crate::services::metrics::get_metrics()
}
