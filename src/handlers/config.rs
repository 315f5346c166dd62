use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Current configuration, with the signing secret redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial update of the `segmentation` section. Applies to jobs started
/// after the update; running jobs keep the settings they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let updated = state
        .update_config(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    info!(segmentation = ?updated.segmentation, "Configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}
