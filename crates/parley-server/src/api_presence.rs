//! Presence query endpoint.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use parley_types::UserId;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub online: bool,
}

/// `GET /api/presence/{user_id}`: whether the user has any open connection
/// anywhere in the fleet.
pub async fn get_presence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, StatusCode> {
    let user_id: UserId = user_id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let online = state.presence.contains(user_id).await.map_err(|e| {
        tracing::error!(user_id = %user_id, "presence lookup failed: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(PresenceResponse { user_id, online }))
}
