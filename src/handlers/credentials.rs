use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use garde::Validate;

use crate::{
    error::Result,
    handlers::response::json,
    state::AppState,
    validation::requests::StoreCredentialBody,
};

/// Stores a user's image API key.
#[axum::debug_handler]
pub async fn store_credential(
    State(state): State<AppState>,
    Json(req): Json<StoreCredentialBody>,
) -> Result<Response> {
    req.validate()?;

    state
        .generation
        .store_credential(&req.user_id, req.api_key)
        .await;

    json(
        StatusCode::OK,
        &sonic_rs::json!({
            "user_id": req.user_id,
            "stored": true
        }),
    )
}

/// Reports whether a live credential exists for the user.
#[axum::debug_handler]
pub async fn credential_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Response> {
    let present = state.generation.has_credential(&user_id).await;
    json(StatusCode::OK, &sonic_rs::json!({ "present": present }))
}

/// Removes the user's stored credential.
#[axum::debug_handler]
pub async fn delete_credential(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Response> {
    let removed = state.generation.forget_credential(&user_id).await;
    if removed {
        tracing::info!("🧹 Credential removed for user {}", user_id);
    }
    json(StatusCode::OK, &sonic_rs::json!({ "removed": removed }))
}
