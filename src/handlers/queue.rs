use axum::{extract::State, http::StatusCode, response::Response};

use crate::{error::Result, handlers::response::json, state::AppState};

/// Returns how many generations are running and waiting.
#[axum::debug_handler]
pub async fn queue_status(State(state): State<AppState>) -> Result<Response> {
    let snapshot = state.generation.queue_snapshot().await?;
    json(StatusCode::OK, &snapshot)
}
