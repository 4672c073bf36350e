use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{AppError, Result};

/// Serializes `body` with sonic-rs into a JSON response.
///
/// # Arguments
///
/// * `status` - The response status code.
/// * `body` - The value to serialize.
pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response> {
    let body = sonic_rs::to_string(body)
        .map_err(|e| AppError::Internal(format!("Response serialization failed: {}", e)))?;

    Ok((
        status,
        [(http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}
