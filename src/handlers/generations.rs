use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use garde::Validate;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    handlers::response::json,
    models::session::{SessionStatus, SessionView},
    services::generation::Submission,
    state::AppState,
    validation::requests::{CredentialBody, GenerationBody},
};

fn submission_body(submission: &Submission) -> sonic_rs::Value {
    sonic_rs::json!({
        "session_id": submission.session.id.to_string(),
        "status": submission.session.status.as_str(),
        "position": submission.position,
        "status_message": submission.session.status_message,
    })
}

/// Starts a generation for an incoming chat request.
#[axum::debug_handler]
pub async fn create_generation(
    State(state): State<AppState>,
    Json(req): Json<GenerationBody>,
) -> Result<Response> {
    req.validate()?;

    let (fields, overrides) = req.into_parts();
    let submission = state.generation.submit(fields, overrides).await?;

    let status = match submission.position {
        Some(_) => StatusCode::ACCEPTED,
        None => StatusCode::CREATED,
    };
    json(status, &submission_body(&submission))
}

/// Returns the current view of a session.
#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Response> {
    let session = state
        .generation
        .session(session_id)
        .await
        .ok_or(AppError::NotFound)?;

    json(StatusCode::OK, &SessionView::from(&session))
}

/// Returns the generated image once the session is done.
#[axum::debug_handler]
pub async fn get_session_image(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Response> {
    let session = state
        .generation
        .session(session_id)
        .await
        .ok_or(AppError::NotFound)?;

    let image = match (session.status, session.image) {
        (SessionStatus::Done, Some(image)) => image,
        _ => return Err(AppError::NotFound),
    };

    Ok((
        StatusCode::OK,
        [(http::header::CONTENT_TYPE, image.mime_type.clone())],
        image.bytes.as_ref().clone(),
    )
        .into_response())
}

/// Answers a session's credential prompt and resumes it.
#[axum::debug_handler]
pub async fn provide_credential(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<CredentialBody>,
) -> Result<Response> {
    req.validate()?;

    let submission = state
        .generation
        .provide_credential(session_id, req.api_key)
        .await?;

    json(StatusCode::OK, &submission_body(&submission))
}
