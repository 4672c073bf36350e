use axum::{
    Router,
    routing::{get, post, put},
    extract::DefaultBodyLimit,
};
use tower_http::trace::{TraceLayer, DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, DefaultOnFailure};
use tracing::Level;

pub mod config;
pub mod error;
pub mod state;
pub mod encrypted_cache;

pub mod crypto {
    pub mod aes;
}

pub mod models {
    pub mod credential;
    pub mod generation;
    pub mod session;
}

pub mod repositories {
    pub mod session;
}

pub mod services {
    pub mod generation;
    pub mod notifier;
    pub mod queue;
    pub mod runner;
}

pub mod handlers {
    pub mod credentials;
    pub mod generations;
    pub mod queue;
    pub mod response;
}

pub mod validation {
    pub mod config;
    pub mod requests;
}

use state::AppState;

/// Request bodies carry a prompt and a handful of ids.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Builds the API router.
///
/// Per-IP rate limiting needs the peer address, so it is layered on in `main`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generations", post(handlers::generations::create_generation))
        .route("/api/sessions/{session_id}", get(handlers::generations::get_session))
        .route(
            "/api/sessions/{session_id}/image",
            get(handlers::generations::get_session_image),
        )
        .route(
            "/api/sessions/{session_id}/credential",
            post(handlers::generations::provide_credential),
        )
        .route("/api/credentials", put(handlers::credentials::store_credential))
        .route(
            "/api/credentials/{user_id}",
            get(handlers::credentials::credential_status)
                .delete(handlers::credentials::delete_credential),
        )
        .route("/api/queue", get(handlers::queue::queue_status))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
