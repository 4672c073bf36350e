use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::credential::Credential;
use crate::models::generation::{GeneratedImage, GenerationParams};

/// Where a generation request stands.
///
/// `AwaitingParameters -> [AwaitingCredential ->] Generating -> Done | Failed`.
/// Any non-terminal state may also fall straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    AwaitingParameters,
    AwaitingCredential,
    Generating,
    Done,
    Failed,
}

impl SessionStatus {
    /// Returns `true` once the session can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Failed)
    }

    /// Returns whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, next) {
            (AwaitingParameters, AwaitingCredential) => true,
            (AwaitingParameters, Generating) => true,
            (AwaitingCredential, Generating) => true,
            (Generating, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::AwaitingParameters => "awaiting_parameters",
            SessionStatus::AwaitingCredential => "awaiting_credential",
            SessionStatus::Generating => "generating",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight user request.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub source_message_id: String,
    /// Identifier of the UI surface that mirrors this session's status.
    pub status_card_id: Option<String>,
    pub prompt: String,
    pub reference_image_ids: Vec<String>,
    pub params: Option<GenerationParams>,
    pub credential: Option<Credential>,
    pub status: SessionStatus,
    /// Set once the session has been handed to the admission queue.
    pub dispatched: bool,
    /// Latest summary pushed to the requester.
    pub status_message: Option<String>,
    pub image: Option<GeneratedImage>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a session is first created.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub chat_id: String,
    pub source_message_id: String,
    pub status_card_id: Option<String>,
    pub prompt: String,
    pub reference_image_ids: Vec<String>,
}

/// A partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub status_card_id: Option<String>,
    pub params: Option<GenerationParams>,
    pub credential: Option<Credential>,
    pub status_message: Option<String>,
    pub image: Option<GeneratedImage>,
    pub error: Option<String>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// Returns `true` when applying the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.status_card_id.is_none()
            && self.params.is_none()
            && self.credential.is_none()
            && self.status_message.is_none()
            && self.image.is_none()
            && self.error.is_none()
    }
}

/// Serializable session snapshot, never carrying the credential or image bytes.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub source_message_id: String,
    pub status_card_id: Option<String>,
    pub prompt: String,
    pub reference_image_ids: Vec<String>,
    pub params: Option<GenerationParams>,
    pub status: SessionStatus,
    pub dispatched: bool,
    pub status_message: Option<String>,
    pub has_credential: bool,
    pub image_ready: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id.clone(),
            chat_id: session.chat_id.clone(),
            source_message_id: session.source_message_id.clone(),
            status_card_id: session.status_card_id.clone(),
            prompt: session.prompt.clone(),
            reference_image_ids: session.reference_image_ids.clone(),
            params: session.params.clone(),
            status: session.status,
            dispatched: session.dispatched,
            status_message: session.status_message.clone(),
            has_credential: session.credential.is_some(),
            image_ready: session.image.is_some(),
            error: session.error.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}
