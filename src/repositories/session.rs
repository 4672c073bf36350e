use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::credential::Credential;
use crate::models::session::{NewSession, Session, SessionPatch, SessionStatus};

/// Outcome of [`SessionStore::claim`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// This caller owns the dispatch.
    Claimed(Session),
    /// The session was already dispatched or has finished.
    AlreadyClaimed(Session),
}

/// In-memory store of generation sessions with a fixed lifetime.
///
/// Sessions expire `lifetime` after creation regardless of activity. Lookups
/// and updates against unknown or swept ids resolve to `None`.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    lifetime: Duration,
}

impl SessionStore {
    /// Creates a new, empty `SessionStore`.
    ///
    /// # Arguments
    ///
    /// * `lifetime` - How long a session lives after creation.
    pub fn new(lifetime: std::time::Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            lifetime: Duration::from_std(lifetime).unwrap_or(Duration::MAX),
        }
    }

    /// Creates a session in `awaiting_parameters` with a fresh id.
    pub async fn create(&self, fields: NewSession) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: fields.user_id,
            chat_id: fields.chat_id,
            source_message_id: fields.source_message_id,
            status_card_id: fields.status_card_id,
            prompt: fields.prompt,
            reference_image_ids: fields.reference_image_ids,
            params: None,
            credential: None,
            status: SessionStatus::AwaitingParameters,
            dispatched: false,
            status_message: None,
            image: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.sessions.write().await.insert(session.id, session.clone());
        tracing::debug!("Session created: {}", session.id);
        session
    }

    /// Returns a copy of the session, if it exists.
    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Marks the session as handed to the admission queue and stores the
    /// credential its job will use. Check and mark happen under one write lock,
    /// so at most one caller ever claims a given session.
    ///
    /// # Returns
    ///
    /// `None` when the id is unknown, otherwise whether this call claimed it.
    pub async fn claim(&self, id: Uuid, credential: Credential) -> Option<Claim> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;

        if session.dispatched || session.status.is_terminal() {
            return Some(Claim::AlreadyClaimed(session.clone()));
        }

        session.dispatched = true;
        session.credential = Some(credential);
        session.updated_at = Utc::now();
        Some(Claim::Claimed(session.clone()))
    }

    /// Merges `patch` into the session.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the id is unknown, `Ok(Some(session))` with the
    /// updated copy, or `AppError::InvalidTransition` when the status change
    /// is not allowed or the session has already finished (in which case
    /// nothing is modified).
    pub async fn update(&self, id: Uuid, patch: SessionPatch) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().await;

        let Some(session) = sessions.get_mut(&id) else {
            tracing::debug!("Update for unknown session {} ignored", id);
            return Ok(None);
        };

        if session.status.is_terminal() && !patch.is_empty() {
            return Err(AppError::InvalidTransition {
                from: session.status,
                to: patch.status.unwrap_or(session.status),
            });
        }

        if let Some(next) = patch.status {
            if next != session.status && !session.status.can_transition_to(next) {
                return Err(AppError::InvalidTransition {
                    from: session.status,
                    to: next,
                });
            }
            session.status = next;
        }

        if let Some(status_card_id) = patch.status_card_id {
            session.status_card_id = Some(status_card_id);
        }
        if let Some(params) = patch.params {
            session.params = Some(params);
        }
        if let Some(credential) = patch.credential {
            session.credential = Some(credential);
        }
        if let Some(message) = patch.status_message {
            session.status_message = Some(message);
        }
        if let Some(image) = patch.image {
            session.image = Some(image);
        }
        if let Some(error) = patch.error {
            session.error = Some(error);
        }
        if session.status.is_terminal() {
            // Nothing reads the key after a terminal state.
            session.credential = None;
        }

        session.updated_at = Utc::now();
        Ok(Some(session.clone()))
    }

    /// Deletes every session older than the configured lifetime.
    ///
    /// # Returns
    ///
    /// The number of sessions removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| now - session.created_at <= self.lifetime);
        before - sessions.len()
    }

    /// Returns the number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns `true` when no sessions are stored.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::generation::{GeneratedImage, GenerationParams};

    fn new_session(user: &str) -> NewSession {
        NewSession {
            user_id: user.to_string(),
            chat_id: "chat-1".to_string(),
            source_message_id: "msg-1".to_string(),
            status_card_id: None,
            prompt: "a lighthouse at dusk".to_string(),
            reference_image_ids: vec![],
        }
    }

    fn store() -> SessionStore {
        SessionStore::new(std::time::Duration::from_secs(30 * 60))
    }

    #[tokio::test]
    async fn create_assigns_unique_ids_and_initial_state() {
        let store = store();
        let a = store.create(new_session("u1")).await;
        let b = store.create(new_session("u1")).await;

        assert_ne!(a.id, b.id);
        assert_eq!(a.status, SessionStatus::AwaitingParameters);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get(a.id).await.unwrap().prompt, "a lighthouse at dusk");
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = store();
        let session = store.create(new_session("u1")).await;

        let updated = store
            .update(
                session.id,
                SessionPatch {
                    params: Some(GenerationParams::defaults("gpt-image-1")),
                    status_card_id: Some("card-9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status_card_id.as_deref(), Some("card-9"));
        assert_eq!(updated.params.unwrap().model, "gpt-image-1");
        assert_eq!(updated.prompt, session.prompt);
        assert_eq!(updated.status, SessionStatus::AwaitingParameters);
    }

    #[tokio::test]
    async fn update_unknown_id_is_noop() {
        let store = store();
        let result = store
            .update(Uuid::new_v4(), SessionPatch::status(SessionStatus::Done))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_without_mutation() {
        let store = store();
        let session = store.create(new_session("u1")).await;

        store
            .update(session.id, SessionPatch::status(SessionStatus::Generating))
            .await
            .unwrap();
        store
            .update(session.id, SessionPatch::status(SessionStatus::Done))
            .await
            .unwrap();

        let err = store
            .update(
                session.id,
                SessionPatch::status(SessionStatus::Generating).with_message("again"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: SessionStatus::Done,
                to: SessionStatus::Generating
            }
        ));
        let current = store.get(session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Done);
        assert!(current.status_message.is_none());
    }

    #[tokio::test]
    async fn finished_session_fields_are_frozen() {
        let store = store();
        let session = store.create(new_session("u1")).await;
        store
            .update(session.id, SessionPatch::status(SessionStatus::Generating))
            .await
            .unwrap();
        store
            .update(
                session.id,
                SessionPatch {
                    status: Some(SessionStatus::Done),
                    image: Some(GeneratedImage::from_bytes(vec![1, 2, 3])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update(
                session.id,
                SessionPatch {
                    status: Some(SessionStatus::Done),
                    image: Some(GeneratedImage::from_bytes(vec![9, 9, 9])),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: SessionStatus::Done,
                to: SessionStatus::Done
            }
        ));

        let err = store
            .update(
                session.id,
                SessionPatch {
                    error: Some("late failure".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let current = store.get(session.id).await.unwrap();
        assert_eq!(current.image.unwrap().bytes.as_slice(), &[1, 2, 3]);
        assert!(current.error.is_none());

        // An empty patch is still a harmless read.
        assert!(store.update(session.id, SessionPatch::default()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = store();
        let session = store.create(new_session("u1")).await;

        let first = store
            .claim(session.id, Credential::new("sk-first-12345"))
            .await
            .unwrap();
        let second = store
            .claim(session.id, Credential::new("sk-second-1234"))
            .await
            .unwrap();

        assert!(matches!(first, Claim::Claimed(ref s) if s.dispatched));
        assert!(matches!(second, Claim::AlreadyClaimed(_)));
        let current = store.get(session.id).await.unwrap();
        assert_eq!(current.credential.unwrap().expose(), "sk-first-12345");
        assert!(store.claim(Uuid::new_v4(), Credential::new("sk-nobody-1234")).await.is_none());
    }

    #[tokio::test]
    async fn terminal_state_drops_credential() {
        let store = store();
        let session = store.create(new_session("u1")).await;

        store
            .update(
                session.id,
                SessionPatch {
                    status: Some(SessionStatus::Generating),
                    credential: Some(Credential::new("sk-abcdefgh1234")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.get(session.id).await.unwrap().credential.is_some());

        store
            .update(session.id, SessionPatch::status(SessionStatus::Failed))
            .await
            .unwrap();
        assert!(store.get(session.id).await.unwrap().credential.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_sessions_past_lifetime_from_creation() {
        let store = store();
        let old = store.create(new_session("u1")).await;
        let fresh = store.create(new_session("u2")).await;

        {
            let mut sessions = store.sessions.write().await;
            sessions.get_mut(&old.id).unwrap().created_at = Utc::now() - Duration::minutes(31);
        }

        // Touching a session does not extend its lifetime.
        store
            .update(old.id, SessionPatch::default().with_message("still here"))
            .await
            .unwrap();

        assert_eq!(store.sweep().await, 1);
        assert!(store.get(old.id).await.is_none());
        assert!(store.get(fresh.id).await.is_some());

        let later = Utc::now() + Duration::minutes(31);
        assert_eq!(store.sweep_at(later).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_after_sweep_is_noop() {
        let store = store();
        let session = store.create(new_session("u1")).await;
        store.sweep_at(Utc::now() + Duration::hours(1)).await;

        let result = store
            .update(session.id, SessionPatch::status(SessionStatus::Failed))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
