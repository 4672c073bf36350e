use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::encrypted_cache::EncryptedCache;
use crate::error::{AppError, Result};
use crate::models::credential::Credential;
use crate::models::generation::{GenerationParams, GenerationRequest, ParamOverrides};
use crate::models::session::{NewSession, Session, SessionPatch, SessionStatus};
use crate::repositories::session::{Claim, SessionStore};
use crate::services::notifier::{StatusPublisher, StatusUpdate};
use crate::services::queue::{
    EnqueueResult, GenerationQueue, Job, JobOutcome, PositionUpdate, QueueObserver, QueueSnapshot,
    RejectReason,
};
use crate::services::runner::JobRunner;

/// Applies `patch` to the session and pushes the resulting status.
///
/// Unknown ids and rejected transitions are logged and otherwise ignored,
/// since completions can race with the expiry sweep.
async fn apply_and_publish(
    sessions: &SessionStore,
    publisher: &StatusPublisher,
    session_id: Uuid,
    patch: SessionPatch,
    queue_position: Option<(usize, usize)>,
) -> Option<Session> {
    let session = match sessions.update(session_id, patch).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::debug!("Session {} no longer exists; status not pushed", session_id);
            return None;
        }
        Err(e) => {
            tracing::warn!("Session {} not updated: {}", session_id, e);
            return None;
        }
    };

    let update = StatusUpdate {
        session_id,
        user_id: session.user_id.clone(),
        chat_id: session.chat_id.clone(),
        status_card_id: session.status_card_id.clone(),
        status: session.status,
        summary: session.status_message.clone().unwrap_or_default(),
        position: queue_position.map(|(position, _)| position),
        total: queue_position.map(|(_, total)| total),
    };

    publisher.publish(update);

    Some(session)
}

/// Keeps sessions and their status cards in step with the queue.
pub struct SessionObserver {
    sessions: SessionStore,
    publisher: StatusPublisher,
}

impl SessionObserver {
    pub fn new(sessions: SessionStore, publisher: StatusPublisher) -> Self {
        Self { sessions, publisher }
    }
}

#[async_trait]
impl QueueObserver for SessionObserver {
    async fn job_started(&self, session_id: Uuid) {
        apply_and_publish(
            &self.sessions,
            &self.publisher,
            session_id,
            SessionPatch::status(SessionStatus::Generating).with_message("🎨 Generating your image..."),
            Some((0, 0)),
        )
        .await;
    }

    async fn position_changed(&self, update: PositionUpdate) {
        apply_and_publish(
            &self.sessions,
            &self.publisher,
            update.session_id,
            SessionPatch::default().with_message(format!(
                "⏳ Waiting in queue: position {} of {}",
                update.position, update.total
            )),
            Some((update.position, update.total)),
        )
        .await;
    }
}

/// Result of accepting a generation request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub session: Session,
    /// Queue position when enqueued; `None` while waiting for a credential.
    pub position: Option<usize>,
}

/// Drives a request from creation to a terminal state.
#[derive(Clone)]
pub struct GenerationService {
    sessions: SessionStore,
    credentials: EncryptedCache<Credential>,
    queue: GenerationQueue,
    runner: Arc<dyn JobRunner>,
    publisher: StatusPublisher,
    defaults: GenerationParams,
}

impl GenerationService {
    pub fn new(
        sessions: SessionStore,
        credentials: EncryptedCache<Credential>,
        queue: GenerationQueue,
        runner: Arc<dyn JobRunner>,
        publisher: StatusPublisher,
        defaults: GenerationParams,
    ) -> Self {
        Self {
            sessions,
            credentials,
            queue,
            runner,
            publisher,
            defaults,
        }
    }

    /// Creates a session for an incoming request and queues it when the
    /// user already has a stored credential.
    ///
    /// # Arguments
    ///
    /// * `fields` - Who asked, where, and the prompt.
    /// * `overrides` - Requested generation parameters.
    ///
    /// # Returns
    ///
    /// The session and its queue position, `AppError::QueueFull` when the
    /// queue rejected it, or a validation error for bad parameters.
    pub async fn submit(&self, fields: NewSession, overrides: ParamOverrides) -> Result<Submission> {
        let params = self.defaults.clone().resolve(&overrides)?;
        let user_id = fields.user_id.clone();

        let session = self.sessions.create(fields).await;
        tracing::info!("📝 Session {} created for user {}", session.id, user_id);

        self.sessions
            .update(
                session.id,
                SessionPatch {
                    params: Some(params),
                    ..Default::default()
                },
            )
            .await?;

        match self.credentials.get(&user_id).await {
            Some(credential) => self.dispatch(session.id, credential).await,
            None => {
                let session = apply_and_publish(
                    &self.sessions,
                    &self.publisher,
                    session.id,
                    SessionPatch::status(SessionStatus::AwaitingCredential)
                        .with_message("🔑 An image API key is required to continue"),
                    None,
                )
                .await
                .ok_or(AppError::NotFound)?;

                Ok(Submission {
                    session,
                    position: None,
                })
            }
        }
    }

    /// Stores the session owner's credential and resumes the session if it
    /// was waiting for one.
    pub async fn provide_credential(&self, session_id: Uuid, api_key: String) -> Result<Submission> {
        let session = self.sessions.get(session_id).await.ok_or(AppError::NotFound)?;
        let credential = Credential::new(api_key);

        self.credentials.set(session.user_id.clone(), &credential).await;
        tracing::info!("🔑 Credential stored for user {}", session.user_id);

        if session.status == SessionStatus::AwaitingCredential {
            return self.dispatch(session_id, credential).await;
        }

        Ok(Submission {
            session,
            position: None,
        })
    }

    /// Hands the session to the admission queue.
    async fn dispatch(&self, session_id: Uuid, credential: Credential) -> Result<Submission> {
        let claim = self
            .sessions
            .claim(session_id, credential.clone())
            .await
            .ok_or(AppError::NotFound)?;
        let session = match claim {
            Claim::Claimed(session) => session,
            Claim::AlreadyClaimed(session) => {
                tracing::debug!("Session {} already dispatched; not queued again", session_id);
                return Ok(Submission {
                    session,
                    position: None,
                });
            }
        };

        let request = GenerationRequest {
            session_id,
            prompt: session.prompt.clone(),
            reference_image_ids: session.reference_image_ids.clone(),
            params: session
                .params
                .clone()
                .unwrap_or_else(|| self.defaults.clone()),
            credential,
        };

        match self.queue.enqueue(session_id, self.job(request)).await {
            EnqueueResult::Accepted { position } => {
                let session = self.sessions.get(session_id).await.unwrap_or(session);
                Ok(Submission {
                    session,
                    position: Some(position),
                })
            }
            EnqueueResult::Rejected { reason } => {
                apply_and_publish(
                    &self.sessions,
                    &self.publisher,
                    session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Failed),
                        error: Some(reason.to_string()),
                        status_message: Some(format!("🚦 Busy right now ({}), please try again later", reason)),
                        ..Default::default()
                    },
                    None,
                )
                .await;

                Err(match reason {
                    RejectReason::QueueFull => AppError::QueueFull,
                    RejectReason::Unavailable => AppError::QueueUnavailable,
                })
            }
        }
    }

    /// Builds the job that runs one generation and records its outcome.
    fn job(&self, request: GenerationRequest) -> Job {
        let runner = self.runner.clone();
        let sessions = self.sessions.clone();
        let publisher = self.publisher.clone();

        Box::pin(async move {
            let session_id = request.session_id;

            match runner.run(&request).await {
                Ok(image) => {
                    tracing::info!("✅ Image generated for session {}", session_id);
                    apply_and_publish(
                        &sessions,
                        &publisher,
                        session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Done),
                            image: Some(image),
                            status_message: Some("✅ Your image is ready".to_string()),
                            ..Default::default()
                        },
                        None,
                    )
                    .await;
                    JobOutcome::Succeeded
                }
                Err(e) => {
                    tracing::warn!("❌ Generation failed for session {}: {}", session_id, e);
                    apply_and_publish(
                        &sessions,
                        &publisher,
                        session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Failed),
                            error: Some(e.to_string()),
                            status_message: Some(format!("❌ Generation failed: {}", e)),
                            ..Default::default()
                        },
                        None,
                    )
                    .await;
                    JobOutcome::Failed
                }
            }
        })
    }

    /// Returns a copy of the session, if it is still alive.
    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.get(session_id).await
    }

    /// Stores `api_key` as the credential for `user_id`.
    pub async fn store_credential(&self, user_id: &str, api_key: String) {
        self.credentials
            .set(user_id.to_string(), &Credential::new(api_key))
            .await;
        tracing::info!("🔑 Credential stored for user {}", user_id);
    }

    /// Returns whether `user_id` has a live stored credential.
    pub async fn has_credential(&self, user_id: &str) -> bool {
        self.credentials.has(user_id).await
    }

    /// Removes the stored credential for `user_id`.
    pub async fn forget_credential(&self, user_id: &str) -> bool {
        self.credentials.delete(user_id).await
    }

    /// Returns the queue's running and waiting counts.
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot().await
    }

    /// Drops expired credentials and sessions.
    ///
    /// # Returns
    ///
    /// `(credentials_pruned, sessions_swept)`.
    pub async fn run_maintenance(&self) -> (usize, usize) {
        let pruned = self.credentials.prune().await;
        let swept = self.sessions.sweep().await;
        (pruned, swept)
    }
}
