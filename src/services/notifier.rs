use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::session::SessionStatus;

/// A status change pushed to the requester's UI surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub session_id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub status_card_id: Option<String>,
    pub status: SessionStatus,
    pub summary: String,
    /// Queue position; `0` while running, absent once finished.
    pub position: Option<usize>,
    /// Number of waiters when `position` was computed.
    pub total: Option<usize>,
}

/// Pushes status updates to wherever the requester is watching.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, update: &StatusUpdate) -> Result<()>;
}

/// Writes updates to the log only.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, update: &StatusUpdate) -> Result<()> {
        tracing::info!(
            session_id = %update.session_id,
            chat_id = %update.chat_id,
            status = %update.status,
            position = ?update.position,
            total = ?update.total,
            "📣 {}",
            update.summary
        );
        Ok(())
    }
}

/// Publishes each update as JSON on `generation:status:{chat_id}`.
#[derive(Clone)]
pub struct RedisNotifier {
    redis: ConnectionManager,
}

impl RedisNotifier {
    /// Creates a new `RedisNotifier`.
    ///
    /// # Arguments
    ///
    /// * `redis` - A pooled Redis connection.
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Returns the channel updates for `chat_id` are published on.
    pub fn channel(chat_id: &str) -> String {
        format!("generation:status:{}", chat_id)
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, update: &StatusUpdate) -> Result<()> {
        let payload = sonic_rs::to_string(update)
            .map_err(|e| AppError::Internal(format!("Status serialization failed: {}", e)))?;

        let mut redis = self.redis.clone();
        let receivers: i64 = redis
            .publish(Self::channel(&update.chat_id), payload)
            .await?;

        tracing::debug!(
            "Status for session {} published to {} subscriber(s)",
            update.session_id,
            receivers
        );
        Ok(())
    }
}

/// Forwards every update to each inner notifier.
///
/// A failing notifier does not stop the others; the first error is returned.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, update: &StatusUpdate) -> Result<()> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(update).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Upper bound for a single notifier call.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Updates buffered for delivery before new ones are dropped.
const STATUS_BUFFER: usize = 1024;

enum Outbound {
    Update(StatusUpdate),
    Flush(oneshot::Sender<()>),
}

/// Delivers status updates in publish order from a dedicated task.
///
/// Publishing never waits on the notifier, so a slow or stuck UI surface
/// cannot hold up whoever produced the update.
#[derive(Clone)]
pub struct StatusPublisher {
    outbound: mpsc::Sender<Outbound>,
}

impl StatusPublisher {
    /// Spawns the delivery task for `notifier`.
    ///
    /// The task ends once every publisher handle is dropped.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (outbound, mut inbox) = mpsc::channel(STATUS_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                match message {
                    Outbound::Update(update) => {
                        match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&update)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::warn!(
                                "⚠️  Failed to notify session {}: {}",
                                update.session_id,
                                e
                            ),
                            Err(_) => tracing::warn!(
                                "⚠️  Notifying session {} timed out",
                                update.session_id
                            ),
                        }
                    }
                    Outbound::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { outbound }
    }

    /// Queues `update` for delivery without waiting.
    pub fn publish(&self, update: StatusUpdate) {
        let session_id = update.session_id;
        match self.outbound.try_send(Outbound::Update(update)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("⚠️  Status backlog full; update for session {} dropped", session_id)
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("⚠️  Status delivery stopped; update for session {} dropped", session_id)
            }
        }
    }

    /// Waits until every update published before this call has been handled.
    pub async fn flush(&self) {
        let (done, handled) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(done)).await.is_ok() {
            let _ = handled.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, update: &StatusUpdate) -> Result<()> {
            self.seen.lock().unwrap().push(update.summary.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _update: &StatusUpdate) -> Result<()> {
            Err(AppError::Internal("card deleted".to_string()))
        }
    }

    fn update() -> StatusUpdate {
        StatusUpdate {
            session_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            chat_id: "c1".to_string(),
            status_card_id: Some("card-1".to_string()),
            status: SessionStatus::Generating,
            summary: "Generating your image".to_string(),
            position: Some(0),
            total: Some(0),
        }
    }

    #[tokio::test]
    async fn fanout_reaches_every_notifier_despite_failures() {
        let recording = Arc::new(Recording::default());
        let fanout = FanoutNotifier::new(vec![
            Arc::new(Broken),
            recording.clone(),
            Arc::new(LogNotifier),
        ]);

        let result = fanout.notify(&update()).await;

        assert!(matches!(result, Err(AppError::Internal(_))));
        assert_eq!(*recording.seen.lock().unwrap(), vec!["Generating your image".to_string()]);
    }

    struct Stalled;

    #[async_trait]
    impl Notifier for Stalled {
        async fn notify(&self, _update: &StatusUpdate) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_delivers_in_order() {
        let recording = Arc::new(Recording::default());
        let publisher = StatusPublisher::spawn(recording.clone());

        for summary in ["queued", "generating", "done"] {
            publisher.publish(StatusUpdate {
                summary: summary.to_string(),
                ..update()
            });
        }
        publisher.flush().await;

        assert_eq!(*recording.seen.lock().unwrap(), vec!["queued", "generating", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_returns_while_notifier_is_stuck() {
        let publisher = StatusPublisher::spawn(Arc::new(Stalled));

        for _ in 0..3 {
            publisher.publish(update());
        }

        // Each stuck delivery is cut off by the timeout, so a flush still completes.
        publisher.flush().await;
    }

    #[test]
    fn update_serializes_snake_case_status() {
        let json = sonic_rs::to_string(&update()).unwrap();
        assert!(json.contains(r#""status":"generating""#));
        assert!(json.contains(r#""status_card_id":"card-1""#));
    }

    #[test]
    fn channel_is_keyed_by_chat() {
        assert_eq!(RedisNotifier::channel("chat-42"), "generation:status:chat-42");
    }
}
