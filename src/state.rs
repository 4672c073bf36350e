use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::Config;
use crate::encrypted_cache::EncryptedCache;
use crate::error::{AppError, Result};
use crate::models::credential::Credential;
use crate::models::generation::GenerationParams;
use crate::repositories::session::SessionStore;
use crate::services::generation::{GenerationService, SessionObserver};
use crate::services::notifier::{FanoutNotifier, LogNotifier, Notifier, RedisNotifier, StatusPublisher};
use crate::services::queue::{GenerationQueue, QueueLimits};
use crate::services::runner::{HttpJobRunner, JobRunner};

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Config,
    /// Sessions, credentials, and the admission queue.
    pub generation: GenerationService,
}

impl AppState {
    /// Creates a new `AppState` with the HTTP image runner and the
    /// configured notifiers.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    /// * `shutdown` - Cancelling this token stops the queue dispatcher.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState` and the dispatcher's handle.
    pub async fn new(config: &Config, shutdown: CancellationToken) -> Result<(Self, JoinHandle<()>)> {
        let runner = HttpJobRunner::new(config.image_api_url.as_str(), config.image_api_timeout)
            .map_err(|e| AppError::Internal(format!("HTTP client setup failed: {}", e)))?;
        tracing::info!("✅ Image runner initialized ({})", config.image_api_url);

        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = config.redis_url.as_deref() {
            let redis_client = redis::Client::open(url)?;
            let redis = ConnectionManager::new(redis_client).await?;
            notifiers.push(Arc::new(RedisNotifier::new(redis)));
            tracing::info!("✅ Redis Connection Manager initialized (status fan-out)");
        } else {
            tracing::info!("⚠️  REDIS_URL not set; status updates go to the log only");
        }

        Self::with_services(
            config,
            Arc::new(runner),
            Arc::new(FanoutNotifier::new(notifiers)),
            shutdown,
        )
    }

    /// Creates a new `AppState` around the given runner and notifier.
    ///
    /// Must be called inside a Tokio runtime; the queue dispatcher is spawned here.
    pub fn with_services(
        config: &Config,
        runner: Arc<dyn JobRunner>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let credentials = EncryptedCache::<Credential>::new(
            config.credential_cache_max_size,
            config.credential_cache_ttl,
            config.cache_secret.as_str(),
        )?;
        tracing::info!(
            "✅ Credential cache initialized (max {}, ttl {}s)",
            config.credential_cache_max_size,
            config.credential_cache_ttl.as_secs()
        );

        let sessions = SessionStore::new(config.session_ttl);
        tracing::info!("✅ Session store initialized (ttl {}s)", config.session_ttl.as_secs());

        let publisher = StatusPublisher::spawn(notifier);
        let observer = Arc::new(SessionObserver::new(sessions.clone(), publisher.clone()));
        let (queue, dispatcher) = GenerationQueue::start(
            QueueLimits {
                max_concurrency: config.max_concurrency,
                max_queue_length: config.max_queue_length,
            },
            observer,
            shutdown,
        )?;

        let generation = GenerationService::new(
            sessions,
            credentials,
            queue,
            runner,
            publisher,
            GenerationParams::defaults(&config.image_api_model),
        );

        Ok((
            AppState {
                config: config.clone(),
                generation,
            },
            dispatcher,
        ))
    }
}
