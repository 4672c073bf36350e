use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use zeroize::Zeroizing;

use crate::validation::config as checks;

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// The maximum number of generations running at once.
    pub max_concurrency: usize,
    /// The maximum number of generations waiting for a slot.
    pub max_queue_length: usize,
    /// The maximum number of cached credentials.
    pub credential_cache_max_size: usize,
    /// How long a cached credential lives after it was stored.
    pub credential_cache_ttl: Duration,
    /// The passphrase the credential cache key is derived from.
    pub cache_secret: Zeroizing<String>,
    /// How long a session lives after creation.
    pub session_ttl: Duration,
    /// How often expired credentials and sessions are swept.
    pub sweep_interval: Duration,
    /// The base URL of the image generation API.
    pub image_api_url: String,
    /// The default image model.
    pub image_api_model: String,
    /// The timeout for one generation request.
    pub image_api_timeout: Duration,
    /// The URL of the Redis server status updates are published to, if any.
    pub redis_url: Option<String>,
    /// Sustained per-IP request rate.
    pub rate_limit_per_second: u64,
    /// Per-IP burst allowance.
    pub rate_limit_burst: u32,
}

/// Reads `name`, falling back to `default` when unset.
fn var_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let cache_secret = Zeroizing::new(
            env::var("CACHE_SECRET")
                .context("CACHE_SECRET must be set (at least 8 characters)")?,
        );

        let config = Self {
            bind_addr: var_or("BIND_ADDR", "127.0.0.1:3000")?,
            max_concurrency: var_or("MAX_CONCURRENCY", "2")?,
            max_queue_length: var_or("MAX_QUEUE_LENGTH", "10")?,
            credential_cache_max_size: var_or("CREDENTIAL_CACHE_MAX_SIZE", "1000")?,
            credential_cache_ttl: Duration::from_secs(var_or("CREDENTIAL_CACHE_TTL_SECS", "86400")?),
            cache_secret,
            session_ttl: Duration::from_secs(var_or("SESSION_TTL_SECS", "1800")?),
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", "60")?),
            image_api_url: env::var("IMAGE_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            image_api_model: env::var("IMAGE_API_MODEL")
                .unwrap_or_else(|_| "gpt-image-1".to_string()),
            image_api_timeout: Duration::from_secs(var_or("IMAGE_API_TIMEOUT_SECS", "180")?),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            rate_limit_per_second: var_or("RATE_LIMIT_PER_SECOND", "2")?,
            rate_limit_burst: var_or("RATE_LIMIT_BURST", "10")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks every bound the core components rely on.
    pub fn validate(&self) -> Result<()> {
        checks::at_least("MAX_CONCURRENCY", self.max_concurrency as u64, 1)?;
        checks::at_least("MAX_QUEUE_LENGTH", self.max_queue_length as u64, 1)?;
        checks::at_least("CREDENTIAL_CACHE_MAX_SIZE", self.credential_cache_max_size as u64, 1)?;
        checks::at_least("SESSION_TTL_SECS", self.session_ttl.as_secs(), 1)?;
        checks::at_least("SWEEP_INTERVAL_SECS", self.sweep_interval.as_secs(), 1)?;
        checks::at_least("IMAGE_API_TIMEOUT_SECS", self.image_api_timeout.as_secs(), 1)?;
        checks::at_least("RATE_LIMIT_PER_SECOND", self.rate_limit_per_second, 1)?;
        checks::at_least("RATE_LIMIT_BURST", self.rate_limit_burst as u64, 1)?;
        checks::cache_secret(&self.cache_secret)?;
        checks::http_url("IMAGE_API_URL", &self.image_api_url)?;
        Ok(())
    }
}
