use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::crypto::aes::{self, Sealed, SecureKey};
use crate::error::{AppError, Result};

/// One encrypted value plus its timestamps.
struct CacheEntry {
    sealed: Sealed,
    /// Fixed at insertion; TTL is measured from here and never refreshed.
    created_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

/// A size-bounded, time-expiring key/value store that keeps every value
/// encrypted at rest with AES-256-GCM.
///
/// Values are serialized with bincode, sealed under a fresh nonce on each
/// `set`, and decrypted into an owned copy on each `get`. Expired, corrupted
/// or undecryptable entries are reported as misses and dropped. Capacity
/// eviction removes the least recently used entry.
pub struct EncryptedCache<V> {
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
    key: Arc<SecureKey>,
    ttl: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for EncryptedCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            key: self.key.clone(),
            ttl: self.ttl,
            _value: PhantomData,
        }
    }
}

impl<V> EncryptedCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Creates a new `EncryptedCache`.
    ///
    /// # Arguments
    ///
    /// * `max_size` - The maximum number of entries held at once.
    /// * `ttl` - How long an entry lives after it was set.
    /// * `secret` - A passphrase expanded into the AES-256 key.
    ///
    /// # Returns
    ///
    /// A `Result` containing the cache, or a validation error for a zero
    /// capacity or an empty secret.
    pub fn new(max_size: usize, ttl: Duration, secret: &str) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            AppError::Validation("Cache max size must be at least 1".to_string())
        })?;

        if secret.is_empty() {
            return Err(AppError::Validation(
                "Cache secret must not be empty".to_string(),
            ));
        }

        Ok(Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            key: Arc::new(SecureKey::from_passphrase(secret)),
            ttl,
            _value: PhantomData,
        })
    }

    /// Encrypts and stores `value` under `key`, replacing any previous entry.
    ///
    /// When the cache is full and `key` is new, the least recently used entry
    /// is evicted first.
    pub async fn set(&self, key: impl Into<String>, value: &V) {
        let key = key.into();

        let plaintext = match bincode::serde::encode_to_vec(value, bincode::config::standard()) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) => {
                tracing::warn!("Cache value serialization failed: {}", e);
                return;
            }
        };

        let sealed = match aes::encrypt(&self.key, &plaintext) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!("Cache value encryption failed: {}", e);
                return;
            }
        };

        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if entries.pop(&key).is_none() && entries.len() >= entries.cap().get() {
            if entries.pop_lru().is_some() {
                tracing::debug!("Evicted least recently used cache entry");
            }
        }

        entries.put(
            key,
            CacheEntry {
                sealed,
                created_at: now,
                last_accessed_at: now,
            },
        );
    }

    /// Returns a decrypted copy of the value under `key`.
    ///
    /// A hit marks the entry most recently used. Expired entries and entries
    /// that fail to decrypt or deserialize are removed and reported as `None`.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired = entries.peek(key)?.is_expired(now, self.ttl);
        if expired {
            entries.pop(key);
            tracing::debug!("Cache entry expired on read");
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_accessed_at = now;

        let plaintext = match aes::decrypt(&self.key, &entry.sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!("Dropping undecryptable cache entry: {}", e);
                entries.pop(key);
                return None;
            }
        };

        match bincode::serde::decode_from_slice::<V, _>(&plaintext, bincode::config::standard()) {
            Ok((value, _)) => Some(value),
            Err(e) => {
                tracing::warn!("Dropping undecodable cache entry: {}", e);
                entries.pop(key);
                None
            }
        }
    }

    /// Returns whether a live entry exists, without decrypting it or
    /// changing its recency.
    pub async fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.peek(key) {
            Some(entry) if entry.is_expired(now, self.ttl) => {
                entries.pop(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Removes `key`, returning whether an entry was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.pop(key).is_some()
    }

    /// Removes every expired entry.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key.as_str());
        }

        expired.len()
    }

    /// Returns the number of stored entries, including expired ones not yet pruned.
    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const SECRET: &str = "test-cache-secret";
    const TTL: Duration = Duration::from_secs(60);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        api_key: String,
        quota: u32,
        tags: Vec<String>,
    }

    fn profile(api_key: &str) -> Profile {
        Profile {
            api_key: api_key.to_string(),
            quota: 42,
            tags: vec!["beta".to_string()],
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_equal_value() {
        let cache = EncryptedCache::<Profile>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &profile("sk-one")).await;

        assert_eq!(cache.get("user-1").await, Some(profile("sk-one")));
        assert_eq!(cache.get("user-2").await, None);
    }

    #[tokio::test]
    async fn stored_bytes_are_not_plaintext() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"sk-very-secret-value".to_string()).await;

        let entries = cache.entries.lock().await;
        let entry = entries.peek("user-1").unwrap();
        let needle = b"sk-very-secret-value";
        assert!(!entry.sealed.ciphertext.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn overwrite_replaces_value_and_reseals() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"first".to_string()).await;
        let first_nonce = cache.entries.lock().await.peek("user-1").unwrap().sealed.nonce;

        cache.set("user-1", &"second".to_string()).await;
        let second_nonce = cache.entries.lock().await.peek("user-1").unwrap().sealed.nonce;

        assert_ne!(first_nonce, second_nonce);
        assert_eq!(cache.size().await, 1);
        assert_eq!(cache.get("user-1").await.as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_does_not_slide_on_reads() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"value".to_string()).await;

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(11)).await;
            assert!(cache.get("user-1").await.is_some());
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("user-1").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_live_exactly_at_ttl() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"value".to_string()).await;

        tokio::time::advance(TTL).await;
        assert!(cache.has("user-1").await);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.has("user-1").await);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_expires_once_time_moves() {
        let cache = EncryptedCache::<String>::new(4, Duration::ZERO, SECRET).unwrap();
        cache.set("user-1", &"value".to_string()).await;
        assert!(cache.has("user-1").await);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("user-1").await, None);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = EncryptedCache::<u32>::new(3, TTL, SECRET).unwrap();
        cache.set("a", &1).await;
        cache.set("b", &2).await;
        cache.set("c", &3).await;

        // Reading "a" makes "b" the least recently used.
        assert_eq!(cache.get("a").await, Some(1));
        cache.set("d", &4).await;

        assert_eq!(cache.size().await, 3);
        assert!(!cache.has("b").await);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
        assert_eq!(cache.get("d").await, Some(4));
    }

    #[tokio::test]
    async fn max_size_plus_one_inserts_leaves_max_size_entries() {
        let cache = EncryptedCache::<u32>::new(5, TTL, SECRET).unwrap();
        for i in 0..6u32 {
            cache.set(format!("key-{i}"), &i).await;
        }

        assert_eq!(cache.size().await, 5);
        assert!(!cache.has("key-0").await);
        assert!(cache.has("key-5").await);
    }

    #[tokio::test]
    async fn overwrite_at_capacity_does_not_evict_others() {
        let cache = EncryptedCache::<u32>::new(2, TTL, SECRET).unwrap();
        cache.set("a", &1).await;
        cache.set("b", &2).await;
        cache.set("a", &10).await;

        assert_eq!(cache.size().await, 2);
        assert_eq!(cache.get("b").await, Some(2));
        assert_eq!(cache.get("a").await, Some(10));
    }

    #[tokio::test]
    async fn has_does_not_refresh_recency() {
        let cache = EncryptedCache::<u32>::new(2, TTL, SECRET).unwrap();
        cache.set("a", &1).await;
        cache.set("b", &2).await;

        assert!(cache.has("a").await);
        cache.set("c", &3).await;

        assert!(!cache.has("a").await);
        assert!(cache.has("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn get_updates_last_accessed_at() {
        let cache = EncryptedCache::<u32>::new(2, TTL, SECRET).unwrap();
        cache.set("a", &1).await;
        let created = cache.entries.lock().await.peek("a").unwrap().created_at;

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.get("a").await;

        let entries = cache.entries.lock().await;
        let entry = entries.peek("a").unwrap();
        assert_eq!(entry.created_at, created);
        assert_eq!(entry.last_accessed_at, created + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tampered_ciphertext_reads_as_miss() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"sk-secret".to_string()).await;

        cache.entries.lock().await.peek_mut("user-1").unwrap().sealed.ciphertext[0] ^= 0x01;

        assert_eq!(cache.get("user-1").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn tampered_tag_reads_as_miss() {
        let cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"sk-secret".to_string()).await;

        cache.entries.lock().await.peek_mut("user-1").unwrap().sealed.tag[15] ^= 0x80;

        assert_eq!(cache.get("user-1").await, None);
        assert!(!cache.has("user-1").await);
    }

    #[tokio::test]
    async fn wrong_key_reads_as_miss() {
        let mut cache = EncryptedCache::<String>::new(4, TTL, SECRET).unwrap();
        cache.set("user-1", &"sk-secret".to_string()).await;

        cache.key = Arc::new(SecureKey::from_passphrase("a-different-secret"));

        assert_eq!(cache.get("user-1").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn undecodable_payload_reads_as_miss() {
        let cache = EncryptedCache::<Profile>::new(4, TTL, SECRET).unwrap();
        let sealed = aes::encrypt(&cache.key, &[0xff, 0xff, 0xff]).unwrap();
        let now = Instant::now();
        cache.entries.lock().await.put(
            "user-1".to_string(),
            CacheEntry {
                sealed,
                created_at: now,
                last_accessed_at: now,
            },
        );

        assert_eq!(cache.get("user-1").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_only_expired_entries() {
        let cache = EncryptedCache::<u32>::new(8, TTL, SECRET).unwrap();
        cache.set("old-1", &1).await;
        cache.set("old-2", &2).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        cache.set("fresh", &3).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.prune().await, 2);
        assert_eq!(cache.size().await, 1);
        assert_eq!(cache.get("fresh").await, Some(3));
        assert_eq!(cache.prune().await, 0);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let cache = EncryptedCache::<u32>::new(4, TTL, SECRET).unwrap();
        cache.set("a", &1).await;
        cache.set("b", &2).await;

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);
        assert_eq!(cache.size().await, 1);

        cache.clear().await;
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = EncryptedCache::<u32>::new(4, TTL, SECRET).unwrap();
        let other = cache.clone();
        cache.set("a", &1).await;

        assert_eq!(other.get("a").await, Some(1));
    }

    #[test]
    fn degenerate_construction_fails_fast() {
        assert!(EncryptedCache::<u32>::new(0, TTL, SECRET).is_err());
        assert!(EncryptedCache::<u32>::new(1, TTL, "").is_err());
        assert!(EncryptedCache::<u32>::new(1, Duration::ZERO, "x").is_ok());
    }
}
