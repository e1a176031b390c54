use crate::error::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Backing store for the response cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Increment the request counter for `path` and return the new value.
    /// The counter expires `ttl` after it was first created.
    async fn increment_request_count(&self, path: &str, ttl: Duration) -> u64;

    /// Cached content for `method` + `key`, if present and not expired.
    async fn check_cache(&self, method: &str, key: &str, target: &str) -> Option<String>;

    async fn set_cache(
        &self,
        method: &str,
        key: &str,
        content: String,
        ttl: Duration,
    ) -> Result<(), GatewayError>;
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

/// In-process [`CacheStore`] with lazy expiry. Entries are keyed by method
/// and key only; the target is not part of the key.
#[derive(Default)]
pub struct MemoryCacheStore {
    counters: DashMap<String, Expiring<u64>>,
    entries: DashMap<String, Expiring<String>>,
}

fn entry_key(method: &str, key: &str) -> String {
    let mut k = String::with_capacity(method.len() + key.len() + 1);
    k.push_str(method);
    k.push(' ');
    k.push_str(key);
    k
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired counters and entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, v| v.expires_at > now);
        self.entries.retain(|_, v| v.expires_at > now);
    }

    /// Spawn a background task that purges expired data every `interval`.
    pub fn start_purge(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.purge_expired(),
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn increment_request_count(&self, path: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(path.to_string())
            .or_insert_with(|| Expiring {
                value: 0,
                expires_at: now + ttl,
            });
        if counter.expires_at <= now {
            counter.value = 0;
            counter.expires_at = now + ttl;
        }
        counter.value += 1;
        counter.value
    }

    async fn check_cache(&self, method: &str, key: &str, _target: &str) -> Option<String> {
        let k = entry_key(method, key);
        let now = Instant::now();
        {
            let entry = self.entries.get(&k)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(&k, |_, v| v.expires_at <= now);
        None
    }

    async fn set_cache(
        &self,
        method: &str,
        key: &str,
        content: String,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        if ttl.is_zero() {
            return Err(GatewayError::Cache(format!("zero ttl for key {}", key)));
        }
        self.entries.insert(
            entry_key(method, key),
            Expiring {
                value: content,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires() {
        let store = MemoryCacheStore::new();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.increment_request_count("/a", ttl).await, 1);
        assert_eq!(store.increment_request_count("/a", ttl).await, 2);
        assert_eq!(store.increment_request_count("/b", ttl).await, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.increment_request_count("/a", ttl).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let store = MemoryCacheStore::new();
        store
            .set_cache("GET", "/a?x=1", "body".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.check_cache("GET", "/a?x=1", "http://t").await.as_deref(), Some("body"));
        assert!(store.check_cache("POST", "/a?x=1", "http://t").await.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.check_cache("GET", "/a?x=1", "http://t").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = MemoryCacheStore::new();
        assert!(store.set_cache("GET", "/a", "x".into(), Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCacheStore::new();
        store.set_cache("GET", "/a", "x".into(), Duration::from_secs(1)).await.unwrap();
        store.set_cache("GET", "/b", "y".into(), Duration::from_secs(100)).await.unwrap();
        store.increment_request_count("/a", Duration::from_secs(1)).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();
        assert_eq!(store.len(), 1);
        assert!(store.counters.is_empty());
    }
}
