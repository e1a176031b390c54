use super::token_bucket::TokenBucket;
use crate::config::{RateLimitConfig, ScopeLimit};
use crate::error::GatewayError;
use crate::routing::table::join_prefix;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dimension a bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Global,
    Ip,
    Route,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitScope::Global => write!(f, "global"),
            RateLimitScope::Ip => write!(f, "ip"),
            RateLimitScope::Route => write!(f, "route"),
        }
    }
}

struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    /// Microseconds since the limiter's epoch. Updated outside any lock.
    last_access: AtomicU64,
}

/// Rate limiting along three dimensions at once: one process-wide bucket,
/// one bucket per client IP and one bucket per route.
///
/// A request must obtain a token from every enabled dimension in turn, so
/// waits add up. Per-IP and per-route buckets are created lazily on first
/// use with either the key's override or the global defaults.
///
/// **GC**: buckets idle for `idle_expire_secs` are evicted by
/// [`start_gc`](Self::start_gc). When the registry still holds more than
/// `max_entries` after that, the least recently used are dropped.
pub struct MultiDimensionalLimiter {
    enabled: bool,
    qps: f64,
    burst: u64,
    global: Option<Arc<TokenBucket>>,
    ip_limits: HashMap<String, ScopeLimit>,
    route_limits: HashMap<String, ScopeLimit>,
    registry: DashMap<(RateLimitScope, String), Arc<LimiterEntry>>,
    idle_expire: Duration,
    gc_interval: Duration,
    max_entries: usize,
    epoch: Instant,
}

impl MultiDimensionalLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let global = (config.enabled && config.global_enabled)
            .then(|| Arc::new(TokenBucket::new(config.qps, config.burst)));
        Self {
            enabled: config.enabled,
            qps: config.qps,
            burst: config.burst,
            global,
            ip_limits: config.ip_limits.clone(),
            route_limits: config.route_limits.clone(),
            registry: DashMap::new(),
            idle_expire: Duration::from_secs(config.idle_expire_secs),
            gc_interval: Duration::from_secs(config.gc_interval_secs.max(1)),
            max_entries: config.max_entries,
            epoch: Instant::now(),
        }
    }

    /// Route overrides are written against route paths as configured; the
    /// table serves them under `prefix`, so the keys are joined the same way.
    pub fn with_route_prefix(mut self, prefix: &str) -> Self {
        self.route_limits = self
            .route_limits
            .into_iter()
            .map(|(path, limit)| (join_prefix(prefix, &path), limit))
            .collect();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Obtain one token from the global, ip and route dimensions, in that
    /// order. Returns the total time spent waiting.
    ///
    /// Tokens already granted by earlier dimensions are not returned when a
    /// later wait is cancelled.
    pub async fn acquire(
        &self,
        client_ip: &str,
        route_path: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration, GatewayError> {
        if !self.enabled {
            return Ok(Duration::ZERO);
        }
        let start = Instant::now();

        if let Some(global) = &self.global {
            global.take_or_cancel(cancel).await?;
        }

        if let Some((qps, burst)) = self.limits_for(&self.ip_limits, client_ip) {
            let bucket = self.get_or_create_limiter(RateLimitScope::Ip, client_ip, qps, burst);
            bucket.take_or_cancel(cancel).await?;
        }

        if let Some((qps, burst)) = self.limits_for(&self.route_limits, route_path) {
            let bucket = self.get_or_create_limiter(RateLimitScope::Route, route_path, qps, burst);
            bucket.take_or_cancel(cancel).await?;
        }

        let waited = start.elapsed();
        if !waited.is_zero() {
            tracing::debug!(
                "traffic: admission delayed, ip={}, route={}, waited_ms={}",
                client_ip,
                route_path,
                waited.as_millis()
            );
        }
        Ok(waited)
    }

    /// Override for `key`, or the global defaults. `None` exempts the key.
    fn limits_for(&self, overrides: &HashMap<String, ScopeLimit>, key: &str) -> Option<(f64, u64)> {
        match overrides.get(key) {
            Some(limit) if !limit.enabled => None,
            Some(limit) => Some((limit.qps, limit.burst)),
            None => Some((self.qps, self.burst)),
        }
    }

    /// Return the bucket for `(scope, key)`, creating it with `qps`/`burst` if
    /// absent. Concurrent first callers all receive the same bucket; the
    /// parameters of whichever caller created it win.
    pub fn get_or_create_limiter(
        &self,
        scope: RateLimitScope,
        key: &str,
        qps: f64,
        burst: u64,
    ) -> Arc<TokenBucket> {
        if scope == RateLimitScope::Global {
            if let Some(global) = &self.global {
                return Arc::clone(global);
            }
        }

        let now = self.now_us();
        // Fast path: key already exists, no allocation.
        let entry = if let Some(entry) = self.registry.get(&(scope, key.to_string())) {
            entry.value().clone()
        } else {
            self.registry
                .entry((scope, key.to_string()))
                .or_insert_with(|| {
                    Arc::new(LimiterEntry {
                        bucket: Arc::new(TokenBucket::new(qps, burst)),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };
        entry.last_access.store(now, Ordering::Relaxed);
        Arc::clone(&entry.bucket)
    }

    /// Existing bucket for `(scope, key)`, if any.
    pub fn bucket(&self, scope: RateLimitScope, key: &str) -> Option<Arc<TokenBucket>> {
        if scope == RateLimitScope::Global {
            return self.global.clone();
        }
        self.registry
            .get(&(scope, key.to_string()))
            .map(|e| Arc::clone(&e.bucket))
    }

    /// Number of lazily created ip and route buckets.
    pub fn entry_count(&self) -> usize {
        self.registry.len()
    }

    /// Spawn a background task that periodically evicts idle buckets until
    /// `shutdown` fires.
    pub fn start_gc(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.gc_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.evict_stale(),
                    _ = shutdown.cancelled() => {
                        tracing::debug!("traffic: gc stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Remove buckets not used for `idle_expire`, then force-evict the least
    /// recently used until at most `max_entries` remain.
    pub fn evict_stale(&self) {
        let now = self.now_us();
        let expire_us = self.idle_expire.as_micros() as u64;
        let before = self.registry.len();

        self.registry
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        if self.registry.len() > self.max_entries {
            self.force_evict(now);
        }

        let evicted = before.saturating_sub(self.registry.len());
        if evicted > 0 {
            tracing::debug!(
                "traffic: evicted idle buckets, evicted={}, remaining={}",
                evicted,
                self.registry.len()
            );
        }
    }

    fn force_evict(&self, now: u64) {
        let overflow = self.registry.len().saturating_sub(self.max_entries);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<((RateLimitScope, String), u64)> = self
            .registry
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (r.key().clone(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.registry.remove(&key);
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}
