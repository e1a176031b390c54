pub mod store;

pub use store::{CacheStore, MemoryCacheStore};

use crate::config::{CacheRule, CachingConfig};
use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::routing::{Middleware, MiddlewareOutcome};
use async_trait::async_trait;
use base64::Engine;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use hyper::body::Body as _;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Stored form of a cached upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    /// Base64 of the raw body bytes.
    pub body: String,
}

impl CachedResponse {
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.body)
    }
}

/// Headers that describe the original connection and must not be replayed.
const SKIPPED_HEADERS: &[&str] = &["connection", "transfer-encoding", "keep-alive"];

/// Carried from the request phase to the response phase when the response
/// should be stored.
#[derive(Clone)]
struct PendingStore {
    key: String,
    path: String,
    target: String,
    ttl: Duration,
}

/// Response cache for hot GET paths.
///
/// Every matching request bumps a per-path counter. A cached entry is served
/// directly. Once the counter reaches the rule's threshold, 200 responses are
/// captured and stored for the rule's TTL.
pub struct CacheMiddleware {
    config: CachingConfig,
    store: Arc<dyn CacheStore>,
}

impl CacheMiddleware {
    pub fn new(config: CachingConfig, store: Arc<dyn CacheStore>) -> Self {
        Self { config, store }
    }

    fn rule_for(&self, ctx: &RequestContext) -> Option<&CacheRule> {
        if !self.config.enabled || ctx.method != Method::GET {
            return None;
        }
        self.config
            .rule_for(&ctx.path)
            .filter(|rule| rule.method.eq_ignore_ascii_case(ctx.method.as_str()))
    }
}

/// Path plus the query with parameters sorted by name.
pub fn cache_key(path: &str, query: Option<&str>) -> String {
    let mut pairs: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort_by(|a, b| {
        let ka = a.split('=').next().unwrap_or("");
        let kb = b.split('=').next().unwrap_or("");
        ka.cmp(kb)
    });
    format!("{}?{}", path, pairs.join("&"))
}

fn first_target(ctx: &RequestContext) -> String {
    ctx.route
        .as_ref()
        .and_then(|r| r.balancer.targets().into_iter().next())
        .map(|t| t.address().to_string())
        .unwrap_or_default()
}

fn cached_to_response(cached: CachedResponse, body: Vec<u8>) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    for (name, values) in cached.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), v);
            }
        }
    }
    resp
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn on_request(&self, ctx: &mut RequestContext) -> MiddlewareOutcome {
        let Some(rule) = self.rule_for(ctx) else {
            return MiddlewareOutcome::Continue;
        };
        let ttl = Duration::from_secs(rule.ttl_secs);
        let threshold = rule.threshold;
        let key = cache_key(&ctx.path, ctx.query.as_deref());
        let target = first_target(ctx);
        let method = ctx.method.as_str();

        let count = self.store.increment_request_count(&ctx.path, ttl).await;
        tracing::debug!("cache: request counted, path={}, count={}", ctx.path, count);

        if let Some(content) = self.store.check_cache(method, &key, &target).await {
            let decoded = serde_json::from_str::<CachedResponse>(&content)
                .map_err(|e| e.to_string())
                .and_then(|cached| {
                    let body = cached.body_bytes().map_err(|e| e.to_string())?;
                    Ok((cached, body))
                });
            match decoded {
                Ok((cached, body)) => {
                    metrics::counter!(
                        "gateway_cache_hits_total",
                        "method" => method.to_owned(),
                        "path" => ctx.path.clone(),
                        "target" => target,
                    )
                    .increment(1);
                    return MiddlewareOutcome::Abort(cached_to_response(cached, body));
                }
                Err(e) => {
                    tracing::warn!("cache: corrupt entry ignored, key={}, error={}", key, e);
                }
            }
        }

        if count >= threshold {
            ctx.extensions.insert(PendingStore {
                key,
                path: ctx.path.clone(),
                target,
                ttl,
            });
        }
        MiddlewareOutcome::Continue
    }

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        resp: hyper::Response<BoxBody>,
    ) -> hyper::Response<BoxBody> {
        let Some(pending) = ctx.extensions.remove::<PendingStore>() else {
            return resp;
        };
        metrics::counter!(
            "gateway_cache_misses_total",
            "method" => ctx.method.as_str().to_owned(),
            "path" => pending.path.clone(),
            "target" => pending.target.clone(),
        )
        .increment(1);

        if resp.status() != StatusCode::OK {
            return resp;
        }
        // Unknown or oversized lengths stream through untouched.
        match resp.body().size_hint().upper() {
            Some(len) if len <= self.config.max_body_bytes => {}
            _ => {
                tracing::debug!(
                    "cache: body too large to store, key={}, limit={}",
                    pending.key,
                    self.config.max_body_bytes
                );
                return resp;
            }
        }

        let (parts, body) = resp.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return ctx.error_response(&GatewayError::UpstreamConnect(format!(
                    "reading upstream body: {}",
                    e
                )));
            }
        };

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                headers.entry(name.as_str().to_string()).or_default().push(v.to_string());
            }
        }
        let cached = CachedResponse {
            status: parts.status.as_u16(),
            headers,
            body: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };

        match serde_json::to_string(&cached) {
            Ok(content) => {
                if let Err(e) = self
                    .store
                    .set_cache(ctx.method.as_str(), &pending.key, content, pending.ttl)
                    .await
                {
                    tracing::error!("cache: store failed, key={}, error={}", pending.key, e);
                }
            }
            Err(e) => tracing::error!("cache: serialize failed, key={}, error={}", pending.key, e),
        }

        hyper::Response::from_parts(parts, full_body(bytes))
    }
}
