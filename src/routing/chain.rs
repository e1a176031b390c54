use crate::proxy::context::{json_response, BoxBody, RequestContext};
use async_trait::async_trait;
use http::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a middleware's request phase.
pub enum MiddlewareOutcome {
    /// Continue with the next middleware, then the forwarder.
    Continue,
    /// Short-circuit: this response is final. Later middleware and the
    /// forwarder do not run.
    Abort(hyper::Response<BoxBody>),
}

impl MiddlewareOutcome {
    /// Abort with the standard JSON error body for `status`.
    pub fn abort(status: StatusCode) -> Self {
        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error").to_ascii_lowercase(),
            "status": status.as_u16(),
        });
        Self::Abort(json_response(status, body.to_string()))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }
}

impl std::fmt::Debug for MiddlewareOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => f.write_str("Continue"),
            Self::Abort(resp) => f.debug_tuple("Abort").field(&resp.status()).finish(),
        }
    }
}

/// A named request handler run before forwarding.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Request phase. Runs in configured order.
    async fn on_request(&self, ctx: &mut RequestContext) -> MiddlewareOutcome;

    /// Response phase. Runs in reverse order after the upstream answered.
    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        resp: hyper::Response<BoxBody>,
    ) -> hyper::Response<BoxBody> {
        resp
    }
}

/// Name → handler lookup used when routes are built.
#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    handlers: HashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Middleware>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Ordered handlers of one route, resolved once at build time.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    entries: Vec<(String, Arc<dyn Middleware>)>,
}

impl MiddlewareChain {
    /// Resolve `names` against `registry`. Unknown names are skipped.
    pub fn resolve(names: &[String], registry: &MiddlewareRegistry, route: &str) -> Self {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            match registry.get(name) {
                Some(handler) => entries.push((name.clone(), handler)),
                None => tracing::warn!(
                    "routing: middleware not found in registry, route={}, middleware={}",
                    route,
                    name
                ),
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run request phases in order, stopping at the first abort.
    pub async fn run_request(&self, ctx: &mut RequestContext) -> MiddlewareOutcome {
        for (name, handler) in &self.entries {
            if let MiddlewareOutcome::Abort(resp) = handler.on_request(ctx).await {
                tracing::debug!(
                    "routing: middleware aborted request, middleware={}, path={}, status={}",
                    name,
                    ctx.path,
                    resp.status().as_u16()
                );
                return MiddlewareOutcome::Abort(resp);
            }
        }
        MiddlewareOutcome::Continue
    }

    /// Run response phases in reverse order.
    pub async fn run_response(
        &self,
        ctx: &mut RequestContext,
        mut resp: hyper::Response<BoxBody>,
    ) -> hyper::Response<BoxBody> {
        for (_, handler) in self.entries.iter().rev() {
            resp = handler.on_response(ctx, resp).await;
        }
        resp
    }
}
