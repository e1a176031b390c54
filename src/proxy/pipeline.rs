use crate::balancer::SelectContext;
use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::forward::Forwarder;
use crate::routing::{MiddlewareOutcome, Route, RouteTable};
use crate::telemetry::RequestTracer;
use crate::traffic::MultiDimensionalLimiter;
use http::{Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

/// Per-request flow: resolve → limit → middleware chain → select → forward.
///
/// Every per-request error is turned into a JSON response here; nothing
/// below this boundary panics on bad input.
pub struct DispatchPipeline {
    table: Arc<RouteTable>,
    limiter: Arc<MultiDimensionalLimiter>,
    forwarder: Arc<dyn Forwarder>,
    tracer: Arc<dyn RequestTracer>,
    max_wait: Duration,
    shutdown: CancellationToken,
}

impl DispatchPipeline {
    pub fn new(
        table: Arc<RouteTable>,
        limiter: Arc<MultiDimensionalLimiter>,
        forwarder: Arc<dyn Forwarder>,
        tracer: Arc<dyn RequestTracer>,
        max_wait: Duration,
    ) -> Self {
        Self {
            table,
            limiter,
            forwarder,
            tracer,
            max_wait,
            shutdown: CancellationToken::new(),
        }
    }

    /// Requests in flight observe `Cancelled` once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub async fn dispatch(&self, req: Request<BoxBody>, peer: SocketAddr) -> Response<BoxBody> {
        let (mut parts, body) = req.into_parts();
        let headers = std::mem::take(&mut parts.headers);
        let mut ctx = RequestContext::new(
            parts.method.clone(),
            parts.uri.path().to_string(),
            parts.uri.query().map(str::to_string),
            headers,
            peer,
        );
        ctx.cancel = self.shutdown.child_token();

        let Some(route) = self.table.resolve(&ctx.path, &ctx.method) else {
            return self.finish(&ctx, ctx.error_response(&GatewayError::NoRouteMatch));
        };
        ctx.route = Some(Arc::clone(&route));

        if let Err(e) = self.admit(&ctx, &route).await {
            return self.finish(&ctx, ctx.error_response(&e));
        }

        let span = self.tracer.start_span(ctx.method.as_str(), &ctx.path);
        let resp = self
            .run_chain(&mut ctx, &route, parts, body)
            .instrument(span.clone())
            .await;
        self.tracer
            .end_span(&span, resp.status().as_u16(), ctx.start.elapsed());

        self.finish(&ctx, resp)
    }

    /// Wait for rate-limit admission, bounded by `max_wait`.
    async fn admit(&self, ctx: &RequestContext, route: &Route) -> Result<(), GatewayError> {
        if !self.limiter.is_enabled() {
            return Ok(());
        }
        let waited = tokio::time::timeout(
            self.max_wait,
            self.limiter.acquire(&ctx.client_ip, route.path(), &ctx.cancel),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        metrics::histogram!(
            "gateway_rate_limit_wait_seconds",
            "route" => route.path().to_owned(),
        )
        .record(waited.as_secs_f64());
        Ok(())
    }

    async fn run_chain(
        &self,
        ctx: &mut RequestContext,
        route: &Route,
        mut parts: http::request::Parts,
        body: BoxBody,
    ) -> Response<BoxBody> {
        if let MiddlewareOutcome::Abort(resp) = route.chain.run_request(ctx).await {
            return resp;
        }

        let key = route.hash_on.key(&ctx.client_ip, &ctx.path, &ctx.headers).to_string();
        let target = match route.balancer.select(&SelectContext::with_key(&key)) {
            Ok(t) => t,
            Err(e) => {
                metrics::counter!(
                    "gateway_lb_no_target_total",
                    "route" => route.path().to_owned(),
                )
                .increment(1);
                return ctx.error_response(&e);
            }
        };
        ctx.upstream_addr.clear();
        ctx.upstream_addr.push_str(target.address());

        // Middleware may have rewritten method, path, query or headers.
        parts.method = ctx.method.clone();
        parts.uri = match origin_form(&ctx.path, ctx.query.as_deref()) {
            Ok(uri) => uri,
            Err(e) => return ctx.error_response(&e),
        };
        parts.headers = std::mem::take(&mut ctx.headers);
        let req = Request::from_parts(parts, body);

        let resp = match self.forwarder.forward(&target, req, ctx).await {
            Ok(resp) => resp,
            Err(e) => return ctx.error_response(&e),
        };

        route.chain.run_response(ctx, resp).await
    }

    fn finish(&self, ctx: &RequestContext, resp: Response<BoxBody>) -> Response<BoxBody> {
        let status = resp.status().as_u16();
        info!(
            "access: method={}, path={}, route={}, status={}, upstream={}, client_ip={}, duration_ms={}",
            ctx.method,
            ctx.path,
            ctx.route_path(),
            status,
            ctx.upstream_addr,
            ctx.client_ip,
            ctx.start.elapsed().as_millis()
        );
        ctx.finalize_metrics(status);
        resp
    }
}

fn origin_form(path: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
    let raw = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    };
    raw.parse()
        .map_err(|e| GatewayError::Internal(format!("rebuilding request uri {}: {}", raw, e)))
}
