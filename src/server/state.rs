use crate::cache::{CacheMiddleware, MemoryCacheStore};
use crate::config::GatewayConfig;
use crate::discovery::{ConsulClient, RegistrySync};
use crate::proxy::{DispatchPipeline, Forwarder, HttpForwarder};
use crate::routing::{MiddlewareRegistry, RouteTable};
use crate::telemetry::{Metrics, RequestTracer, SpanTracer};
use crate::traffic::MultiDimensionalLimiter;
use crate::upstream::DefaultNormalizer;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything the proxy and admin servers share. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: Arc<DispatchPipeline>,
    pub limiter: Arc<MultiDimensionalLimiter>,
    pub cache_store: Arc<MemoryCacheStore>,
    /// `None` when no route is registry-backed.
    pub registry_sync: Option<Arc<RegistrySync>>,
    pub metrics: Metrics,
}

impl GatewayState {
    /// Build the dispatch core with the default forwarder and tracer.
    pub fn new(config: GatewayConfig, metrics: Metrics, shutdown: &CancellationToken) -> Result<Self> {
        let forwarder: Arc<dyn Forwarder> = Arc::new(HttpForwarder::new(&config.proxy));
        Self::with_forwarder(config, metrics, forwarder, shutdown)
    }

    pub fn with_forwarder(
        config: GatewayConfig,
        metrics: Metrics,
        forwarder: Arc<dyn Forwarder>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let cache_store = Arc::new(MemoryCacheStore::new());
        let mut middlewares = MiddlewareRegistry::new();
        middlewares.register(
            "cache",
            Arc::new(CacheMiddleware::new(config.caching.clone(), cache_store.clone())),
        );

        let table = Arc::new(RouteTable::build(&config, &middlewares, &DefaultNormalizer)?);
        info!(
            "server: route table ready, exact={}, regex={}",
            table.exact_count(),
            table.regex_count()
        );

        let registry_balancers = table.registry_balancers();
        let registry_sync = if registry_balancers.is_empty() {
            None
        } else {
            let client = Arc::new(ConsulClient::new(&config.consul)?);
            Some(Arc::new(RegistrySync::new(
                client,
                registry_balancers,
                config.consul.concurrency,
            )))
        };

        let limiter = Arc::new(
            MultiDimensionalLimiter::new(&config.traffic.rate_limit)
                .with_route_prefix(&config.routing.prefix),
        );
        let tracer: Arc<dyn RequestTracer> = Arc::new(SpanTracer);
        let pipeline = DispatchPipeline::new(
            Arc::clone(&table),
            Arc::clone(&limiter),
            forwarder,
            tracer,
            Duration::from_millis(config.traffic.rate_limit.max_wait_ms),
        )
        .with_shutdown(shutdown.clone());

        Ok(Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            limiter,
            cache_store,
            registry_sync,
            metrics,
        })
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        self.pipeline.table()
    }
}
