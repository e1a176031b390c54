pub mod client;

pub use client::{ConsulClient, ConsulServiceNode};

use crate::balancer::{LoadBalancer, Target};
use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Source of healthy instances for a named service.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    async fn healthy_targets(&self, service: &str) -> Result<Vec<Target>, GatewayError>;
}

/// Keeps registry-backed balancers in step with a [`ServiceDirectory`].
pub struct RegistrySync {
    directory: Arc<dyn ServiceDirectory>,
    /// Balancers grouped by service so each service is queried once per round.
    by_service: HashMap<String, Vec<Arc<LoadBalancer>>>,
    concurrency: usize,
}

impl RegistrySync {
    pub fn new(
        directory: Arc<dyn ServiceDirectory>,
        balancers: Vec<Arc<LoadBalancer>>,
        concurrency: usize,
    ) -> Self {
        let mut by_service: HashMap<String, Vec<Arc<LoadBalancer>>> = HashMap::new();
        for lb in balancers {
            if let Some(service) = lb.service() {
                by_service.entry(service.to_string()).or_default().push(Arc::clone(&lb));
            }
        }
        Self {
            directory,
            by_service,
            concurrency: concurrency.max(1),
        }
    }

    pub fn service_count(&self) -> usize {
        self.by_service.len()
    }

    /// Query every service once and swap in the answers. A failed query keeps
    /// the previous target set. Returns the number of services updated.
    pub async fn sync_once(&self) -> usize {
        let services: Vec<String> = self.by_service.keys().cloned().collect();
        let results: Vec<(String, Result<Vec<Target>, GatewayError>, Duration)> =
            stream::iter(services)
                .map(|service| {
                    let directory = Arc::clone(&self.directory);
                    async move {
                        let start = Instant::now();
                        let res = directory.healthy_targets(&service).await;
                        (service, res, start.elapsed())
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut updated = 0;
        for (service, res, took) in results {
            match res {
                Ok(targets) => {
                    tracing::info!(
                        "discovery: service updated, service={}, targets={}, duration={:.3}s",
                        service,
                        targets.len(),
                        took.as_secs_f64()
                    );
                    metrics::counter!(
                        "gateway_registry_poll_total",
                        "service_name" => service.to_string(),
                        "result" => "success",
                    )
                    .increment(1);
                    metrics::gauge!(
                        "gateway_registry_targets",
                        "service_name" => service.to_string(),
                    )
                    .set(targets.len() as f64);

                    if let Some(balancers) = self.by_service.get(&service) {
                        for lb in balancers {
                            lb.update_targets(targets.clone());
                        }
                    }
                    updated += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "discovery: query failed, keeping previous targets, service={}, error={}",
                        service,
                        e
                    );
                    metrics::counter!(
                        "gateway_registry_poll_total",
                        "service_name" => service.to_string(),
                        "result" => "error",
                    )
                    .increment(1);
                }
            }
        }
        updated
    }

    /// Poll every `interval` until `shutdown` fires. The first round runs
    /// immediately.
    pub fn start(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if self.by_service.is_empty() {
                tracing::debug!("discovery: no registry-backed routes, sync loop not started");
                return;
            }
            loop {
                let updated = self.sync_once().await;
                tracing::debug!(
                    "discovery: poll completed, updated={}, services={}",
                    updated,
                    self.by_service.len()
                );

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => {
                        tracing::info!("discovery: sync loop stopped");
                        return;
                    }
                }
            }
        })
    }
}
