use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Admission delays run from nothing up to the wait budget.
const WAIT_BUCKETS: &[f64] = &[0.0, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

/// Thin handle around the Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros can be used anywhere
/// in the codebase. The handle is retained for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    fn builder() -> Result<PrometheusBuilder> {
        Ok(PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full("gateway_rate_limit_wait_seconds".to_string()),
                WAIT_BUCKETS,
            )?)
    }

    /// Install the global Prometheus recorder and register metric descriptions.
    /// Call once at startup.
    pub fn install() -> Result<Self> {
        let handle = Self::builder()?.install_recorder()?;
        describe_all();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Renders nothing the macros
    /// record; used where a handle is needed without owning the process-wide
    /// recorder.
    pub fn unregistered() -> Result<Self> {
        let recorder = Self::builder()?.build_recorder();
        Ok(Self {
            handle: recorder.handle(),
        })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );

    // traffic shaping
    describe_histogram!(
        "gateway_rate_limit_wait_seconds",
        Unit::Seconds,
        "Admission delay imposed by the rate limiter"
    );

    // load balancing
    describe_counter!(
        "gateway_lb_no_target_total",
        Unit::Count,
        "Requests that found no upstream target"
    );

    // service discovery
    describe_counter!(
        "gateway_registry_poll_total",
        Unit::Count,
        "Total service directory queries"
    );
    describe_gauge!(
        "gateway_registry_targets",
        Unit::Count,
        "Healthy targets per discovered service"
    );

    // cache
    describe_counter!(
        "gateway_cache_hits_total",
        Unit::Count,
        "Requests served from the response cache"
    );
    describe_counter!(
        "gateway_cache_misses_total",
        Unit::Count,
        "Cacheable requests forwarded upstream"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_renders() {
        let m = Metrics::unregistered().unwrap();
        let _ = m.render();
    }
}
