pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::balancer::Algorithm;
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists), apply environment
    /// variable overrides for infrastructure settings and validate. When the
    /// file does not exist, built-in defaults are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            routes = config.routing.routes.len(),
            engine = %config.routing.engine,
            rate_limit = config.traffic.rate_limit.enabled,
            "config: loaded gateway configuration"
        );
        Ok(config)
    }

    /// Route tables and limits belong in the config file; only connection
    /// settings are taken from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DISPATCH_CONSUL_ADDRESS") {
            self.consul.address = v;
        }
        if let Ok(v) = std::env::var("DISPATCH_CONSUL_DATACENTER") {
            self.consul.datacenter = Some(v);
        }
        if let Ok(v) = std::env::var("DISPATCH_CONSUL_TOKEN") {
            self.consul.token = Some(v);
        }
        if let Ok(v) = std::env::var("DISPATCH_CONSUL_POLL_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.consul.poll_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("DISPATCH_RATE_LIMIT_ENABLED") {
            self.traffic.rate_limit.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DISPATCH_ROUTING_PREFIX") {
            self.routing.prefix = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.routing.engine.as_str() {
            "exact" | "regex" => {}
            other => anyhow::bail!("routing.engine '{}' must be 'exact' or 'regex'", other),
        }

        let global = Algorithm::from_name(&self.load_balancer.algorithm)?;
        let registry_strategy = Algorithm::from_name(&self.load_balancer.registry_strategy)?;
        if registry_strategy == Algorithm::Registry {
            anyhow::bail!("load_balancer.registry_strategy cannot itself be 'consul'");
        }
        if self.load_balancer.ketama_replicas == 0 {
            anyhow::bail!("load_balancer.ketama_replicas must be at least 1");
        }

        let mut exact_paths = HashSet::new();
        for route in &self.routing.routes {
            if route.path.is_empty() {
                anyhow::bail!("route has empty path");
            }
            let treated_as_regex = route.regex && self.routing.engine == "regex";
            if !treated_as_regex && !exact_paths.insert(route.path.as_str()) {
                anyhow::bail!("duplicate route path '{}'", route.path);
            }

            let algorithm = match route.algorithm.as_deref() {
                Some(name) => Algorithm::from_name(name)?,
                None => global,
            };
            if algorithm == Algorithm::Registry {
                if route.service.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!(
                        "route '{}' uses registry balancing but names no service",
                        route.path
                    );
                }
            } else if route.targets.is_empty() {
                tracing::warn!(
                    "config: route has no static targets, path={}, requests will get 503",
                    route.path
                );
            }

            for t in &route.targets {
                if t.target.is_empty() {
                    anyhow::bail!("route '{}' has an empty target entry", route.path);
                }
            }

            if let Some(rest) = route.hash_on.strip_prefix("header:") {
                if rest.is_empty() {
                    anyhow::bail!("route '{}': hash_on 'header:' needs a header name", route.path);
                }
            } else if route.hash_on != "client_ip" && route.hash_on != "path" {
                anyhow::bail!(
                    "route '{}': hash_on '{}' must be 'client_ip', 'path' or 'header:<name>'",
                    route.path,
                    route.hash_on
                );
            }
        }

        let rl = &self.traffic.rate_limit;
        if rl.enabled {
            check_rate("traffic.rate_limit", rl.qps, rl.burst)?;
            for (key, limit) in rl.ip_limits.iter().chain(rl.route_limits.iter()) {
                if limit.enabled {
                    check_rate(&format!("traffic.rate_limit override '{}'", key), limit.qps, limit.burst)?;
                }
            }
            if rl.max_wait_ms == 0 {
                anyhow::bail!("traffic.rate_limit.max_wait_ms must be positive");
            }
        }

        for rule in &self.caching.rules {
            if rule.path.is_empty() {
                anyhow::bail!("caching rule has empty path");
            }
            if rule.ttl_secs == 0 {
                anyhow::bail!("caching rule '{}' has zero ttl", rule.path);
            }
        }

        Ok(())
    }
}

fn check_rate(what: &str, qps: f64, burst: u64) -> Result<()> {
    if !(qps.is_finite() && qps > 0.0) {
        anyhow::bail!("{what}: qps must be positive, got {qps}");
    }
    if burst == 0 {
        anyhow::bail!("{what}: burst must be at least 1");
    }
    Ok(())
}
