pub mod ketama;
pub mod registry;
pub mod round_robin;
pub mod weighted;

use crate::config::LoadBalancerConfig;
use crate::error::GatewayError;
use http::header::HeaderName;
use http::HeaderMap;
use ketama::KetamaBalancer;
use registry::RegistryBalancer;
use round_robin::RoundRobinBalancer;
use std::fmt;
use std::sync::Arc;
use weighted::WeightedRoundRobinBalancer;

/// Upstream address with a static weight. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    address: Arc<str>,
    weight: u32,
}

impl Target {
    /// Weights of 0 are treated as 1.
    pub fn new(address: impl Into<Arc<str>>, weight: u32) -> Self {
        Self {
            address: address.into(),
            weight: weight.max(1),
        }
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    Ketama,
    Registry,
}

impl Algorithm {
    pub fn from_name(name: &str) -> Result<Self, GatewayError> {
        match name {
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" | "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            "ketama" | "consistent_hash" => Ok(Self::Ketama),
            "consul" => Ok(Self::Registry),
            other => Err(GatewayError::UnknownAlgorithm(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Ketama => "ketama",
            Self::Registry => "consul",
        }
    }
}

/// Where the consistent-hash key of a request comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOn {
    ClientIp,
    Path,
    Header(HeaderName),
}

impl HashOn {
    pub fn parse(spec: &str) -> Result<Self, GatewayError> {
        match spec {
            "client_ip" => Ok(Self::ClientIp),
            "path" => Ok(Self::Path),
            _ => {
                let name = spec.strip_prefix("header:").ok_or_else(|| {
                    GatewayError::Config(format!("unknown hash_on source '{}'", spec))
                })?;
                HeaderName::from_bytes(name.as_bytes())
                    .map(Self::Header)
                    .map_err(|_| GatewayError::Config(format!("invalid header name '{}'", name)))
            }
        }
    }

    /// The affinity key for a request. A missing or non-UTF-8 header falls
    /// back to the client IP.
    pub fn key<'a>(&self, client_ip: &'a str, path: &'a str, headers: &'a HeaderMap) -> &'a str {
        match self {
            Self::ClientIp => client_ip,
            Self::Path => path,
            Self::Header(name) => headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(client_ip),
        }
    }
}

/// Per-request input to selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectContext<'a> {
    pub affinity_key: Option<&'a str>,
}

impl<'a> SelectContext<'a> {
    pub fn with_key(key: &'a str) -> Self {
        Self {
            affinity_key: Some(key),
        }
    }
}

/// Construction parameters shared by every route's balancer.
#[derive(Debug, Clone)]
pub struct BalancerOptions {
    pub ketama_replicas: usize,
    pub registry_strategy: Algorithm,
    pub service: Option<String>,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            ketama_replicas: ketama::DEFAULT_REPLICAS,
            registry_strategy: Algorithm::RoundRobin,
            service: None,
        }
    }
}

impl BalancerOptions {
    pub fn from_config(config: &LoadBalancerConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            ketama_replicas: config.ketama_replicas,
            registry_strategy: Algorithm::from_name(&config.registry_strategy)?,
            service: None,
        })
    }

    pub fn with_service(mut self, service: Option<String>) -> Self {
        self.service = service;
        self
    }
}

pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
    Ketama(KetamaBalancer),
    Registry(RegistryBalancer),
}

impl LoadBalancer {
    /// Build a balancer by configured name. Unknown names are an error.
    pub fn new(algorithm: &str, opts: &BalancerOptions) -> Result<Arc<Self>, GatewayError> {
        Self::build(Algorithm::from_name(algorithm)?, opts).map(Arc::new)
    }

    pub fn build(algorithm: Algorithm, opts: &BalancerOptions) -> Result<Self, GatewayError> {
        Ok(match algorithm {
            Algorithm::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new()),
            Algorithm::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobinBalancer::new())
            }
            Algorithm::Ketama => Self::Ketama(KetamaBalancer::new(opts.ketama_replicas)),
            Algorithm::Registry => {
                let service = opts
                    .service
                    .clone()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        GatewayError::Config("registry balancing needs a service name".into())
                    })?;
                if opts.registry_strategy == Algorithm::Registry {
                    return Err(GatewayError::Config(
                        "registry strategy cannot itself be registry-backed".into(),
                    ));
                }
                let inner = Self::build(opts.registry_strategy, opts)?;
                Self::Registry(RegistryBalancer::new(service, inner))
            }
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::RoundRobin(_) => Algorithm::RoundRobin,
            Self::WeightedRoundRobin(_) => Algorithm::WeightedRoundRobin,
            Self::Ketama(_) => Algorithm::Ketama,
            Self::Registry(_) => Algorithm::Registry,
        }
    }

    /// Replace the target set atomically.
    pub fn update_targets(&self, targets: Vec<Target>) {
        match self {
            Self::RoundRobin(lb) => lb.update_targets(targets),
            Self::WeightedRoundRobin(lb) => lb.update_targets(targets),
            Self::Ketama(lb) => lb.update_targets(targets),
            Self::Registry(lb) => lb.update_targets(targets),
        }
    }

    /// Pick a target. An empty target set yields `NoAvailableTarget`.
    /// Ketama without an affinity key hashes the empty string.
    pub fn select(&self, ctx: &SelectContext<'_>) -> Result<Target, GatewayError> {
        let picked = match self {
            Self::RoundRobin(lb) => lb.do_select(),
            Self::WeightedRoundRobin(lb) => lb.do_select(),
            Self::Ketama(lb) => lb.do_select(ctx.affinity_key.unwrap_or("")),
            Self::Registry(lb) => lb.do_select(ctx),
        };
        picked.ok_or(GatewayError::NoAvailableTarget)
    }

    pub fn targets(&self) -> Vec<Target> {
        match self {
            Self::RoundRobin(lb) => lb.get_targets(),
            Self::WeightedRoundRobin(lb) => lb.get_targets(),
            Self::Ketama(lb) => lb.get_targets(),
            Self::Registry(lb) => lb.get_targets(),
        }
    }

    /// Service name for registry-backed balancers.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Registry(lb) => Some(lb.service()),
            _ => None,
        }
    }
}
