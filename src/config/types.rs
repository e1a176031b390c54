use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration. Read once at startup and passed
/// explicitly to every constructor that needs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub consul: ConsulConfig,

    #[serde(default)]
    pub caching: CachingConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Seconds to wait for in-flight connections after shutdown is signalled.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// "exact" registers every route as an exact path; "regex" compiles
    /// routes flagged `regex = true` as anchored patterns.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Joined in front of every route path.
    #[serde(default)]
    pub prefix: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            prefix: String::new(),
            routes: Vec::new(),
        }
    }
}

fn default_engine() -> String {
    "exact".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exact path, or a regex body (without anchors) when `regex` is set.
    pub path: String,

    #[serde(default)]
    pub regex: bool,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Middleware names, executed in order before the request is forwarded.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub middlewares: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: Vec<TargetConfig>,

    /// Overrides `load_balancer.algorithm` for this route.
    #[serde(default)]
    pub algorithm: Option<String>,

    /// Service name in the external directory (required by "consul").
    #[serde(default)]
    pub service: Option<String>,

    /// Affinity key for consistent hashing:
    /// "client_ip" (default), "path", or "header:<name>".
    #[serde(default = "default_hash_on")]
    pub hash_on: String,
}

fn default_hash_on() -> String {
    "client_ip".to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            regex: false,
            methods: Vec::new(),
            middlewares: Vec::new(),
            targets: Vec::new(),
            algorithm: None,
            service: None,
            hash_on: default_hash_on(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Upstream address, e.g. `http://10.0.0.1:8080` or `10.0.0.1:8080`.
    pub target: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Token-bucket parameters for the global / ip / route scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch. `false` bypasses every scope with no delay.
    #[serde(default)]
    pub enabled: bool,

    /// Whether the single process-wide bucket is enforced.
    #[serde(default = "default_true")]
    pub global_enabled: bool,

    #[serde(default = "default_qps")]
    pub qps: f64,

    #[serde(default = "default_burst")]
    pub burst: u64,

    /// Per-client-IP overrides, keyed by the literal IP string.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ip_limits: HashMap<String, ScopeLimit>,

    /// Per-route overrides, keyed by the route path as written in
    /// `routing.routes`. `routing.prefix` is joined on at startup.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub route_limits: HashMap<String, ScopeLimit>,

    /// Upper bound on the total admission delay of a single request.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default = "default_idle_expire")]
    pub idle_expire_secs: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            global_enabled: true,
            qps: default_qps(),
            burst: default_burst(),
            ip_limits: HashMap::new(),
            route_limits: HashMap::new(),
            max_wait_ms: default_max_wait_ms(),
            idle_expire_secs: default_idle_expire(),
            gc_interval_secs: default_gc_interval(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_qps() -> f64 {
    100.0
}

fn default_burst() -> u64 {
    200
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_idle_expire() -> u64 {
    300
}

fn default_gc_interval() -> u64 {
    60
}

fn default_max_entries() -> usize {
    100_000
}

/// Override for one ip or route key. `enabled = false` exempts the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeLimit {
    pub qps: f64,
    pub burst: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// "round_robin", "weighted_round_robin", "ketama", "consul".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Virtual ring positions per target for "ketama".
    #[serde(default = "default_replicas")]
    pub ketama_replicas: usize,

    /// Strategy applied over registry-discovered targets.
    #[serde(default = "default_algorithm")]
    pub registry_strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            ketama_replicas: default_replicas(),
            registry_strategy: default_algorithm(),
        }
    }
}

fn default_algorithm() -> String {
    "round_robin".to_string()
}

fn default_replicas() -> usize {
    160
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// How often to poll consul for service changes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Scheme used to build target addresses from discovered nodes.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Maximum number of services queried in parallel per poll round.
    #[serde(default = "default_poll_concurrency")]
    pub concurrency: usize,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            poll_interval_secs: default_poll_interval(),
            scheme: default_scheme(),
            concurrency: default_poll_concurrency(),
        }
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_poll_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<CacheRule>,

    /// Responses whose body may exceed this many bytes pass through uncached.
    #[serde(default = "default_cache_max_body")]
    pub max_body_bytes: u64,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rules: Vec::new(),
            max_body_bytes: default_cache_max_body(),
        }
    }
}

fn default_cache_max_body() -> u64 {
    1024 * 1024
}

impl CachingConfig {
    pub fn rule_for(&self, path: &str) -> Option<&CacheRule> {
        self.rules.iter().find(|r| r.path == path)
    }
}

/// Responses for `path` are cached once the path has been requested
/// `threshold` times within `ttl_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRule {
    pub path: String,

    #[serde(default = "default_cache_method")]
    pub method: String,

    #[serde(default = "default_threshold")]
    pub threshold: u64,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_method() -> String {
    "GET".to_string()
}

fn default_threshold() -> u64 {
    1
}

fn default_cache_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Budget for the whole upstream exchange (send + first byte).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    #[serde(default = "default_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            pool_idle_timeout_secs: default_idle_timeout(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    3.0
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    320
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_full_serde() {
        let json = r#"{
            "path": "/api/v[0-9]+/users",
            "regex": true,
            "methods": ["GET", "POST"],
            "middlewares": ["auth", "cache"],
            "targets": [
                {"target": "http://10.0.0.1:8080", "weight": 5},
                {"target": "10.0.0.2:8080"}
            ],
            "algorithm": "ketama",
            "hash_on": "header:x-user-id"
        }"#;

        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(route.path, "/api/v[0-9]+/users");
        assert!(route.regex);
        assert_eq!(route.methods, vec!["GET", "POST"]);
        assert_eq!(route.middlewares, vec!["auth", "cache"]);
        assert_eq!(route.targets.len(), 2);
        assert_eq!(route.targets[0].weight, 5);
        assert_eq!(route.targets[1].weight, 1);
        assert_eq!(route.algorithm.as_deref(), Some("ketama"));
        assert_eq!(route.hash_on, "header:x-user-id");
        assert!(route.service.is_none());
    }

    #[test]
    fn test_route_minimal_defaults() {
        let route: RouteConfig = serde_json::from_str(r#"{"path": "/x"}"#).unwrap();
        assert!(!route.regex);
        assert!(route.methods.is_empty());
        assert!(route.middlewares.is_empty());
        assert!(route.targets.is_empty());
        assert_eq!(route.hash_on, "client_ip");
    }

    #[test]
    fn test_null_lists_become_empty() {
        let route: RouteConfig = serde_json::from_str(
            r#"{"path": "/x", "methods": null, "middlewares": null, "targets": null}"#,
        )
        .unwrap();
        assert!(route.methods.is_empty());
        assert!(route.middlewares.is_empty());
        assert!(route.targets.is_empty());
    }

    #[test]
    fn test_rate_limit_overrides_serde() {
        let json = r#"{
            "enabled": true,
            "qps": 10,
            "burst": 20,
            "ip_limits": {"192.168.1.1": {"qps": 5, "burst": 10}},
            "route_limits": {"/api/v1/user": {"qps": 8, "burst": 15, "enabled": false}}
        }"#;
        let rl: RateLimitConfig = serde_json::from_str(json).unwrap();
        assert!(rl.enabled);
        assert!(rl.global_enabled);
        assert_eq!(rl.qps, 10.0);
        assert_eq!(rl.burst, 20);
        let ip = &rl.ip_limits["192.168.1.1"];
        assert_eq!(ip.qps, 5.0);
        assert!(ip.enabled);
        assert!(!rl.route_limits["/api/v1/user"].enabled);
        assert_eq!(rl.max_wait_ms, 30_000);
    }

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.routing.engine, "exact");
        assert!(!cfg.traffic.rate_limit.enabled);
        assert_eq!(cfg.load_balancer.algorithm, "round_robin");
        assert_eq!(cfg.load_balancer.ketama_replicas, 160);
        assert_eq!(cfg.consul.poll_interval_secs, 10);
        assert!(!cfg.caching.enabled);
        assert_eq!(cfg.proxy.connect_timeout, 3.0);
        assert_eq!(cfg.server.drain_timeout_secs, 30);
    }

    #[test]
    fn test_cache_rule_lookup() {
        let caching: CachingConfig = serde_json::from_str(
            r#"{"enabled": true, "rules": [{"path": "/a", "threshold": 3}]}"#,
        )
        .unwrap();
        let rule = caching.rule_for("/a").unwrap();
        assert_eq!(rule.method, "GET");
        assert_eq!(rule.threshold, 3);
        assert_eq!(rule.ttl_secs, 60);
        assert!(caching.rule_for("/b").is_none());
    }
}
