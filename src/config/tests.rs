use super::types::*;
use super::GatewayConfig;
use std::path::Path;

fn route(path: &str) -> RouteConfig {
    RouteConfig {
        path: path.into(),
        regex: false,
        methods: vec![],
        middlewares: vec![],
        targets: vec![TargetConfig { target: "http://127.0.0.1:8081".into(), weight: 1 }],
        algorithm: None,
        service: None,
        hash_on: "client_ip".into(),
    }
}

fn with_routes(routes: Vec<RouteConfig>) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.routing.routes = routes;
    cfg
}

#[test]
fn test_load_toml_config() {
    let cfg = GatewayConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.routing.engine, "regex");
    assert_eq!(cfg.routing.routes.len(), 3);
    assert!(cfg.traffic.rate_limit.enabled);
    assert_eq!(cfg.traffic.rate_limit.ip_limits["192.168.1.1"].qps, 5.0);
    assert_eq!(cfg.caching.rules.len(), 1);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "routing": {
            "routes": [{
                "path": "/api/v1/user",
                "targets": [{"target": "http://127.0.0.1:8081", "weight": 2}]
            }]
        },
        "load_balancer": {"algorithm": "weighted-round-robin"}
    }"#;
    let tmp = std::env::temp_dir().join("dispatch_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.routing.routes.len(), 1);
    assert_eq!(cfg.routing.routes[0].targets[0].weight, 2);
    assert_eq!(cfg.load_balancer.algorithm, "weighted-round-robin");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/dispatch.toml")).unwrap();
    assert!(cfg.routing.routes.is_empty());
    assert_eq!(cfg.routing.engine, "exact");
}

#[test]
fn test_validate_valid_config() {
    let cfg = with_routes(vec![route("/a"), route("/b")]);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_empty_path_fails() {
    let cfg = with_routes(vec![route("")]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_exact_path_fails() {
    let cfg = with_routes(vec![route("/a"), route("/a")]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_regex_patterns_allowed() {
    let mut a = route("/v[0-9]+");
    a.regex = true;
    let b = a.clone();
    let mut cfg = with_routes(vec![a, b]);
    cfg.routing.engine = "regex".into();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_unknown_engine_fails() {
    let mut cfg = with_routes(vec![route("/a")]);
    cfg.routing.engine = "glob".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_algorithm_fails() {
    let mut r = route("/a");
    r.algorithm = Some("magic".into());
    assert!(with_routes(vec![r]).validate().is_err());

    let mut cfg = with_routes(vec![]);
    cfg.load_balancer.algorithm = "random".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_registry_route_needs_service() {
    let mut r = route("/svc");
    r.targets.clear();
    r.algorithm = Some("consul".into());
    assert!(with_routes(vec![r.clone()]).validate().is_err());

    r.service = Some("payments".into());
    assert!(with_routes(vec![r]).validate().is_ok());
}

#[test]
fn test_validate_nested_registry_strategy_fails() {
    let mut cfg = with_routes(vec![]);
    cfg.load_balancer.registry_strategy = "consul".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_hash_on() {
    let mut r = route("/a");
    r.hash_on = "header:x-user-id".into();
    assert!(with_routes(vec![r.clone()]).validate().is_ok());

    r.hash_on = "header:".into();
    assert!(with_routes(vec![r.clone()]).validate().is_err());

    r.hash_on = "cookie".into();
    assert!(with_routes(vec![r]).validate().is_err());
}

#[test]
fn test_validate_rate_limit_values() {
    let mut cfg = with_routes(vec![]);
    cfg.traffic.rate_limit.enabled = true;
    cfg.traffic.rate_limit.qps = 0.0;
    assert!(cfg.validate().is_err());

    cfg.traffic.rate_limit.qps = 10.0;
    cfg.traffic.rate_limit.burst = 0;
    assert!(cfg.validate().is_err());

    cfg.traffic.rate_limit.burst = 5;
    cfg.traffic.rate_limit.route_limits.insert(
        "/a".into(),
        ScopeLimit { qps: -1.0, burst: 1, enabled: true },
    );
    assert!(cfg.validate().is_err());

    // Disabled overrides are exemptions, their numbers are never used.
    cfg.traffic.rate_limit.route_limits.insert(
        "/a".into(),
        ScopeLimit { qps: 0.0, burst: 0, enabled: false },
    );
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_rate_limit_disabled_skips_value_checks() {
    let mut cfg = with_routes(vec![]);
    cfg.traffic.rate_limit.qps = 0.0;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_deserialize_defaults() {
    let toml_str = r#"
[consul]
address = "http://custom:8500"
"#;
    let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.consul.address, "http://custom:8500");
    assert_eq!(cfg.consul.poll_interval_secs, 10);
    assert_eq!(cfg.consul.scheme, "http");
    assert_eq!(cfg.load_balancer.registry_strategy, "round_robin");
    assert_eq!(cfg.traffic.rate_limit.gc_interval_secs, 60);
    assert_eq!(cfg.traffic.rate_limit.max_entries, 100_000);
}

#[test]
fn test_unsupported_format() {
    let tmp = std::env::temp_dir().join("dispatch_test.yml");
    std::fs::write(&tmp, "key: value").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}
