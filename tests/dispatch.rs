//! End-to-end dispatch through the proxy server against in-process upstreams.

use bytes::Bytes;
use dispatch_gateway::config::{CacheRule, GatewayConfig, RouteConfig, TargetConfig};
use dispatch_gateway::server::{self, GatewayState};
use dispatch_gateway::telemetry::Metrics;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Upstream that answers with its name and the headers it received.
struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

async fn start_upstream(name: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string()
                    };
                    let body = serde_json::json!({
                        "upstream": name,
                        "uri": req.uri().to_string(),
                        "x_forwarded_for": header("x-forwarded-for"),
                        "x_forwarded_host": header("x-forwarded-host"),
                        "x_real_ip": header("x-real-ip"),
                        "connection": header("connection"),
                    })
                    .to_string();
                    async move {
                        let mut resp = Response::new(Full::new(Bytes::from(body)));
                        resp.headers_mut()
                            .insert("content-type", "application/json".parse().unwrap());
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    Upstream { addr, hits }
}

fn route(path: &str, targets: &[SocketAddr]) -> RouteConfig {
    RouteConfig {
        path: path.into(),
        targets: targets
            .iter()
            .map(|a| TargetConfig {
                target: a.to_string(),
                weight: 1,
            })
            .collect(),
        ..Default::default()
    }
}

struct Gateway {
    base: String,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_gateway(config: GatewayConfig) -> Gateway {
    let shutdown = CancellationToken::new();
    let state = GatewayState::new(config, Metrics::unregistered().unwrap(), &CancellationToken::new())
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server::run_proxy_server(
        listener,
        state,
        shutdown.clone(),
        Duration::from_secs(5),
    ));
    Gateway {
        base: format!("http://{}", addr),
        shutdown,
        handle,
    }
}

async fn get_json(url: &str) -> (u16, serde_json::Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_round_robin_across_upstreams() {
    let a = start_upstream("a").await;
    let b = start_upstream("b").await;
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/api/v1/user", &[a.addr, b.addr])];
    let gw = start_gateway(config).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (status, body) = get_json(&format!("{}/api/v1/user?id=1", gw.base)).await;
        assert_eq!(status, 200);
        assert_eq!(body["uri"], "/api/v1/user?id=1");
        seen.push(body["upstream"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, ["a", "b", "a", "b"]);
    assert_eq!(a.hits.load(Ordering::SeqCst), 2);
    assert_eq!(b.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_forwarded_headers_reach_upstream() {
    let a = start_upstream("a").await;
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/echo", &[a.addr])];
    let gw = start_gateway(config).await;

    let resp = reqwest::Client::new()
        .get(format!("{}/echo", gw.base))
        .header("x-forwarded-for", "203.0.113.5")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["x_forwarded_for"], "203.0.113.5, 127.0.0.1");
    assert_eq!(body["x_real_ip"], "203.0.113.5");
    assert!(body["x_forwarded_host"].as_str().unwrap().starts_with("127.0.0.1:"));
}

#[tokio::test]
async fn test_unknown_path_is_404_json() {
    let a = start_upstream("a").await;
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/known", &[a.addr])];
    let gw = start_gateway(config).await;

    let (status, body) = get_json(&format!("{}/unknown", gw.base)).await;
    assert_eq!(status, 404);
    assert_eq!(body, serde_json::json!({"error": "not found", "status": 404}));
    assert_eq!(a.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_regex_route_is_anchored() {
    let a = start_upstream("a").await;
    let mut config = GatewayConfig::default();
    config.routing.engine = "regex".into();
    config.routing.routes = vec![RouteConfig {
        regex: true,
        ..route("/api/v[0-9]+", &[a.addr])
    }];
    let gw = start_gateway(config).await;

    let (status, _) = get_json(&format!("{}/api/v2", gw.base)).await;
    assert_eq!(status, 200);
    let (status, _) = get_json(&format!("{}/api/v2/extra", gw.base)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_empty_target_set_is_503() {
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/nobody", &[])];
    let gw = start_gateway(config).await;

    let (status, body) = get_json(&format!("{}/nobody", gw.base)).await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], 503);
}

#[tokio::test]
async fn test_dead_upstream_is_502() {
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/dead", &[dead])];
    let gw = start_gateway(config).await;

    let (status, body) = get_json(&format!("{}/dead", gw.base)).await;
    assert_eq!(status, 502);
    assert_eq!(body["error"], "bad gateway");
}

#[tokio::test]
async fn test_cache_serves_hot_path_without_upstream() {
    let a = start_upstream("a").await;
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![RouteConfig {
        middlewares: vec!["cache".into()],
        ..route("/hot", &[a.addr])
    }];
    config.caching.enabled = true;
    config.caching.rules = vec![CacheRule {
        path: "/hot".into(),
        method: "GET".into(),
        threshold: 1,
        ttl_secs: 60,
    }];
    let gw = start_gateway(config).await;

    let (status, first) = get_json(&format!("{}/hot?b=2&a=1", gw.base)).await;
    assert_eq!(status, 200);
    let (status, second) = get_json(&format!("{}/hot?a=1&b=2", gw.base)).await;
    assert_eq!(status, 200);
    assert_eq!(first, second);
    assert_eq!(a.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let a = start_upstream("a").await;
    let mut config = GatewayConfig::default();
    config.routing.routes = vec![route("/x", &[a.addr])];
    let gw = start_gateway(config).await;

    let (status, _) = get_json(&format!("{}/x", gw.base)).await;
    assert_eq!(status, 200);

    gw.shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), gw.handle)
        .await
        .expect("server drained in time")
        .unwrap();
    assert!(result.is_ok());
}
