use super::GatewayState;
use crate::proxy::context::{full_body, json_response, BoxBody};
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};

pub fn handle_admin<B>(req: Request<B>, state: &GatewayState) -> Response<BoxBody> {
    match req.uri().path() {
        "/health" | "/healthz" => json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),

        "/ready" | "/readyz" => {
            let table = state.table();
            let body = serde_json::json!({
                "status": "ready",
                "exact_routes": table.exact_count(),
                "regex_routes": table.regex_count(),
                "total_routes": table.route_count(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        "/metrics" => {
            let mut resp = Response::new(full_body(state.metrics.render()));
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            resp
        }

        "/routes" => {
            let routes: Vec<serde_json::Value> = state
                .table()
                .routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "path": r.path(),
                        "regex": r.is_regex(),
                        "methods": r.methods(),
                        "algorithm": r.balancer.algorithm().as_str(),
                        "service": r.balancer.service(),
                        "middlewares": r.chain.names(),
                        "targets": r.balancer.targets().iter().map(|t| {
                            serde_json::json!({"address": t.address(), "weight": t.weight()})
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            json_response(StatusCode::OK, body)
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found","status":404}"#.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RouteConfig, TargetConfig};
    use crate::proxy::context::empty_body;
    use crate::telemetry::Metrics;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    fn state() -> GatewayState {
        let mut config = GatewayConfig::default();
        config.routing.routes = vec![RouteConfig {
            path: "/api/v1/user".into(),
            methods: vec!["get".into()],
            targets: vec![TargetConfig {
                target: "10.0.0.1:8080".into(),
                weight: 3,
            }],
            ..Default::default()
        }];
        GatewayState::new(config, Metrics::unregistered().unwrap(), &CancellationToken::new())
            .unwrap()
    }

    async fn get(path: &str, state: &GatewayState) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(empty_body()).unwrap();
        let resp = handle_admin(req, state);
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let s = state();
        let (status, body) = get("/health", &s).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get("/ready", &s).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exact_routes"], 1);
        assert_eq!(body["regex_routes"], 0);
        assert_eq!(body["total_routes"], 1);
    }

    #[tokio::test]
    async fn test_routes_listing() {
        let s = state();
        let (_, body) = get("/routes", &s).await;
        let route = &body[0];
        assert_eq!(route["path"], "/api/v1/user");
        assert_eq!(route["methods"][0], "GET");
        assert_eq!(route["algorithm"], "round_robin");
        assert_eq!(route["targets"][0]["address"], "http://10.0.0.1:8080");
        assert_eq!(route["targets"][0]["weight"], 3);
    }

    #[tokio::test]
    async fn test_unknown_admin_path() {
        let (status, body) = get("/nope", &state()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }
}
