use crate::error::GatewayError;
use crate::routing::Route;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// JSON response with the given status and pre-serialized body.
pub fn json_response(status: StatusCode, body: String) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Left-most `X-Forwarded-For` entry when it parses as an IP address,
/// otherwise the TCP peer.
pub fn client_ip_from(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
        .to_string()
}

/// Per-request state shared by the pipeline, the middleware chain and the
/// forwarder.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Inbound request headers. Middleware may edit them before forwarding.
    pub headers: HeaderMap,
    pub client_ip: String,
    pub peer: SocketAddr,
    pub start: Instant,
    pub route: Option<Arc<Route>>,
    pub upstream_addr: String,
    /// Typed scratch space for middleware to carry state into the response phase.
    pub extensions: http::Extensions,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        peer: SocketAddr,
    ) -> Self {
        let client_ip = client_ip_from(&headers, peer);
        Self {
            method,
            path,
            query,
            headers,
            client_ip,
            peer,
            start: Instant::now(),
            route: None,
            upstream_addr: String::new(),
            extensions: http::Extensions::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Pattern of the matched route, or empty before resolution.
    pub fn route_path(&self) -> &str {
        self.route.as_ref().map(|r| r.path()).unwrap_or("")
    }

    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::warn!(
                "proxy: request failed, method={}, path={}, route={}, upstream={}, error={}",
                self.method,
                self.path,
                self.route_path(),
                self.upstream_addr,
                err
            );
        } else {
            tracing::debug!(
                "proxy: request rejected, method={}, path={}, status={}, error={}",
                self.method,
                self.path,
                status.as_u16(),
                err
            );
        }
        json_response(status, err.body())
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_path().to_owned(),
            "method" => self.method.as_str().to_owned(),
            "status_code" => status_str.to_owned(),
            "upstream" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_path().to_owned(),
            "upstream" => self.upstream_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 40000)
    }

    #[test]
    fn test_client_ip_from_peer() {
        assert_eq!(client_ip_from(&HeaderMap::new(), peer()), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_from_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.1.1.1".parse().unwrap());
        assert_eq!(client_ip_from(&headers, peer()), "203.0.113.7");

        headers.insert("x-forwarded-for", " ".parse().unwrap());
        assert_eq!(client_ip_from(&headers, peer()), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_ignores_non_ip_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "x".repeat(4000).parse().unwrap());
        assert_eq!(client_ip_from(&headers, peer()), "10.0.0.1");

        headers.insert("x-forwarded-for", "unknown, 203.0.113.7".parse().unwrap());
        assert_eq!(client_ip_from(&headers, peer()), "10.0.0.1");

        headers.insert("x-forwarded-for", " 2001:db8::1 ,10.1.1.1".parse().unwrap());
        assert_eq!(client_ip_from(&headers, peer()), "2001:db8::1");
    }

    #[test]
    fn test_request_context_new() {
        let ctx = RequestContext::new(
            Method::GET,
            "/api/v1".to_string(),
            Some("b=2&a=1".to_string()),
            HeaderMap::new(),
            peer(),
        );
        assert_eq!(ctx.path, "/api/v1");
        assert_eq!(ctx.method, Method::GET);
        assert_eq!(ctx.client_ip, "10.0.0.1");
        assert_eq!(ctx.route_path(), "");
        assert_eq!(ctx.upstream_addr, "");
        assert!(!ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_error_response_is_json() {
        let ctx = RequestContext::new(Method::GET, "/x".into(), None, HeaderMap::new(), peer());
        let resp = ctx.error_response(&GatewayError::NoRouteMatch);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"error":"not found","status":404}"#);
    }

    #[test]
    fn test_error_response_various_status() {
        let ctx = RequestContext::new(Method::POST, "/".into(), None, HeaderMap::new(), peer());
        for (err, status) in [
            (GatewayError::NoAvailableTarget, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (GatewayError::UpstreamConnect("refused".into()), StatusCode::BAD_GATEWAY),
        ] {
            assert_eq!(ctx.error_response(&err).status(), status);
        }
    }

    #[test]
    fn test_finalize_metrics_without_recorder() {
        let mut ctx = RequestContext::new(Method::GET, "/".into(), None, HeaderMap::new(), peer());
        ctx.upstream_addr = "http://10.0.0.1:8080".to_string();
        ctx.finalize_metrics(200);
        ctx.finalize_metrics(502);
    }
}
