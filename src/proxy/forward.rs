use crate::balancer::Target;
use crate::config::ProxyConfig;
use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use async_trait::async_trait;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Sends a prepared request to the chosen target.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &Target,
        req: Request<BoxBody>,
        ctx: &RequestContext,
    ) -> Result<Response<BoxBody>, GatewayError>;
}

/// Pooled hyper client forwarding to `http://` and `https://` targets.
pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    request_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(config: &ProxyConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(config.pool_idle_timeout_secs)));
        http.set_connect_timeout(Some(Duration::from_secs_f64(config.connect_timeout)));
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.pool_size)
            .build(https);

        Self {
            client,
            request_timeout: Duration::from_secs_f64(config.request_timeout),
        }
    }
}

/// `{target}{path}[?query]`. Targets are normalized without a trailing slash.
pub fn upstream_uri(target: &str, path: &str, query: Option<&str>) -> String {
    let mut uri = String::with_capacity(
        target.len() + path.len() + query.map(|q| q.len() + 1).unwrap_or(0),
    );
    uri.push_str(target);
    uri.push_str(path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        uri.push('?');
        uri.push_str(q);
    }
    uri
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Append the peer to `X-Forwarded-For`, default `X-Forwarded-Proto`, copy
/// the inbound host to `X-Forwarded-Host` and set `X-Real-IP` to the client.
pub fn inject_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = ctx.peer.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(XFH.clone(), host);
    }

    if let Ok(v) = HeaderValue::from_str(&ctx.client_ip) {
        headers.insert(XRI.clone(), v);
    }
}

/// Point `req` at `target` and rewrite its headers for the upstream hop.
pub fn prepare_upstream_request(
    target: &Target,
    req: Request<BoxBody>,
    ctx: &RequestContext,
) -> Result<Request<BoxBody>, GatewayError> {
    let (mut parts, body) = req.into_parts();
    let uri = upstream_uri(target.address(), parts.uri.path(), parts.uri.query());
    parts.uri = uri
        .parse()
        .map_err(|e| GatewayError::InvalidTarget(format!("{}: {}", uri, e)))?;

    inject_forwarded_headers(&mut parts.headers, ctx);
    remove_hop_headers(&mut parts.headers);
    // the client derives Host from the upstream URI
    parts.headers.remove(HOST);

    Ok(Request::from_parts(parts, body))
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &Target,
        req: Request<BoxBody>,
        ctx: &RequestContext,
    ) -> Result<Response<BoxBody>, GatewayError> {
        let req = prepare_upstream_request(target, req, ctx)?;

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = tokio::time::timeout(self.request_timeout, self.client.request(req)) => r,
        };

        match result {
            Ok(Ok(resp)) => {
                let (parts, body) = resp.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => Err(GatewayError::UpstreamConnect(format!("{}: {}", target, e))),
            Err(_) => Err(GatewayError::Timeout),
        }
    }
}
