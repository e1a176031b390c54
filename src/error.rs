use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    NoAvailableTarget,
    UnknownAlgorithm(String),
    InvalidRoute(String),
    InvalidTarget(String),
    Timeout,
    Cancelled,
    UpstreamConnect(String),
    Http(reqwest::Error),
    Registry(String),
    Cache(String),
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// HTTP status the dispatch boundary answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::NoAvailableTarget => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // nginx convention for "client closed request".
            GatewayError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::UpstreamConnect(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UnknownAlgorithm(_)
            | GatewayError::InvalidRoute(_)
            | GatewayError::InvalidTarget(_)
            | GatewayError::Registry(_)
            | GatewayError::Cache(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing message. Internal details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatch => "not found",
            GatewayError::NoAvailableTarget => "no available target",
            GatewayError::Timeout => "gateway timeout",
            GatewayError::Cancelled => "client closed request",
            GatewayError::UpstreamConnect(_) | GatewayError::Http(_) => "bad gateway",
            _ => "internal server error",
        }
    }

    /// Structured JSON body: `{"error": "...", "status": 404}`.
    pub fn body(&self) -> String {
        serde_json::json!({
            "error": self.public_message(),
            "status": self.status_code().as_u16(),
        })
        .to_string()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoAvailableTarget => write!(f, "no available target"),
            GatewayError::UnknownAlgorithm(name) => {
                write!(f, "unknown load balancer algorithm: {}", name)
            }
            GatewayError::InvalidRoute(msg) => write!(f, "invalid route: {}", msg),
            GatewayError::InvalidTarget(msg) => write!(f, "invalid target: {}", msg),
            GatewayError::Timeout => write!(f, "timed out"),
            GatewayError::Cancelled => write!(f, "request cancelled"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Registry(msg) => write!(f, "registry error: {}", msg),
            GatewayError::Cache(msg) => write!(f, "cache error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
