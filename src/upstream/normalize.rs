use crate::config::TargetConfig;
use crate::error::GatewayError;
use http::uri::{Scheme, Uri};

/// Turns a configured target into the `scheme://host:port` form the
/// balancers and the forwarder work with.
pub trait TargetNormalizer: Send + Sync {
    fn normalize_target(&self, target: &TargetConfig) -> Result<String, GatewayError>;
}

/// Adds `http://` when no scheme is given, drops trailing slashes and rejects
/// anything that is not an http(s) authority without a path.
#[derive(Debug, Clone, Default)]
pub struct DefaultNormalizer;

impl TargetNormalizer for DefaultNormalizer {
    fn normalize_target(&self, target: &TargetConfig) -> Result<String, GatewayError> {
        let raw = target.target.trim().trim_end_matches('/');
        if raw.is_empty() {
            return Err(GatewayError::InvalidTarget("empty target".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let uri: Uri = with_scheme
            .parse()
            .map_err(|e| GatewayError::InvalidTarget(format!("{}: {}", raw, e)))?;

        match uri.scheme() {
            Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => {}
            _ => {
                return Err(GatewayError::InvalidTarget(format!(
                    "{}: scheme must be http or https",
                    raw
                )))
            }
        }
        let authority = uri
            .authority()
            .ok_or_else(|| GatewayError::InvalidTarget(format!("{}: missing host", raw)))?;
        if authority.host().is_empty() {
            return Err(GatewayError::InvalidTarget(format!("{}: missing host", raw)));
        }
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(GatewayError::InvalidTarget(format!(
                "{}: target must not carry a path",
                raw
            )));
        }

        Ok(with_scheme)
    }
}
