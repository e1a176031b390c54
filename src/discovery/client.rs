use super::ServiceDirectory;
use crate::balancer::Target;
use crate::config::ConsulConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Treats JSON `null` the same as a missing field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Consul /v1/health/service response, Service structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Meta", default, deserialize_with = "deserialize_null_default")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Weights", default)]
    pub weights: Option<ConsulWeights>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulWeights {
    #[serde(rename = "Passing", default)]
    pub passing: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "Status")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulNode {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// A single entry from the /v1/health/service response.
#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulCheck>,
}

/// A healthy service instance as reported by Consul.
#[derive(Debug, Clone)]
pub struct ConsulServiceNode {
    pub service_id: String,
    pub service_address: String,
    pub service_port: u16,
    pub service_meta: HashMap<String, String>,
    pub weight: u32,
}

impl ConsulServiceNode {
    fn from_entry(entry: ConsulHealthEntry) -> Self {
        let svc = entry.service;
        // An empty service address means "same as the node".
        let service_address = if !svc.address.is_empty() {
            svc.address
        } else if !entry.node.address.is_empty() {
            entry.node.address
        } else {
            "127.0.0.1".to_string()
        };
        let weight = svc
            .meta
            .get("weight")
            .and_then(|w| w.parse::<u32>().ok())
            .or_else(|| svc.weights.as_ref().map(|w| w.passing))
            .unwrap_or(1);
        Self {
            service_id: svc.id,
            service_address,
            service_port: svc.port,
            service_meta: svc.meta,
            weight,
        }
    }

    pub fn to_target(&self, scheme: &str) -> Target {
        Target::new(
            format!("{}://{}:{}", scheme, self.service_address, self.service_port),
            self.weight,
        )
    }
}

/// Consul HTTP client.
#[derive(Clone)]
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
    scheme: String,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self, GatewayError> {
        let addr = config.address.trim_end_matches('/');
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(GatewayError::Http)?;

        Ok(Self {
            base_url,
            client,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            scheme: config.scheme.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    /// Query all healthy instances of a service.
    /// Uses `?passing=true` and additionally filters out nodes with critical serfHealth.
    pub async fn query_healthy_services(
        &self,
        service_name: &str,
    ) -> Result<Vec<ConsulServiceNode>, GatewayError> {
        let mut url = format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url, service_name
        );
        if let Some(dc) = &self.datacenter {
            url.push_str("&dc=");
            url.push_str(dc);
        }

        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if !resp.status().is_success() {
            return Err(GatewayError::Registry(format!(
                "non-200 response: status={}",
                resp.status()
            )));
        }

        let entries: Vec<ConsulHealthEntry> = resp.json().await.map_err(GatewayError::Http)?;

        Ok(entries
            .into_iter()
            .filter(|entry| {
                let has_critical_serf = entry
                    .checks
                    .iter()
                    .any(|check| check.check_id == "serfHealth" && check.status == "critical");
                if has_critical_serf {
                    tracing::warn!(
                        "discovery: consul: skipping node with critical serfHealth, node={}, service={}",
                        entry.node.node,
                        service_name
                    );
                }
                !has_critical_serf
            })
            .map(ConsulServiceNode::from_entry)
            .collect())
    }
}

#[async_trait]
impl ServiceDirectory for ConsulClient {
    async fn healthy_targets(&self, service: &str) -> Result<Vec<Target>, GatewayError> {
        let nodes = self.query_healthy_services(service).await?;
        Ok(nodes.iter().map(|n| n.to_target(&self.scheme)).collect())
    }
}
