use super::chain::{MiddlewareChain, MiddlewareRegistry};
use crate::balancer::{Algorithm, BalancerOptions, HashOn, LoadBalancer, Target};
use crate::config::{GatewayConfig, RouteConfig};
use crate::error::GatewayError;
use crate::upstream::TargetNormalizer;
use http::Method;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered route. Immutable after the table is built.
pub struct Route {
    path: String,
    is_regex: bool,
    /// Upper-case method names. Empty means every method.
    methods: Vec<String>,
    pub chain: MiddlewareChain,
    pub balancer: Arc<LoadBalancer>,
    pub hash_on: HashOn,
}

impl Route {
    /// Normalized exact path, or the regex source without anchors.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }
}

/// Exact routes in a hash map, regex routes in registration order.
///
/// Lookup: exact path first, then the first regex that matches the whole
/// path. Built once at startup and only read afterwards.
#[derive(Default)]
pub struct RouteTable {
    exact: HashMap<String, Arc<Route>>,
    regex: Vec<(Regex, Arc<Route>)>,
}

impl RouteTable {
    /// Build the table from configuration.
    ///
    /// Unknown algorithms and bad `hash_on` values are fatal. A regex that
    /// does not compile drops only its own route. Targets that fail
    /// normalization are skipped.
    pub fn build(
        config: &GatewayConfig,
        registry: &MiddlewareRegistry,
        normalizer: &dyn TargetNormalizer,
    ) -> Result<Self, GatewayError> {
        let routing = &config.routing;
        let regex_engine = routing.engine == "regex";
        let base_opts = BalancerOptions::from_config(&config.load_balancer)?;

        let mut table = RouteTable::default();
        for rc in &routing.routes {
            let path = join_prefix(&routing.prefix, &rc.path);
            let is_regex = rc.regex && regex_engine;
            let route = Arc::new(build_route(rc, path, is_regex, config, &base_opts, registry, normalizer)?);

            if is_regex {
                let pattern = format!("^{}$", route.path);
                match Regex::new(&pattern) {
                    Ok(re) => {
                        tracing::info!("routing: registered regex route, pattern={}", route.path);
                        table.regex.push((re, route));
                    }
                    Err(e) => {
                        let err = GatewayError::InvalidRoute(format!("{}: {}", route.path, e));
                        tracing::error!("routing: dropped route, error={}", err);
                    }
                }
            } else {
                tracing::info!(
                    "routing: registered route, path={}, algorithm={}, middlewares={}",
                    route.path,
                    route.balancer.algorithm().as_str(),
                    route.chain.len()
                );
                if table.exact.insert(route.path.clone(), Arc::clone(&route)).is_some() {
                    tracing::warn!("routing: duplicate exact path replaced, path={}", route.path);
                }
            }
        }

        tracing::info!(
            "routing: compiled route table, exact={}, regex={}",
            table.exact.len(),
            table.regex.len()
        );
        Ok(table)
    }

    /// Exact match first, then regex routes in registration order. A method
    /// mismatch on the exact route falls through to the regex scan.
    pub fn resolve(&self, path: &str, method: &Method) -> Option<Arc<Route>> {
        if let Some(route) = self.exact.get(path) {
            if route.allows(method) {
                return Some(Arc::clone(route));
            }
        }
        self.regex
            .iter()
            .find(|(re, route)| route.allows(method) && re.is_match(path))
            .map(|(_, route)| Arc::clone(route))
    }

    pub fn exact_count(&self) -> usize {
        self.exact.len()
    }

    pub fn regex_count(&self) -> usize {
        self.regex.len()
    }

    pub fn route_count(&self) -> usize {
        self.exact.len() + self.regex.len()
    }

    /// Every route: exact ones sorted by path, then regex ones in order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut exact: Vec<Arc<Route>> = self.exact.values().cloned().collect();
        exact.sort_by(|a, b| a.path.cmp(&b.path));
        exact.extend(self.regex.iter().map(|(_, r)| Arc::clone(r)));
        exact
    }

    /// Balancers whose targets come from the service directory.
    pub fn registry_balancers(&self) -> Vec<Arc<LoadBalancer>> {
        self.routes()
            .into_iter()
            .filter(|r| r.balancer.algorithm() == Algorithm::Registry)
            .map(|r| Arc::clone(&r.balancer))
            .collect()
    }
}

fn build_route(
    rc: &RouteConfig,
    path: String,
    is_regex: bool,
    config: &GatewayConfig,
    base_opts: &BalancerOptions,
    registry: &MiddlewareRegistry,
    normalizer: &dyn TargetNormalizer,
) -> Result<Route, GatewayError> {
    let algorithm = rc
        .algorithm
        .as_deref()
        .unwrap_or(&config.load_balancer.algorithm);
    let opts = base_opts.clone().with_service(rc.service.clone());
    let balancer = LoadBalancer::new(algorithm, &opts)?;

    if balancer.algorithm() == Algorithm::Registry {
        if !rc.targets.is_empty() {
            tracing::warn!(
                "routing: static targets ignored for registry-backed route, path={}",
                path
            );
        }
    } else {
        let mut targets = Vec::with_capacity(rc.targets.len());
        for tc in &rc.targets {
            match normalizer.normalize_target(tc) {
                Ok(address) => targets.push(Target::new(address, tc.weight)),
                Err(e) => tracing::warn!("routing: skipped target, path={}, error={}", path, e),
            }
        }
        balancer.update_targets(targets);
    }

    Ok(Route {
        chain: MiddlewareChain::resolve(&rc.middlewares, registry, &path),
        methods: rc.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
        hash_on: HashOn::parse(&rc.hash_on)?,
        balancer,
        is_regex,
        path,
    })
}

/// Join `prefix` and `path` with exactly one slash, always rooted.
pub fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let mut joined = String::with_capacity(prefix.len() + path.len() + 2);
    if !prefix.starts_with('/') {
        joined.push('/');
    }
    joined.push_str(prefix);
    if !path.is_empty() {
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
    }
    joined
}
