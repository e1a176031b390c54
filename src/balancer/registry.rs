use super::{LoadBalancer, SelectContext, Target};
use std::sync::atomic::{AtomicBool, Ordering};

/// Balancer over a target set owned by an external service directory.
///
/// The set is replaced wholesale by the registry sync loop; selection is
/// delegated to the configured inner strategy. Until the first successful
/// sync the set is empty and every selection fails with no target.
pub struct RegistryBalancer {
    service: String,
    inner: Box<LoadBalancer>,
    synced: AtomicBool,
}

impl RegistryBalancer {
    pub(super) fn new(service: String, inner: LoadBalancer) -> Self {
        Self {
            service,
            inner: Box::new(inner),
            synced: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn inner(&self) -> &LoadBalancer {
        &self.inner
    }

    /// Whether at least one directory answer has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn update_targets(&self, targets: Vec<Target>) {
        self.inner.update_targets(targets);
        self.synced.store(true, Ordering::Release);
    }

    pub fn do_select(&self, ctx: &SelectContext<'_>) -> Option<Target> {
        self.inner.select(ctx).ok()
    }

    pub fn get_targets(&self) -> Vec<Target> {
        self.inner.targets()
    }
}
