//! Instance selection
//!
//! Picks one healthy instance for a service, preferring instances whose
//! breaker admits traffic but failing open when none do.

use std::sync::Arc;

use rand::Rng;

use super::{ServiceCatalog, ServiceInstance};
use crate::error::{ProxyError, Result};

/// Single discovery handle for the proxy data plane: selection plus
/// per-instance outcome marking
pub struct Selector {
    catalog: Arc<ServiceCatalog>,
}

impl Selector {
    pub fn new(catalog: Arc<ServiceCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve a service name to one concrete instance
    pub async fn select(&self, service_name: &str) -> Result<ServiceInstance> {
        let records = self.catalog.resolve(service_name).await?;

        let healthy: Vec<_> = records.iter().filter(|r| r.breaker.ok()).collect();
        // Fail open: trying a suspect instance beats refusing outright.
        let candidates = if healthy.is_empty() {
            records.iter().collect()
        } else {
            healthy
        };
        if candidates.is_empty() {
            return Err(ProxyError::NoAvailableInstance(service_name.to_string()));
        }

        let pick = candidates[rand::rng().random_range(0..candidates.len())];
        Ok(ServiceInstance {
            service_name: service_name.to_string(),
            id: pick.id.clone(),
            ip: pick.ip.clone(),
            port: pick.port,
        })
    }

    pub fn mark_success(&self, service_name: &str, id: &str) {
        self.catalog.mark_success(service_name, id);
    }

    pub fn mark_fail(&self, service_name: &str, id: &str) {
        self.catalog.mark_fail(service_name, id);
    }
}
