//! Service discovery: registry client, instance catalog and selection

pub mod catalog;
pub mod nacos;
pub mod selector;

pub use catalog::{CatalogConfig, InstanceRecord, ServiceCatalog};
pub use nacos::NacosRegistry;
pub use selector::Selector;

use async_trait::async_trait;

use crate::error::Result;

/// A live instance as reported by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RawInstance {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub cluster: String,
}

/// The resolved target for one proxied request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl ServiceInstance {
    /// `ip:port` dial target
    pub fn authority(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// External registry abstraction. Only healthy-instance listing is consumed
/// by the proxy core; registration management stays on the concrete client.
#[async_trait]
pub trait InstanceSource: Send + Sync + 'static {
    async fn fetch_healthy(&self, service_name: &str, group: &str) -> Result<Vec<RawInstance>>;
}
