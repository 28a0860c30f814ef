//! Nacos registry client
//!
//! Talks to the Nacos v1 open HTTP API. Every call tries the configured
//! registry nodes in order and returns the first success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{InstanceSource, RawInstance};
use crate::config::RegistryConfig;
use crate::error::{ProxyError, Result};

const INSTANCE_PATH: &str = "/nacos/v1/ns/instance";
const INSTANCE_LIST_PATH: &str = "/nacos/v1/ns/instance/list";

/// Registration parameters for one instance
#[derive(Debug, Clone)]
pub struct RegisterInstanceOptions {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub enable: bool,
}

/// Deregistration parameters
#[derive(Debug, Clone)]
pub struct DeregisterInstanceOptions {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
}

/// Instance update parameters
#[derive(Debug, Clone)]
pub struct UpdateInstanceOptions {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub enable: bool,
}

/// Client for a Nacos-compatible naming service
pub struct NacosRegistry {
    client: Client,
    config: RegistryConfig,
}

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    #[serde(default)]
    hosts: Vec<NacosHost>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NacosHost {
    #[serde(default)]
    instance_id: String,
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    cluster_name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl NacosRegistry {
    /// Create a new registry client
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProxyError::Registry(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Register an ephemeral instance under the configured cluster and group
    pub async fn register_instance(&self, options: &RegisterInstanceOptions) -> Result<()> {
        let query = [
            ("serviceName", options.service_name.clone()),
            ("ip", options.ip.clone()),
            ("port", options.port.to_string()),
            ("weight", options.weight.to_string()),
            ("enabled", options.enable.to_string()),
            ("healthy", "true".to_string()),
            ("ephemeral", "true".to_string()),
            ("clusterName", self.config.cluster.clone()),
            ("groupName", self.config.group.clone()),
            ("namespaceId", self.config.namespace.clone()),
        ];
        self.write_op(reqwest::Method::POST, &query).await
    }

    /// Remove a previously registered instance
    pub async fn deregister_instance(&self, options: &DeregisterInstanceOptions) -> Result<()> {
        let query = [
            ("serviceName", options.service_name.clone()),
            ("ip", options.ip.clone()),
            ("port", options.port.to_string()),
            ("ephemeral", "true".to_string()),
            ("clusterName", self.config.cluster.clone()),
            ("groupName", self.config.group.clone()),
            ("namespaceId", self.config.namespace.clone()),
        ];
        self.write_op(reqwest::Method::DELETE, &query).await
    }

    /// Update weight/enable state of a registered instance
    pub async fn update_instance(&self, options: &UpdateInstanceOptions) -> Result<()> {
        let query = [
            ("serviceName", options.service_name.clone()),
            ("ip", options.ip.clone()),
            ("port", options.port.to_string()),
            ("weight", options.weight.to_string()),
            ("enabled", options.enable.to_string()),
            ("ephemeral", "true".to_string()),
            ("clusterName", self.config.cluster.clone()),
            ("groupName", self.config.group.clone()),
            ("namespaceId", self.config.namespace.clone()),
        ];
        self.write_op(reqwest::Method::PUT, &query).await
    }

    async fn write_op(&self, method: reqwest::Method, query: &[(&str, String)]) -> Result<()> {
        let mut last_err = None;
        for node in &self.config.nodes {
            let url = format!("{}{}", node.base_url(), INSTANCE_PATH);
            let result = self
                .client
                .request(method.clone(), &url)
                .query(query)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_err = Some(ProxyError::Registry(format!(
                        "registry node {} answered {}: {}",
                        url, status, body
                    )));
                }
                Err(e) => {
                    tracing::debug!(node = %url, error = %e, "registry node unreachable");
                    last_err = Some(ProxyError::Registry(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProxyError::Registry("no registry nodes configured".into())))
    }
}

#[async_trait]
impl InstanceSource for NacosRegistry {
    async fn fetch_healthy(&self, service_name: &str, group: &str) -> Result<Vec<RawInstance>> {
        let query = [
            ("serviceName", service_name.to_string()),
            ("groupName", group.to_string()),
            ("namespaceId", self.config.namespace.clone()),
            ("clusters", self.config.cluster.clone()),
            ("healthyOnly", "true".to_string()),
        ];

        let mut last_err = None;
        for node in &self.config.nodes {
            let url = format!("{}{}", node.base_url(), INSTANCE_LIST_PATH);
            let result = self.client.get(&url).query(&query).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let listing = response
                        .json::<InstanceListResponse>()
                        .await
                        .map_err(|e| ProxyError::Registry(format!("bad instance listing: {}", e)))?;
                    return Ok(listing
                        .hosts
                        .into_iter()
                        .filter(|h| h.enabled)
                        .map(|h| to_raw_instance(h, service_name))
                        .collect());
                }
                Ok(response) => {
                    last_err = Some(ProxyError::Registry(format!(
                        "registry node {} answered {}",
                        url,
                        response.status()
                    )));
                }
                Err(e) => {
                    tracing::debug!(node = %url, error = %e, "registry node unreachable");
                    last_err = Some(ProxyError::Registry(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProxyError::Registry("no registry nodes configured".into())))
    }
}

/// Map a registry host row to an instance record, synthesizing the id the
/// way Nacos itself does when the row carries none
fn to_raw_instance(host: NacosHost, service_name: &str) -> RawInstance {
    let id = if host.instance_id.is_empty() {
        format!(
            "{}#{}#{}#{}",
            host.ip, host.port, host.cluster_name, service_name
        )
    } else {
        host.instance_id
    };
    RawInstance {
        id,
        ip: host.ip,
        port: host.port,
        weight: host.weight,
        cluster: host.cluster_name,
    }
}
