//! Configuration module for the discovery proxy
//!
//! Configuration is built once from the command line in `main` and passed by
//! value to the constructors that need it; there is no process-global state.

/// A registry server endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryNode {
    pub ip: String,
    pub port: u16,
}

impl RegistryNode {
    /// Base URL of this node's HTTP API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// Registry-side configuration (which registry to talk to, and how names are
/// scoped inside it)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub namespace: String,
    pub group: String,
    pub cluster: String,
    pub nodes: Vec<RegistryNode>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub registry: RegistryConfig,

    /// Proxy bind address, e.g. `0.0.0.0:1080`
    pub listen_addr: String,

    /// Attempts per proxied request
    pub retry_times: u32,
}

impl Config {
    /// Build and validate a configuration from raw flag values
    pub fn new(
        namespace: String,
        group: String,
        cluster: String,
        nodes: &str,
        listen_addr: String,
        retry_times: u32,
    ) -> Result<Self, ConfigError> {
        if namespace.is_empty() || group.is_empty() || cluster.is_empty() || listen_addr.is_empty()
        {
            return Err(ConfigError::MissingFlag);
        }
        if retry_times == 0 {
            return Err(ConfigError::InvalidValue(
                "retry must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            registry: RegistryConfig {
                namespace,
                group,
                cluster,
                nodes: parse_nodes(nodes)?,
            },
            listen_addr,
            retry_times,
        })
    }
}

/// Parse a comma-separated `ip:port` list into registry nodes
fn parse_nodes(raw: &str) -> Result<Vec<RegistryNode>, ConfigError> {
    let mut nodes = Vec::new();
    for part in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (ip, port) = part
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidValue(format!("node `{}` is not ip:port", part)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("bad port in node `{}`", part)))?;
        if ip.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "node `{}` has an empty host",
                part
            )));
        }
        nodes.push(RegistryNode {
            ip: ip.to_string(),
            port,
        });
    }
    if nodes.is_empty() {
        return Err(ConfigError::InvalidValue(
            "registry node list is empty".to_string(),
        ));
    }
    Ok(nodes)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required flag is empty")]
    MissingFlag,

    #[error("invalid flag value: {0}")]
    InvalidValue(String),
}
