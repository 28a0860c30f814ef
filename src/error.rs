//! Error handling for the discovery proxy
//!
//! Unified error types shared by the catalog, selector and proxy data plane

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("no available instance for service: {0}")]
    NoAvailableInstance(String),

    #[error("registry request failed: {0}")]
    Registry(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("tunnel half-closed for too long")]
    HalfCloseIdle,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ProxyError>;
