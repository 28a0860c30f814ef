//! Discovery Proxy
//!
//! Forward HTTP/HTTPS proxy that resolves request hosts against a
//! registry-backed service catalog and short-circuits failing instances

pub mod breaker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod proxy;

pub use config::{Config, RegistryConfig, RegistryNode};
pub use error::{ProxyError, Result};
