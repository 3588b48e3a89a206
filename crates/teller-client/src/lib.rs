//! Teller Client - embedded in every service
//!
//! This crate provides:
//! - `DiscoveryClient`: self-registration, lease renewal and a cached peer view
//! - `ConfigClient`: config bundle polling with change listeners
//! - transports to reach the registry/config server over HTTP or in-process

pub mod config_client;
pub mod discovery;
pub mod error;
pub mod http;
pub mod transport;

pub use config_client::{ConfigClient, ConfigListener, FnConfigListener};
pub use discovery::{ClientState, DiscoveryClient, DiscoveryConfig, ServiceDiscovery};
pub use error::{ClientError, Result};
pub use http::{HttpClientConfig, TellerHttpClient};
pub use transport::{
    ConfigTransport, HttpConfigTransport, HttpRegistryTransport, LocalConfigTransport,
    LocalRegistryTransport, RegistryTransport,
};
