//! Teller API - data model and wire contract
//!
//! Types shared by the registry/config server, the embedded discovery
//! client and the gateway. Everything here serializes as camelCase JSON.

pub mod config;
pub mod naming;
pub mod response;

pub use config::{BundleQuery, ConfigBundle, Property, bundle_key};
pub use naming::{
    InstanceRegistration, InstanceStatus, Lease, RegisterResponse, ServiceInstance, ServiceSummary,
    StatusUpdate,
};
pub use response::RestResult;
