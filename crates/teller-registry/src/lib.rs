//! Teller Registry - service discovery core
//!
//! This crate provides:
//! - `RegistryStore`: in-memory table of instances, their leases and status
//! - `HeartbeatMonitor`: periodic lease expiry sweeps and eviction
//! - `RegistryEvent`: registration/eviction notifications

pub mod event;
pub mod heartbeat;
pub mod store;

pub use event::RegistryEvent;
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, SweepReport};
pub use store::RegistryStore;
