//! Teller Common - shared types for the Teller platform core
//!
//! This crate provides:
//! - `TellerError`: the error kinds shared by registry, config and gateway
//! - `ErrorCode`: stable numeric codes rendered in API responses
//! - `Clock`: wall-clock abstraction with a manual clock for tests
//! - `ShutdownSignal`: cooperative shutdown for background tasks

pub mod clock;
pub mod error;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, Result, TellerError};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};

/// Default lease duration handed to instances that do not ask for one.
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;

/// Longest lease the registry grants (one day).
pub const MAX_LEASE_DURATION_SECS: u64 = 86_400;

/// Metadata key an instance uses to report the config version it runs.
pub const CONFIG_VERSION_METADATA_KEY: &str = "config.version";

/// Metadata key an instance uses to report its active config profile.
pub const CONFIG_PROFILE_METADATA_KEY: &str = "config.profile";
