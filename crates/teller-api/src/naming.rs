//! Service registry data models
//!
//! This module defines core data structures for service discovery:
//! - Service instance information and its status
//! - Leases handed out on registration and renewal
//! - Registration request/response payloads

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use teller_common::{DEFAULT_LEASE_DURATION_SECS, TellerError};

/// Lifecycle status of a registered instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    #[default]
    Up,
    Down,
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = TellerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(InstanceStatus::Starting),
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            other => Err(TellerError::IllegalArgument(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// A registered service instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host_address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub status: InstanceStatus,
    pub last_renewal_timestamp: i64,
    #[serde(default)]
    pub registration_timestamp: i64,
}

impl ServiceInstance {
    /// `host:port` authority used when forwarding to this instance.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host_address, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

/// Time-bounded liveness claim of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub instance_id: String,
    pub duration_secs: u64,
    pub expiry_timestamp: i64,
}

impl Lease {
    pub fn new(instance_id: impl Into<String>, duration_secs: u64, renewed_at_ms: i64) -> Self {
        Self {
            instance_id: instance_id.into(),
            duration_secs,
            expiry_timestamp: renewed_at_ms.saturating_add(
                i64::try_from(duration_secs)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(1000),
            ),
        }
    }

    /// A lease is expired once `lastRenewal + duration < now`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_timestamp < now_ms
    }
}

/// Registration request sent by an instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceRegistration {
    pub instance_id: Option<String>,
    pub service_name: String,
    pub host_address: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub lease_duration_secs: Option<u64>,
    pub status: Option<InstanceStatus>,
}

impl InstanceRegistration {
    pub fn new(service_name: impl Into<String>, host_address: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host_address: host_address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_lease_duration(mut self, secs: u64) -> Self {
        self.lease_duration_secs = Some(secs);
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn lease_duration_or_default(&self) -> u64 {
        self.lease_duration_secs
            .unwrap_or(DEFAULT_LEASE_DURATION_SECS)
    }

    /// Key identifying the network address of this registration.
    pub fn address_key(&self) -> String {
        format!("{}#{}#{}", self.service_name, self.host_address, self.port)
    }

    pub fn validate(&self) -> teller_common::Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(TellerError::IllegalArgument(
                "serviceName must not be empty".to_string(),
            ));
        }
        if self.host_address.trim().is_empty() {
            return Err(TellerError::IllegalArgument(
                "hostAddress must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TellerError::IllegalArgument(
                "port must be greater than 0".to_string(),
            ));
        }
        if matches!(self.instance_id.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(TellerError::IllegalArgument(
                "instanceId must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response to a successful registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub instance_id: String,
    pub lease: Lease,
}

/// Status override request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: InstanceStatus,
}

/// Service list item
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub instance_count: usize,
    pub up_count: usize,
}
