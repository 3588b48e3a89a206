//! Configuration bundle models

use serde::{Deserialize, Serialize};
use teller_common::TellerError;

/// One key/value entry of a bundle. Order inside a bundle is significant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// Versioned, immutable set of configuration properties for a service/profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBundle {
    pub service_name: String,
    pub profile: String,
    pub version: u64,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub published_at: i64,
}

impl ConfigBundle {
    pub fn new(service_name: impl Into<String>, profile: impl Into<String>, version: u64) -> Self {
        Self {
            service_name: service_name.into(),
            profile: profile.into(),
            version,
            properties: Vec::new(),
            published_at: 0,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(Property {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// First value declared for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Storage key: `serviceName@@profile`
    pub fn key(&self) -> String {
        bundle_key(&self.service_name, &self.profile)
    }

    pub fn validate(&self) -> teller_common::Result<()> {
        validate_name("serviceName", &self.service_name)?;
        validate_name("profile", &self.profile)?;
        if self.version == 0 {
            return Err(TellerError::IllegalArgument(
                "version must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Names end up in storage paths: only `[A-Za-z0-9._-]`, never `.` or `..`.
fn validate_name(field: &str, value: &str) -> teller_common::Result<()> {
    if value.trim().is_empty() {
        return Err(TellerError::IllegalArgument(format!(
            "{field} must not be empty"
        )));
    }
    if value == "." || value == ".." {
        return Err(TellerError::IllegalArgument(format!(
            "{field} must not be '{value}'"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(TellerError::IllegalArgument(format!(
            "{field} contains illegal character {c:?}"
        )));
    }
    Ok(())
}

/// Build the bundle key for a (serviceName, profile) pair.
pub fn bundle_key(service_name: &str, profile: &str) -> String {
    format!("{}@@{}", service_name, profile)
}

/// Query parameters of the fetch endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleQuery {
    pub min_version: Option<u64>,
    /// Long-poll budget; absent or zero means answer immediately.
    pub wait_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_get_returns_first_declared() {
        let bundle = ConfigBundle::new("customer", "prod", 1)
            .with_property("db.pool", "10")
            .with_property("db.pool", "20");
        assert_eq!(bundle.get("db.pool"), Some("10"));
        assert_eq!(bundle.get("missing"), None);
        assert_eq!(bundle.key(), "customer@@prod");
    }

    #[test]
    fn test_bundle_validation() {
        assert!(ConfigBundle::new("customer", "prod", 1).validate().is_ok());
        assert!(ConfigBundle::new("", "prod", 1).validate().is_err());
        assert!(ConfigBundle::new("customer", "", 1).validate().is_err());
        assert!(ConfigBundle::new("customer", "prod", 0).validate().is_err());
        assert!(ConfigBundle::new("a@@b", "prod", 1).validate().is_err());
    }

    #[test]
    fn test_bundle_names_cannot_leave_storage_dir() {
        assert!(ConfigBundle::new("card-api_v2.1", "eu.prod", 1).validate().is_ok());
        for profile in ["x/../../escaped", "..", ".", "a\\b", "/etc", "a\0b", "a b"] {
            let err = ConfigBundle::new("svc", profile, 1).validate().unwrap_err();
            assert!(matches!(err, TellerError::IllegalArgument(_)), "{profile:?}");
        }
        assert!(ConfigBundle::new("../svc", "prod", 1).validate().is_err());
    }

    #[test]
    fn test_bundle_properties_keep_order() {
        let json = r#"{"serviceName":"card","profile":"dev","version":3,
            "properties":[{"key":"b","value":"2"},{"key":"a","value":"1"}]}"#;
        let bundle: ConfigBundle = serde_json::from_str(json).unwrap();
        let keys: Vec<&str> = bundle.properties.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(bundle.published_at, 0);
    }

    #[test]
    fn test_query_defaults() {
        let query: BundleQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query, BundleQuery::default());
    }
}
