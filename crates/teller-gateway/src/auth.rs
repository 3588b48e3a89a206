//! Inbound authentication
//!
//! Token validation is delegated to an [`Authorizer`]. The gateway only
//! consumes its decision: reject, or pass with an optional [`Identity`]
//! whose claims are forwarded downstream.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use teller_common::TellerError;
use tracing::{debug, warn};

use crate::route::PathPattern;

/// Paths served without authentication by default.
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &[
    "/favicon.ico",
    "/actuator/**",
    "/swagger-ui.html",
    "/swagger-ui/**",
    "/v3/api-docs/**",
    "/*/v3/api-docs",
    "/webjars/**",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub claims: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: BTreeMap::new(),
        }
    }

    pub fn with_claim(mut self, name: &str, value: &str) -> Self {
        self.claims.insert(name.to_string(), value.to_string());
        self
    }
}

/// Validates the bearer token of an inbound request.
///
/// `Ok(None)` admits the request anonymously.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: Option<&str>, path: &str) -> Result<Option<Identity>, TellerError>;
}

/// Admits everything, forwarding no identity.
#[derive(Debug, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _token: Option<&str>, _path: &str) -> Result<Option<Identity>, TellerError> {
        Ok(None)
    }
}

/// Maps fixed bearer tokens to identities.
#[derive(Debug, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, token: Option<&str>, _path: &str) -> Result<Option<Identity>, TellerError> {
        let token = token.ok_or_else(|| TellerError::Unauthorized("missing bearer token".to_string()))?;
        self.tokens
            .get(token)
            .cloned()
            .map(Some)
            .ok_or_else(|| TellerError::Unauthorized("invalid token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    sub: Option<String>,
    scope: Option<String>,
    client_id: Option<String>,
}

/// Asks an external token introspection endpoint about each token.
pub struct IntrospectionAuthorizer {
    client: Client,
    endpoint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    required_scope: Option<String>,
}

impl IntrospectionAuthorizer {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            client_id: None,
            client_secret: None,
            required_scope: None,
        })
    }

    pub fn with_credentials(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = Some(client_secret.to_string());
        self
    }

    pub fn with_required_scope(mut self, scope: &str) -> Self {
        self.required_scope = Some(scope.to_string());
        self
    }
}

#[async_trait]
impl Authorizer for IntrospectionAuthorizer {
    async fn authorize(&self, token: Option<&str>, path: &str) -> Result<Option<Identity>, TellerError> {
        let token = token.ok_or_else(|| TellerError::Unauthorized("missing bearer token".to_string()))?;

        let mut request = self.client.post(&self.endpoint).form(&[("token", token)]);
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            warn!(endpoint = %self.endpoint, error = %e, "Token introspection failed");
            TellerError::Unauthorized("token introspection unavailable".to_string())
        })?;
        if !response.status().is_success() {
            return Err(TellerError::Unauthorized(format!(
                "introspection returned {}",
                response.status()
            )));
        }
        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| TellerError::Unauthorized(format!("malformed introspection response: {}", e)))?;

        if !body.active {
            return Err(TellerError::Unauthorized("token is not active".to_string()));
        }

        let scopes: Vec<&str> = body.scope.as_deref().unwrap_or_default().split_whitespace().collect();
        if let Some(required) = &self.required_scope
            && !scopes.contains(&required.as_str())
        {
            debug!(path = %path, scope = %required, "Token lacks required scope");
            return Err(TellerError::AccessDenied(format!("scope '{}' required", required)));
        }

        let subject = body
            .sub
            .clone()
            .or_else(|| body.client_id.clone())
            .unwrap_or_default();
        let mut identity = Identity::new(subject);
        if let Some(scope) = &body.scope {
            identity.claims.insert("scope".to_string(), scope.clone());
        }
        if let Some(client_id) = &body.client_id {
            identity.claims.insert("client_id".to_string(), client_id.clone());
        }
        Ok(Some(identity))
    }
}

/// Permit list of paths that bypass the authorizer.
#[derive(Debug, Clone)]
pub struct PublicPaths {
    patterns: Vec<PathPattern>,
}

impl PublicPaths {
    pub fn new<S: AsRef<str>>(paths: &[S]) -> Result<Self, TellerError> {
        let patterns = paths
            .iter()
            .map(|p| PathPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

impl Default for PublicPaths {
    fn default() -> Self {
        let patterns = DEFAULT_PUBLIC_PATHS
            .iter()
            .filter_map(|p| PathPattern::parse(p).ok())
            .collect();
        Self { patterns }
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}
