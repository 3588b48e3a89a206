//! HTTP client for the Teller server REST surface
//!
//! Decodes the `{code, message, data}` envelope and fails over between the
//! configured server addresses on connection errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use teller_api::RestResult;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Configuration for the HTTP client
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    /// Server base URLs, e.g. `http://127.0.0.1:8761`
    pub server_addrs: Vec<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8761".to_string()],
            connect_timeout_ms: 2000,
            read_timeout_ms: 35000,
        }
    }
}

impl HttpClientConfig {
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addrs: vec![server_addr.trim_end_matches('/').to_string()],
            ..Default::default()
        }
    }

    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs: server_addrs
                .into_iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }
}

pub struct TellerHttpClient {
    client: Client,
    config: HttpClientConfig,
    current_server_index: AtomicUsize,
}

impl TellerHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        if config.server_addrs.is_empty() {
            anyhow::bail!("at least one server address is required");
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: AtomicUsize::new(0),
        })
    }

    fn current_server(&self) -> &str {
        let index = self.current_server_index.load(Ordering::Relaxed) % self.config.server_addrs.len();
        &self.config.server_addrs[index]
    }

    fn switch_to_next_server(&self) {
        let next = self.current_server_index.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Switched to server index: {}",
            next % self.config.server_addrs.len()
        );
    }

    /// Send a request built against the current server, failing over on
    /// connection errors. Each server is tried at most once.
    pub async fn send<T, F>(&self, path: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let mut last_error = None;

        for _ in 0..self.config.server_addrs.len() {
            let url = format!("{}{}", self.current_server(), path);
            match build(&self.client, url).send().await {
                Ok(response) => return decode(response).await,
                Err(e) if e.is_connect() => {
                    warn!("Request failed: {}, switching to next server", e);
                    self.switch_to_next_server();
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(anyhow::anyhow!("All servers failed").into()),
        }
    }
}

/// Decode the response envelope, surfacing server error codes.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;

    match serde_json::from_slice::<RestResult<T>>(&body) {
        Ok(result) if result.is_success() => result.data.ok_or_else(|| ClientError::ServerError {
            code: result.code,
            message: "response carried no data".to_string(),
        }),
        Ok(result) => Err(ClientError::ServerError {
            code: result.code,
            message: result.message.unwrap_or_default(),
        }),
        Err(e) if status.is_success() => Err(anyhow::anyhow!("invalid response body: {}", e).into()),
        Err(_) => Err(ClientError::ServerError {
            code: status.as_u16() as i32,
            message: String::from_utf8_lossy(&body).into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let config = HttpClientConfig::new("http://localhost:8761/");
        assert_eq!(config.server_addrs, vec!["http://localhost:8761".to_string()]);

        let config = HttpClientConfig::with_servers(vec![
            "http://a:1/".to_string(),
            "http://b:2".to_string(),
        ])
        .with_timeouts(100, 200);
        assert_eq!(config.server_addrs[0], "http://a:1");
        assert_eq!(config.read_timeout_ms, 200);
    }

    #[test]
    fn test_client_requires_server() {
        let config = HttpClientConfig {
            server_addrs: Vec::new(),
            ..Default::default()
        };
        assert!(TellerHttpClient::new(config).is_err());
    }

    #[test]
    fn test_failover_rotates_servers() {
        let client = TellerHttpClient::new(HttpClientConfig::with_servers(vec![
            "http://a:1".to_string(),
            "http://b:2".to_string(),
        ]))
        .unwrap();
        assert_eq!(client.current_server(), "http://a:1");
        client.switch_to_next_server();
        assert_eq!(client.current_server(), "http://b:2");
        client.switch_to_next_server();
        assert_eq!(client.current_server(), "http://a:1");
    }
}
