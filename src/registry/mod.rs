//! Pool registry client
//!
//! Fetches the pool record from the chain's REST API:
//!   GET {endpoint}/kyve/registry/v1beta1/pool/{pool_id}
//!
//! Connectivity failures and unreadable bodies are retried according to a
//! [`RetryPolicy`]. The `config` and `protocol.binaries` fields arrive as JSON
//! encoded inside strings and get a second decode pass; a broken embedded
//! field degrades to an empty mapping instead of failing the fetch.

pub mod retry;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use retry::RetryPolicy;

/// Path prefix of pool records on the REST API
pub const POOL_PATH: &str = "/kyve/registry/v1beta1/pool";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of a pool as published by the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolDescriptor {
    /// Pool this record was requested for
    pub pool_id: String,

    /// Binary family tag
    pub runtime: Option<String>,

    /// Version the pool currently expects
    pub version: Option<String>,

    /// Host target key -> download URL
    pub binaries: BTreeMap<String, String>,

    /// Free-form pool configuration
    pub raw_config: serde_json::Map<String, serde_json::Value>,
}

impl PoolDescriptor {
    /// Download URL published for `host_target`
    pub fn download_link(&self, host_target: &str) -> Option<&str> {
        self.binaries.get(host_target).map(String::as_str)
    }

    /// Decode a registry response body
    pub fn from_response(pool_id: &str, body: &[u8]) -> Result<Self, RegistryError> {
        let response: PoolResponse = serde_json::from_slice(body)
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
        Ok(Self::from_wire(pool_id, response.pool))
    }

    fn from_wire(pool_id: &str, pool: PoolWire) -> Self {
        let binaries = decode_embedded(pool.protocol.binaries.as_ref()).or_empty("binaries");
        let raw_config = decode_embedded(pool.config.as_ref()).or_empty("config");

        Self {
            pool_id: pool_id.to_string(),
            runtime: non_empty(pool.runtime),
            version: non_empty(pool.protocol.version),
            binaries,
            raw_config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    pool: PoolWire,
}

#[derive(Debug, Default, Deserialize)]
struct PoolWire {
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    protocol: ProtocolWire,
}

#[derive(Debug, Default, Deserialize)]
struct ProtocolWire {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    binaries: Option<serde_json::Value>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Result of the second decode pass over an embedded JSON field
#[derive(Debug, Clone, PartialEq)]
pub enum Embedded<T> {
    Decoded(T),
    Missing,
    Malformed { raw: String, error: String },
}

/// Decode a field that is either JSON text inside a string or already a
/// JSON value.
pub fn decode_embedded<T: DeserializeOwned>(field: Option<&serde_json::Value>) -> Embedded<T> {
    let value = match field {
        None | Some(serde_json::Value::Null) => return Embedded::Missing,
        Some(value) => value,
    };

    let decoded = match value {
        serde_json::Value::String(text) if text.trim().is_empty() => return Embedded::Missing,
        serde_json::Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };

    match decoded {
        Ok(inner) => Embedded::Decoded(inner),
        Err(e) => Embedded::Malformed {
            raw: value.to_string(),
            error: e.to_string(),
        },
    }
}

impl<T: Default> Embedded<T> {
    /// Typed fallback: anything but a clean decode becomes `T::default()`
    pub fn or_empty(self, field: &str) -> T {
        match self {
            Embedded::Decoded(inner) => inner,
            Embedded::Missing => T::default(),
            Embedded::Malformed { raw, error } => {
                error!(field, %error, "Failed to parse the pool {}: {}", field, raw);
                T::default()
            }
        }
    }
}

/// Client for the pool registry
pub struct RegistryClient {
    endpoint: String,
    policy: RetryPolicy,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            policy,
            http: reqwest::Client::new(),
        }
    }

    pub fn pool_url(&self, pool_id: &str) -> String {
        format!("{}{}/{}", self.endpoint, POOL_PATH, pool_id)
    }

    /// Fetch the pool record, retrying until it succeeds.
    ///
    /// Only returns an error when `cancel` fires or a bounded policy runs out
    /// of attempts.
    pub async fn fetch_pool_state(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PoolDescriptor, RegistryError> {
        let url = self.pool_url(pool_id);
        let mut failures: u32 = 0;

        loop {
            info!(pool_id, attempt = failures + 1, "Attempting to fetch pool state");

            let result = tokio::select! {
                result = self.fetch_once(pool_id, &url) => result,
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            };

            let error = match result {
                Ok(descriptor) => {
                    info!(pool_id, "Fetched pool state");
                    return Ok(descriptor);
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            if !self.policy.allows_retry(failures) {
                return Err(RegistryError::AttemptsExhausted {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }

            let delay = self.policy.delay_for(failures);
            warn!(
                pool_id,
                attempt = failures,
                error = %error,
                "Failed to fetch pool state. Retrying in {}s ...",
                delay.as_secs()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            }
        }
    }

    async fn fetch_once(&self, pool_id: &str, url: &str) -> Result<PoolDescriptor, RegistryError> {
        let response = self
            .http
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        PoolDescriptor::from_response(pool_id, &body)
    }
}

/// Registry errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Registry returned HTTP {0}")]
    Status(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    #[error("Cancelled")]
    Cancelled,
}
