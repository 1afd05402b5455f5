//! HTTP seam between the client and the network.

use std::time::Duration;

use async_trait::async_trait;

use crate::{CensusConfig, CensusError, retry};

/// Identifies this client to the upstream.
const USER_AGENT: &str = concat!("census_explorer/", env!("CARGO_PKG_VERSION"));

/// Issues a GET and returns the decoded JSON body.
///
/// Implementations map HTTP outcomes onto [`CensusError`] so the client
/// never inspects status codes itself.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `GET url?query` and parses the response as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError`] for network, status, or decode failures.
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, CensusError>;
}

/// `reqwest`-backed transport with per-request timeout and retry.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpTransport {
    /// Builds the HTTP client from the timeout and retry settings.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if the client cannot be built.
    pub fn new(config: &CensusConfig) -> Result<Self, CensusError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CensusError::Configuration {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, CensusError> {
        retry::send_json(|| self.client.get(url).query(query), self.max_retries).await
    }
}
