#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Census Bureau data API client.
//!
//! Queries the American Community Survey endpoints under
//! `https://api.census.gov/data` for variable catalogs and estimates:
//!
//! - [`CensusClient::load_variables`] fetches the `variables.json` catalog
//!   of a dataset vintage.
//! - [`CensusClient::fetch_estimates`] fetches estimate/MOE pairs for a set
//!   of variables at a geography level, optionally annotated with a
//!   summary (denominator) variable.
//! - [`CensusClient::fetch_time_series`] fans one query out across several
//!   survey years.
//!
//! Raw responses are cached on disk (see [`cache`]) and every HTTP request
//! goes through the retry policy in [`retry`].

pub mod cache;
pub mod config;
pub mod estimates;
pub mod parse;
pub mod progress;
pub mod query;
pub mod retry;
pub mod transport;
pub mod variables;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use census_explorer_census_models::{Survey, TableKind};

pub use cache::{CacheEntry, CacheKey, ResponseCache};
pub use config::CensusConfig;
pub use estimates::EstimateQuery;
pub use transport::{HttpTransport, Transport};

/// Errors from Census API operations.
#[derive(Debug, thiserror::Error)]
pub enum CensusError {
    /// Network failure, timeout, or 5xx after all retries.
    #[error("Census API unavailable: {message}")]
    UpstreamUnavailable {
        /// Description of the last failure.
        message: String,
    },

    /// HTTP 429. Not retried; wait at least `retry_after` before the next
    /// request with the same key.
    #[error("Census API rate limit exceeded (retry after {retry_after:?})")]
    RateLimited {
        /// Cooldown from the `Retry-After` header, if the upstream sent one.
        retry_after: Option<Duration>,
    },

    /// Malformed query or invalid geography filter combination.
    #[error("Bad request: {message}")]
    BadRequest {
        /// Description of what was rejected.
        message: String,
    },

    /// The dataset, year, survey, or variable combination does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// Description of what was missing.
        message: String,
    },

    /// Missing or rejected API credential. Raised before any request when
    /// the key is absent.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The response did not have the expected tabular shape.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the malformed content.
        message: String,
    },

    /// Cache file I/O failed.
    #[error("Cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CensusError {
    /// Whether repeating the same request may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::RateLimited { .. }
        )
    }
}

/// Client for the Census data API.
///
/// Holds the validated configuration, the transport used for HTTP, and the
/// optional on-disk response cache. Cheap to share behind a reference
/// across concurrent fetches.
pub struct CensusClient {
    config: CensusConfig,
    api_key: String,
    transport: Arc<dyn Transport>,
    cache: Option<ResponseCache>,
}

impl std::fmt::Debug for CensusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CensusClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CensusClient {
    /// Creates a client that talks HTTP via `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if no API key is configured
    /// or the HTTP client cannot be built.
    pub fn new(mut config: CensusConfig) -> Result<Self, CensusError> {
        config.clamp_limits();
        let api_key = config.require_api_key()?.to_string();
        let transport = HttpTransport::new(&config)?;
        Ok(Self::assemble(config, api_key, Arc::new(transport)))
    }

    /// Creates a client over a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if no API key is configured.
    pub fn with_transport(
        mut config: CensusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CensusError> {
        config.clamp_limits();
        let api_key = config.require_api_key()?.to_string();
        Ok(Self::assemble(config, api_key, transport))
    }

    fn assemble(config: CensusConfig, api_key: String, transport: Arc<dyn Transport>) -> Self {
        let cache = config
            .cache_dir
            .as_ref()
            .map(|dir| ResponseCache::new(dir.clone(), config.cache_max_age()));
        Self {
            config,
            api_key,
            transport,
            cache,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CensusConfig {
        &self.config
    }

    /// The on-disk response cache, if caching is enabled.
    #[must_use]
    pub const fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Base URL of a dataset, e.g.
    /// `https://api.census.gov/data/2022/acs/acs5/subject`.
    #[must_use]
    pub fn dataset_url(&self, year: u16, survey: Survey, kind: TableKind) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        kind.path_suffix().map_or_else(
            || format!("{base}/{year}/acs/{survey}"),
            |suffix| format!("{base}/{year}/acs/{survey}/{suffix}"),
        )
    }

    /// Issues a GET through the cache.
    ///
    /// With `use_cache` a cache hit returns the stored payload without a
    /// network call. Without it the cache is bypassed for reading but
    /// refreshed with the new response. The API key is appended here so it
    /// never becomes part of a cache key.
    async fn get_cached(
        &self,
        url: &str,
        params: &[(String, String)],
        key: &CacheKey,
        use_cache: bool,
    ) -> Result<serde_json::Value, CensusError> {
        if use_cache && let Some(cache) = &self.cache {
            match cache.get(key) {
                Ok(Some(entry)) => {
                    log::debug!("Cache hit for {key} (fetched {})", entry.fetched_at);
                    return Ok(entry.payload);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Cache read failed for {key}: {e}"),
            }
        }

        let mut query = params.to_vec();
        query.push(("key".to_string(), self.api_key.clone()));

        log::debug!("GET {url} {params:?}");
        let payload = self.transport.get_json(url, &query).await?;

        if let Some(cache) = &self.cache
            && let Err(e) = cache.put(key, &payload)
        {
            log::warn!("Cache write failed for {key}: {e}");
        }

        Ok(payload)
    }
}
