//! Client configuration.
//!
//! Settings come from an optional TOML file with environment variables
//! layered on top:
//!
//! | Variable | Field |
//! | --- | --- |
//! | `CENSUS_API_KEY` | `api_key` |
//! | `CENSUS_EXPLORER_BASE_URL` | `base_url` |
//! | `CENSUS_EXPLORER_CACHE_DIR` | `cache_dir` |
//!
//! ```toml
//! api_key = "..."
//! cache_dir = "data/cache"
//! timeout_secs = 60
//! max_retries = 3
//! concurrency = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CensusError;

/// Default upstream endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.census.gov/data";

/// Upper bound on `max_retries`; larger configured values are lowered.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "CENSUS_API_KEY";

const BASE_URL_ENV: &str = "CENSUS_EXPLORER_BASE_URL";
const CACHE_DIR_ENV: &str = "CENSUS_EXPLORER_CACHE_DIR";

/// Explicit client configuration, passed to every
/// [`CensusClient`](crate::CensusClient).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CensusConfig {
    /// Census API key. Required; see <https://api.census.gov/data/key_signup.html>.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Directory for the response cache. `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Entries older than this are refetched. `None` keeps entries until
    /// they are invalidated.
    pub cache_max_age_secs: Option<u64>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Retries for transient failures.
    pub max_retries: u32,
    /// Concurrent requests for multi-year fetches.
    pub concurrency: usize,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            cache_dir: Some(PathBuf::from("data/cache")),
            cache_max_age_secs: None,
            timeout_secs: 60,
            max_retries: 3,
            concurrency: 4,
        }
    }
}

impl std::fmt::Debug for CensusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CensusConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("cache_dir", &self.cache_dir)
            .field("cache_max_age_secs", &self.cache_max_age_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl CensusConfig {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Reads a TOML file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: &Path) -> Result<Self, CensusError> {
        let text = std::fs::read_to_string(path).map_err(|e| CensusError::Configuration {
            message: format!("Failed to read config {}: {e}", path.display()),
        })?;
        let mut config = Self::from_toml(&text).map_err(|e| CensusError::Configuration {
            message: format!("Invalid config {}: {e}", path.display()),
        })?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads from `path` when given, otherwise from the environment alone.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if the file is unusable.
    pub fn load(path: Option<&Path>) -> Result<Self, CensusError> {
        path.map_or_else(|| Ok(Self::from_env()), Self::from_file)
    }

    /// Parses TOML without consulting the environment. Out-of-range
    /// limits are clamped (see [`Self::clamp_limits`]).
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the text is malformed.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(text)?;
        config.clamp_limits();
        Ok(config)
    }

    /// Lowers `max_retries` to [`MAX_RETRIES_LIMIT`] and raises
    /// `concurrency` to at least one.
    pub fn clamp_limits(&mut self) {
        if self.max_retries > MAX_RETRIES_LIMIT {
            log::warn!(
                "max_retries = {} exceeds the limit; using {MAX_RETRIES_LIMIT}",
                self.max_retries
            );
            self.max_retries = MAX_RETRIES_LIMIT;
        }
        if self.concurrency == 0 {
            log::warn!("concurrency = 0 is not usable; using 1");
            self.concurrency = 1;
        }
    }

    /// Overrides fields from variables resolved by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV) {
            self.cache_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
    }

    /// Returns the API key, or a configuration error when it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Configuration`] if the key is absent or blank.
    pub fn require_api_key(&self) -> Result<&str, CensusError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CensusError::Configuration {
                message: format!(
                    "No Census API key configured. Set {API_KEY_ENV} or `api_key` in the config file"
                ),
            })
    }

    #[must_use]
    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache_max_age_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = CensusConfig::from_toml(
            r#"
            api_key = "abc123"
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("abc123"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn oversized_limits_are_clamped() {
        let config = CensusConfig::from_toml(
            r"
            max_retries = 1000
            concurrency = 0
            ",
        )
        .unwrap();

        assert_eq!(config.max_retries, MAX_RETRIES_LIMIT);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = CensusConfig::from_toml(r#"api_key = "from-file""#).unwrap();
        let env: BTreeMap<&str, &str> = [
            (API_KEY_ENV, "from-env"),
            (CACHE_DIR_ENV, "/tmp/census-cache"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|name| env.get(name).map(ToString::to_string));

        assert_eq!(config.api_key.as_deref(), Some("from-env"));
        assert_eq!(
            config.cache_dir.as_deref(),
            Some(Path::new("/tmp/census-cache"))
        );
    }

    #[test]
    fn empty_cache_dir_disables_cache() {
        let mut config = CensusConfig::default();
        config.apply_overrides(|name| (name == CACHE_DIR_ENV).then(String::new));
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn missing_key_is_reported() {
        let config = CensusConfig::default();
        let err = config.require_api_key().unwrap_err();
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn debug_redacts_key() {
        let config = CensusConfig {
            api_key: Some("secret-key".to_string()),
            ..CensusConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn unreadable_file_is_configuration_error() {
        let err = CensusConfig::from_file(Path::new("/nonexistent/census.toml")).unwrap_err();
        assert!(matches!(err, CensusError::Configuration { .. }));
    }
}
