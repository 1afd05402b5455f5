//! On-disk response cache.
//!
//! One JSON file per request, named by the SHA-256 of its [`CacheKey`].
//! Entries are written to a temporary file in the cache directory and
//! renamed into place, so concurrent readers see either the previous entry
//! or the complete new one, never a partial write.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use census_explorer_census_models::Survey;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::CensusError;

/// Identity of a cached response:
/// `(endpoint, year, survey, geography level, filters hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    endpoint: String,
    year: u16,
    survey: Survey,
    geography: String,
    filters_hash: String,
}

impl CacheKey {
    /// Builds a key from request parameters. Parameter order does not
    /// matter; the API key must not be among `params`.
    #[must_use]
    pub fn new(
        endpoint: &str,
        year: u16,
        survey: Survey,
        geography: &str,
        params: &[(String, String)],
    ) -> Self {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();

        let mut hasher = Sha256::new();
        for (name, value) in sorted {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }

        Self {
            endpoint: endpoint.to_string(),
            year,
            survey,
            geography: geography.to_string(),
            filters_hash: hex::encode(hasher.finalize()),
        }
    }

    fn file_name(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        format!("{}.json", hex::encode(digest))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.endpoint, self.year, self.survey, self.geography, self.filters_hash
        )
    }
}

/// A cached upstream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Display form of the [`CacheKey`], kept for inspection.
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    /// The parsed upstream JSON (tabular rows or a variable catalog).
    pub payload: serde_json::Value,
}

impl CacheEntry {
    /// Whether the entry is older than `max_age` at `now`.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(max_age)
            .map_or(false, |max_age| now.signed_duration_since(self.fetched_at) > max_age)
    }
}

/// Directory-backed response cache.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    max_age: Option<Duration>,
}

impl ResponseCache {
    /// Creates a cache rooted at `dir`. The directory is created on the
    /// first write.
    #[must_use]
    pub const fn new(dir: PathBuf, max_age: Option<Duration>) -> Self {
        Self { dir, max_age }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Returns the entry for `key`, or `None` on a miss.
    ///
    /// Stale entries (see `max_age`) and unreadable entries count as
    /// misses.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Cache`] if the file exists but cannot be read.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CensusError> {
        let path = self.path_for(key);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Ignoring corrupt cache entry {}: {e}", path.display());
                return Ok(None);
            }
        };

        if let Some(max_age) = self.max_age
            && entry.is_stale(max_age, Utc::now())
        {
            log::debug!("Cache entry for {key} is stale (fetched {})", entry.fetched_at);
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Stores `payload` under `key`, replacing any previous entry
    /// atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError`] if the directory, temporary file, or rename
    /// fails.
    pub fn put(
        &self,
        key: &CacheKey,
        payload: &serde_json::Value,
    ) -> Result<CacheEntry, CensusError> {
        std::fs::create_dir_all(&self.dir)?;

        let entry = CacheEntry {
            key: key.to_string(),
            fetched_at: Utc::now(),
            payload: payload.clone(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, &entry)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;

        Ok(entry)
    }

    /// Removes the entry for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Cache`] if the file cannot be removed.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool, CensusError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every entry. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::Cache`] if the directory cannot be listed or
    /// an entry cannot be removed.
    pub fn clear(&self) -> Result<usize, CensusError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        log::info!("Cleared {removed} cache entries from {}", self.dir.display());
        Ok(removed)
    }
}
