#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Boundary geometry for Census geographies.
//!
//! [`GeometryProvider`] is the contract for anything that can supply
//! boundaries for a geography level; [`tigerweb::TigerWebProvider`]
//! implements it against the Census Bureau `TIGERweb` REST service.
//! [`join::join_geometry`] pairs estimates with boundaries by geography id
//! and [`export::to_feature_collection`] renders the result as `GeoJSON`
//! for a presentation layer.

pub mod export;
pub mod join;
pub mod tigerweb;

use async_trait::async_trait;
use census_explorer_census::CensusError;
use census_explorer_census_models::{GeographyFilter, GeographyLevel};
use census_explorer_geography_models::GeographyUnit;
use thiserror::Error;

pub use export::to_feature_collection;
pub use join::{JoinResult, Joined, join_geometry};
pub use tigerweb::TigerWebProvider;

/// Errors that can occur during geometry operations.
#[derive(Debug, Error)]
pub enum GeoError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A feature could not be converted into a boundary.
    #[error("Conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// The provider kept failing after all retries.
    #[error("Geometry service unavailable: {message}")]
    Unavailable {
        /// Description of the last failure.
        message: String,
    },

    /// The provider has no boundaries for this level.
    #[error("Geometry for '{level}' is not supported by this provider")]
    Unsupported {
        /// The requested level.
        level: GeographyLevel,
    },

    /// The geography filter was rejected.
    #[error(transparent)]
    Census(#[from] CensusError),
}

/// Supplies boundaries for the units of a geography level.
///
/// Every unit must be in WGS84 longitude/latitude and carry the same id
/// as the Census API uses for the area.
#[async_trait]
pub trait GeometryProvider: Send + Sync {
    /// Fetches the boundaries of every unit of `level` inside `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::Unsupported`] for levels the provider does not
    /// serve, [`GeoError::Census`] for an invalid filter, and transport or
    /// conversion errors otherwise.
    async fn fetch_geometry(
        &self,
        level: GeographyLevel,
        filter: &GeographyFilter,
    ) -> Result<Vec<GeographyUnit>, GeoError>;
}
