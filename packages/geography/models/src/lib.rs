#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Boundary geometry of Census geographies.
//!
//! A [`GeographyUnit`] carries the same identifier as the estimates of its
//! area, so records and boundaries join on a plain string key.

use geo::{MultiPolygon, Polygon};

/// One geographic area with its boundary in WGS84 longitude/latitude.
#[derive(Debug, Clone, PartialEq)]
pub struct GeographyUnit {
    /// GEOID, e.g. `48453` for Travis County, Texas.
    pub id: String,
    pub name: String,
    /// Simple polygons are stored as one-member multipolygons.
    pub boundary: MultiPolygon<f64>,
}

impl GeographyUnit {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, boundary: MultiPolygon<f64>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            boundary,
        }
    }

    /// Wraps a single polygon.
    #[must_use]
    pub fn from_polygon(id: impl Into<String>, name: impl Into<String>, polygon: Polygon<f64>) -> Self {
        Self::new(id, name, MultiPolygon(vec![polygon]))
    }

    /// Number of member polygons (islands, exclaves).
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.boundary.0.len()
    }
}
