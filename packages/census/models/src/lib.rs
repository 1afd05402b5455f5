#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Census data API types.
//!
//! Records produced by the Census API client and consumed by the
//! margin-of-error library and the geometry join. Every record is an
//! immutable snapshot: derived values are new records, never edits of
//! fetched ones.

pub mod fips;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// An American Community Survey data product.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Survey {
    /// 1-year estimates (areas with 65,000+ population).
    Acs1,
    /// 3-year estimates (discontinued after the 2011-2013 release).
    Acs3,
    /// 5-year rolling estimates.
    Acs5,
}

impl Survey {
    /// Returns `true` if the Census Bureau published this survey for
    /// `year` (the last year of the estimate period).
    ///
    /// The 2020 ACS 1-year release was replaced by experimental estimates
    /// that are not served from the standard endpoint.
    #[must_use]
    pub const fn is_published(self, year: u16) -> bool {
        match self {
            Self::Acs1 => year >= 2005 && year != 2020,
            Self::Acs3 => year >= 2007 && year <= 2013,
            Self::Acs5 => year >= 2009,
        }
    }
}

/// The family of ACS tables a variable belongs to. Each family is served
/// from its own endpoint below the survey path.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TableKind {
    /// Detailed tables (`B`/`C` prefixes).
    #[default]
    Detailed,
    /// Subject tables (`S` prefix).
    Subject,
    /// Data profiles (`DP` prefix).
    Profile,
    /// Comparison profiles (`CP` prefix).
    Cprofile,
}

impl TableKind {
    /// Infers the table family from a variable or table code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        let upper = code.trim().to_ascii_uppercase();
        if upper.starts_with("DP") {
            Self::Profile
        } else if upper.starts_with("CP") {
            Self::Cprofile
        } else if upper.starts_with('S') {
            Self::Subject
        } else {
            Self::Detailed
        }
    }

    /// Path segment appended after `acs/{survey}`, if any.
    #[must_use]
    pub const fn path_suffix(self) -> Option<&'static str> {
        match self {
            Self::Detailed => None,
            Self::Subject => Some("subject"),
            Self::Profile => Some("profile"),
            Self::Cprofile => Some("cprofile"),
        }
    }
}

/// Spatial aggregation unit of a query.
///
/// The `Display`/`EnumString` form is the upstream wire name used in the
/// `for` and `in` parameters.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum GeographyLevel {
    #[strum(serialize = "us")]
    Us,
    #[strum(serialize = "region")]
    Region,
    #[strum(serialize = "division")]
    Division,
    #[strum(serialize = "state")]
    State,
    #[strum(serialize = "county")]
    County,
    #[strum(to_string = "county subdivision", serialize = "county-subdivision")]
    CountySubdivision,
    #[strum(serialize = "tract")]
    Tract,
    #[strum(to_string = "block group", serialize = "block-group")]
    BlockGroup,
    #[strum(serialize = "place")]
    Place,
    #[strum(to_string = "zip code tabulation area", serialize = "zcta")]
    Zcta,
    #[strum(
        to_string = "congressional district",
        serialize = "congressional-district"
    )]
    CongressionalDistrict,
    #[strum(
        to_string = "metropolitan statistical area/micropolitan statistical area",
        serialize = "cbsa"
    )]
    MetropolitanArea,
}

impl GeographyLevel {
    /// Whether a `state` filter may narrow this level.
    #[must_use]
    pub const fn accepts_state(self) -> bool {
        matches!(
            self,
            Self::State
                | Self::County
                | Self::CountySubdivision
                | Self::Tract
                | Self::BlockGroup
                | Self::Place
                | Self::CongressionalDistrict
        )
    }

    /// Whether a `county` filter may narrow this level.
    #[must_use]
    pub const fn accepts_county(self) -> bool {
        matches!(
            self,
            Self::County | Self::CountySubdivision | Self::Tract | Self::BlockGroup
        )
    }

    /// Whether the upstream rejects this level without a `state` filter.
    #[must_use]
    pub const fn requires_state(self) -> bool {
        matches!(
            self,
            Self::CountySubdivision | Self::Tract | Self::BlockGroup
        )
    }

    /// Whether the upstream rejects this level without a `county` filter.
    #[must_use]
    pub const fn requires_county(self) -> bool {
        matches!(self, Self::BlockGroup)
    }

    /// Levels whose codes the upstream returns for each row of this level,
    /// outermost first. Concatenating them gives the GEOID that TIGERweb
    /// uses, whether or not the request filtered on the parents.
    #[must_use]
    pub const fn id_levels(self) -> &'static [Self] {
        match self {
            Self::County => &[Self::State, Self::County],
            Self::CountySubdivision => &[Self::State, Self::County, Self::CountySubdivision],
            Self::Tract => &[Self::State, Self::County, Self::Tract],
            Self::BlockGroup => &[Self::State, Self::County, Self::Tract, Self::BlockGroup],
            Self::Place => &[Self::State, Self::Place],
            Self::CongressionalDistrict => &[Self::State, Self::CongressionalDistrict],
            Self::Us => &[Self::Us],
            Self::Region => &[Self::Region],
            Self::Division => &[Self::Division],
            Self::State => &[Self::State],
            Self::Zcta => &[Self::Zcta],
            Self::MetropolitanArea => &[Self::MetropolitanArea],
        }
    }
}

/// Filters narrowing a query to a dataset vintage and a parent geography.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeographyFilter {
    /// State FIPS code, abbreviation, or name.
    pub state: Option<String>,
    /// Three-digit county FIPS code. Only meaningful with `state`.
    pub county: Option<String>,
    /// Last year of the estimate period.
    pub year: u16,
    /// Data product.
    pub survey: Survey,
}

impl GeographyFilter {
    /// Creates a filter covering the whole country.
    #[must_use]
    pub const fn new(year: u16, survey: Survey) -> Self {
        Self {
            state: None,
            county: None,
            year,
            survey,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    #[must_use]
    pub fn with_county(mut self, county: impl Into<String>) -> Self {
        self.county = Some(county.into());
        self
    }

    /// Returns a copy of this filter for another year.
    #[must_use]
    pub fn for_year(&self, year: u16) -> Self {
        Self {
            year,
            ..self.clone()
        }
    }
}

/// A variable published in a dataset vintage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    /// Base variable code without the estimate suffix (e.g. `B15003_022`).
    pub code: String,
    /// Human label with `!!` hierarchy separators
    /// (e.g. `Estimate!!Total:!!Bachelor's degree`).
    pub label: String,
    /// Table concept (e.g. `EDUCATIONAL ATTAINMENT FOR THE POPULATION 25
    /// YEARS AND OVER`).
    pub concept: String,
    /// Table id the variable belongs to.
    pub group: Option<String>,
    /// Upstream value type (`int`, `float`, `string`).
    pub predicate_type: Option<String>,
    pub dataset_year: u16,
    pub survey: Survey,
}

impl VariableDescriptor {
    /// The identity of a descriptor: `(code, dataset_year, survey)`.
    #[must_use]
    pub fn key(&self) -> (&str, u16, Survey) {
        (&self.code, self.dataset_year, self.survey)
    }
}

/// All variables of one `(year, survey, table kind)` vintage, keyed by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableCatalog {
    pub dataset_year: u16,
    pub survey: Survey,
    pub table_kind: TableKind,
    pub variables: BTreeMap<String, VariableDescriptor>,
}

impl VariableCatalog {
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&VariableDescriptor> {
        self.variables.get(code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableDescriptor> {
        self.variables.values()
    }

    /// Returns variables whose code, label, or concept contains `term`
    /// (case-insensitive), in code order.
    #[must_use]
    pub fn search(&self, term: &str) -> Vec<&VariableDescriptor> {
        let needle = term.to_lowercase();
        self.variables
            .values()
            .filter(|v| {
                v.code.to_lowercase().contains(&needle)
                    || v.label.to_lowercase().contains(&needle)
                    || v.concept.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Returns the distinct concepts in the catalog, sorted.
    #[must_use]
    pub fn concepts(&self) -> Vec<&str> {
        let mut concepts: Vec<&str> = self
            .variables
            .values()
            .map(|v| v.concept.as_str())
            .filter(|c| !c.is_empty())
            .collect();
        concepts.sort_unstable();
        concepts.dedup();
        concepts
    }
}

/// The summary (denominator) value attached to an estimate when a
/// summary variable was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryValue {
    pub variable_code: String,
    pub estimate: f64,
    pub margin_of_error: f64,
}

/// One published estimate for a geography, variable, and year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRecord {
    /// Concatenated FIPS identifier (GEOID), e.g. `48453` for a county.
    pub geography_id: String,
    /// Upstream `NAME` (e.g. "Travis County, Texas").
    pub geography_name: String,
    /// Base variable code.
    pub variable_code: String,
    /// `NaN` when the upstream published an annotation instead of a value.
    pub estimate: f64,
    /// 90% margin of error. `0.0` for controlled estimates, `NaN` when
    /// unavailable.
    pub margin_of_error: f64,
    pub year: u16,
    pub survey: Survey,
    pub summary: Option<SummaryValue>,
}

/// What a [`DerivedStatistic`] measures.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum DerivedKind {
    /// A part divided by a whole that contains it.
    Proportion,
    /// Any estimate divided by another.
    Ratio,
}

/// How trustworthy a derived margin of error is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum DerivedStatus {
    /// Computed with the formula for its kind.
    Direct,
    /// The proportion radicand was negative and the ratio formula was used
    /// instead. The MOE is conservative (larger than the true MOE).
    Fallback,
    /// Value and MOE are undefined (`NaN`): inputs were missing or the
    /// denominator was zero.
    Invalid,
}

/// A statistic computed from two estimates, with its propagated MOE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedStatistic {
    pub geography_id: String,
    pub year: u16,
    pub value: f64,
    pub margin_of_error: f64,
    pub kind: DerivedKind,
    pub status: DerivedStatus,
}

impl DerivedStatistic {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status != DerivedStatus::Invalid
    }
}

/// Anything keyed by a geography identifier, and therefore joinable to
/// boundary geometry.
pub trait Geographic {
    fn geography_id(&self) -> &str;
}

impl Geographic for EstimateRecord {
    fn geography_id(&self) -> &str {
        &self.geography_id
    }
}

impl Geographic for DerivedStatistic {
    fn geography_id(&self) -> &str {
        &self.geography_id
    }
}
