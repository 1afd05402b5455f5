//! Request construction: variable code normalization, geography clauses,
//! and splitting variable lists into upstream-sized requests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use census_explorer_census_models::{GeographyFilter, GeographyLevel, TableKind, fips};
use regex::Regex;

use crate::CensusError;

/// Upstream cap on the number of fields in one `get` parameter.
pub const MAX_GET_FIELDS: usize = 50;

/// Variables per request. Each variable costs two fields (estimate and
/// margin) and `NAME` takes one.
pub const VARIABLES_PER_REQUEST: usize = (MAX_GET_FIELDS - 1) / 2;

/// A base variable code with an optional `E` estimate suffix, e.g.
/// `B01001_001E`, `S1701_C03_001`, `DP02_0068PE`.
static ESTIMATE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z0-9]*(?:_[A-Z0-9]+)*_\d+P?)E?$").expect("valid regex")
});

/// A column that carries an estimate: base code followed by `E`.
static ESTIMATE_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z0-9]*(?:_[A-Z0-9]+)*_\d+P?)E$").expect("valid regex")
});

/// Returns the base code of a variable, accepting it with or without the
/// `E` suffix and in any case.
///
/// # Errors
///
/// Returns [`CensusError::BadRequest`] if `code` is not an estimate code.
pub fn normalize_variable(code: &str) -> Result<String, CensusError> {
    let upper = code.trim().to_ascii_uppercase();
    ESTIMATE_CODE_RE
        .captures(&upper)
        .and_then(|caps| caps.get(1))
        .map(|base| base.as_str().to_string())
        .ok_or_else(|| CensusError::BadRequest {
            message: format!("'{code}' is not an ACS estimate variable code"),
        })
}

/// Returns the base code if `column` is an estimate column (`...E`).
#[must_use]
pub fn estimate_column_base(column: &str) -> Option<&str> {
    ESTIMATE_COLUMN_RE
        .captures(column)
        .and_then(|caps| caps.get(1))
        .map(|base| base.as_str())
}

/// Name of the estimate column of a base code.
#[must_use]
pub fn estimate_column(code: &str) -> String {
    format!("{code}E")
}

/// Name of the margin-of-error column of a base code.
#[must_use]
pub fn moe_column(code: &str) -> String {
    format!("{code}M")
}

/// The `for`/`in` part of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeographyClause {
    /// Requested level and its selector (`*` or a single code).
    pub level: GeographyLevel,
    pub selector: String,
    /// Parent levels, outermost first.
    pub parents: Vec<(GeographyLevel, String)>,
}

impl GeographyClause {
    /// Query parameters for this clause, one `in` per parent level.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("for".to_string(), format!("{}:{}", self.level, self.selector))];
        for (level, code) in &self.parents {
            params.push(("in".to_string(), format!("{level}:{code}")));
        }
        params
    }

    /// Response columns that identify a row, in GEOID order.
    ///
    /// The upstream returns every enclosing level of a row, not only the
    /// ones named in `in`, so these follow the level's hierarchy rather
    /// than [`Self::parents`].
    #[must_use]
    pub fn id_columns(&self) -> Vec<String> {
        self.level
            .id_levels()
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

/// Validates `filter` against `level` and builds the geography clause.
///
/// A filter at the requested level itself selects a single unit
/// (`for=state:48`); otherwise the level is wildcarded inside its parents.
///
/// # Errors
///
/// Returns [`CensusError::BadRequest`] for combinations the upstream
/// rejects: a county without a state, a tract or block group without a
/// state, a block group without a county, a filter the level cannot be
/// nested in, or an unknown state or county code.
pub fn geography_clause(
    level: GeographyLevel,
    filter: &GeographyFilter,
) -> Result<GeographyClause, CensusError> {
    let bad = |message: String| Err(CensusError::BadRequest { message });

    if filter.county.is_some() && filter.state.is_none() {
        return bad("A county filter requires a state filter".to_string());
    }
    if level.requires_state() && filter.state.is_none() {
        return bad(format!("Geography '{level}' requires a state filter"));
    }
    if level.requires_county() && filter.county.is_none() {
        return bad(format!("Geography '{level}' requires a county filter"));
    }
    if filter.state.is_some() && !level.accepts_state() {
        return bad(format!("Geography '{level}' cannot be filtered by state"));
    }
    if filter.county.is_some() && !level.accepts_county() {
        return bad(format!("Geography '{level}' cannot be filtered by county"));
    }

    let state = match &filter.state {
        Some(input) => match fips::resolve_state(input) {
            Some(code) => Some(code.to_string()),
            None => return bad(format!("Unknown state '{input}'")),
        },
        None => None,
    };
    let county = match &filter.county {
        Some(input) => match fips::normalize_county(input) {
            Some(code) => Some(code),
            None => return bad(format!("Invalid county FIPS code '{input}'")),
        },
        None => None,
    };

    let mut parents = Vec::new();
    let selector = match level {
        GeographyLevel::State => state.unwrap_or_else(|| "*".to_string()),
        GeographyLevel::County => {
            if let Some(state) = state {
                parents.push((GeographyLevel::State, state));
            }
            county.unwrap_or_else(|| "*".to_string())
        }
        _ => {
            if let Some(state) = state {
                parents.push((GeographyLevel::State, state));
            }
            if let Some(county) = county {
                parents.push((GeographyLevel::County, county));
            }
            "*".to_string()
        }
    };

    Ok(GeographyClause {
        level,
        selector,
        parents,
    })
}

/// Groups base codes by the endpoint that serves them and splits each
/// group into chunks of at most [`VARIABLES_PER_REQUEST`]. Duplicates are
/// dropped; order within a group follows the input.
#[must_use]
pub fn plan_requests(codes: &[String]) -> Vec<(TableKind, Vec<String>)> {
    let mut seen = BTreeSet::new();
    let mut groups: BTreeMap<TableKind, Vec<String>> = BTreeMap::new();

    for code in codes {
        if seen.insert(code.as_str()) {
            groups
                .entry(TableKind::from_code(code))
                .or_default()
                .push(code.clone());
        }
    }

    groups
        .into_iter()
        .flat_map(|(kind, codes)| {
            codes
                .chunks(VARIABLES_PER_REQUEST)
                .map(|chunk| (kind, chunk.to_vec()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Builds the `get` parameter: `NAME` followed by the estimate and margin
/// columns of each code.
#[must_use]
pub fn get_fields(codes: &[String]) -> String {
    std::iter::once("NAME".to_string())
        .chain(
            codes
                .iter()
                .flat_map(|code| [estimate_column(code), moe_column(code)]),
        )
        .collect::<Vec<_>>()
        .join(",")
}
