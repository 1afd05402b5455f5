//! Record-level derivations.
//!
//! Joins numerator and denominator [`EstimateRecord`]s by
//! `(geography_id, year)` and produces new [`DerivedStatistic`] records.
//! Fetched records are never modified.

use std::collections::BTreeMap;

use census_explorer_census_models::{
    DerivedKind, DerivedStatistic, DerivedStatus, EstimateRecord,
};

use crate::{MoeError, proportion_moe, ratio_moe};

/// What to do when a denominator estimate is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroDenominator {
    /// Fail the whole derivation with [`MoeError::DivisionByZero`].
    #[default]
    Fail,
    /// Emit a `NaN` statistic flagged [`DerivedStatus::Invalid`].
    NotANumber,
}

/// Derives one statistic from raw estimate/MOE pairs.
///
/// Non-finite inputs (annotated or missing upstream values) produce an
/// [`DerivedStatus::Invalid`] statistic instead of an error.
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] if the denominator is zero and
/// `policy` is [`ZeroDenominator::Fail`].
pub fn derive_statistic(
    kind: DerivedKind,
    geography_id: &str,
    year: u16,
    numerator: (f64, f64),
    denominator: (f64, f64),
    policy: ZeroDenominator,
) -> Result<DerivedStatistic, MoeError> {
    let invalid = || DerivedStatistic {
        geography_id: geography_id.to_string(),
        year,
        value: f64::NAN,
        margin_of_error: f64::NAN,
        kind,
        status: DerivedStatus::Invalid,
    };

    let (num, num_moe) = numerator;
    let (den, den_moe) = denominator;

    if ![num, num_moe, den, den_moe].iter().all(|v| v.is_finite()) {
        return Ok(invalid());
    }

    let result = match kind {
        DerivedKind::Proportion => proportion_moe(num, den, num_moe, den_moe).map(|p| {
            let status = if p.used_fallback() {
                DerivedStatus::Fallback
            } else {
                DerivedStatus::Direct
            };
            (p.moe, status)
        }),
        DerivedKind::Ratio => {
            ratio_moe(num, den, num_moe, den_moe).map(|moe| (moe, DerivedStatus::Direct))
        }
    };

    match result {
        Ok((margin_of_error, status)) => Ok(DerivedStatistic {
            geography_id: geography_id.to_string(),
            year,
            value: num / den,
            margin_of_error,
            kind,
            status,
        }),
        Err(MoeError::DivisionByZero) if policy == ZeroDenominator::NotANumber => {
            log::debug!("{kind} for {geography_id} ({year}): zero denominator, emitting NaN");
            Ok(invalid())
        }
        Err(e) => Err(e),
    }
}

/// Derives proportions `numerator / denominator` for every numerator
/// record, matching denominators by `(geography_id, year)`.
///
/// A numerator without a matching denominator yields an
/// [`DerivedStatus::Invalid`] statistic so that the output has one entry
/// per numerator. `denominators` must hold at most one record per
/// `(geography_id, year)`.
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] under [`ZeroDenominator::Fail`],
/// and [`MoeError::AmbiguousDenominator`] if two denominator records share
/// a geography and year.
pub fn derive_proportions(
    numerators: &[EstimateRecord],
    denominators: &[EstimateRecord],
    policy: ZeroDenominator,
) -> Result<Vec<DerivedStatistic>, MoeError> {
    derive_joined(DerivedKind::Proportion, numerators, denominators, policy)
}

/// Derives ratios `numerator / denominator` for every numerator record.
///
/// Same join rules as [`derive_proportions`].
///
/// # Errors
///
/// Same as [`derive_proportions`].
pub fn derive_ratios(
    numerators: &[EstimateRecord],
    denominators: &[EstimateRecord],
    policy: ZeroDenominator,
) -> Result<Vec<DerivedStatistic>, MoeError> {
    derive_joined(DerivedKind::Ratio, numerators, denominators, policy)
}

/// Derives proportions against the summary value each record was
/// annotated with at fetch time.
///
/// Records fetched without a summary variable yield
/// [`DerivedStatus::Invalid`] statistics.
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] under [`ZeroDenominator::Fail`].
pub fn proportions_from_summary(
    records: &[EstimateRecord],
    policy: ZeroDenominator,
) -> Result<Vec<DerivedStatistic>, MoeError> {
    records
        .iter()
        .map(|record| {
            let denominator = record
                .summary
                .as_ref()
                .map_or((f64::NAN, f64::NAN), |s| (s.estimate, s.margin_of_error));
            derive_statistic(
                DerivedKind::Proportion,
                &record.geography_id,
                record.year,
                (record.estimate, record.margin_of_error),
                denominator,
                policy,
            )
        })
        .collect()
}

fn derive_joined(
    kind: DerivedKind,
    numerators: &[EstimateRecord],
    denominators: &[EstimateRecord],
    policy: ZeroDenominator,
) -> Result<Vec<DerivedStatistic>, MoeError> {
    let mut by_geography: BTreeMap<(&str, u16), &EstimateRecord> = BTreeMap::new();
    for record in denominators {
        let key = (record.geography_id.as_str(), record.year);
        if let Some(previous) = by_geography.insert(key, record) {
            return Err(MoeError::AmbiguousDenominator {
                geography_id: record.geography_id.clone(),
                year: record.year,
                first: previous.variable_code.clone(),
                second: record.variable_code.clone(),
            });
        }
    }

    numerators
        .iter()
        .map(|record| {
            let denominator = by_geography
                .get(&(record.geography_id.as_str(), record.year))
                .map_or((f64::NAN, f64::NAN), |d| (d.estimate, d.margin_of_error));
            derive_statistic(
                kind,
                &record.geography_id,
                record.year,
                (record.estimate, record.margin_of_error),
                denominator,
                policy,
            )
        })
        .collect()
}
