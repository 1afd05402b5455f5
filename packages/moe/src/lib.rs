#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Margin-of-error propagation for derived ACS estimates.
//!
//! Implements the approximation formulas from the Census Bureau's
//! *Understanding and Using American Community Survey Data* handbook
//! (chapter 8) for sums, proportions, ratios, and products of estimates.
//! All published ACS margins of error are at the 90% confidence level and
//! every function here assumes and preserves that level.
//!
//! [`derive`] lifts these scalar formulas to [`EstimateRecord`] joins.
//!
//! [`EstimateRecord`]: census_explorer_census_models::EstimateRecord

pub mod derive;

use thiserror::Error;

/// z-score of a two-sided 90% confidence interval.
pub const Z_90: f64 = 1.645;

/// Errors from margin-of-error arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoeError {
    /// The denominator estimate was zero.
    #[error("Division by zero: denominator estimate is 0")]
    DivisionByZero,

    /// More than one denominator record matched a numerator.
    #[error(
        "Ambiguous denominator for {geography_id} ({year}): both {first} and {second} match"
    )]
    AmbiguousDenominator {
        geography_id: String,
        year: u16,
        /// Variable codes of the first two conflicting records.
        first: String,
        second: String,
    },
}

/// Which formula produced a proportion MOE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoeFormula {
    /// The proportion formula (numerator is a subset of the denominator).
    Proportion,
    /// The proportion radicand was negative; the ratio formula was used.
    RatioFallback,
}

/// A propagated margin of error together with the formula that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropagatedMoe {
    pub moe: f64,
    pub formula: MoeFormula,
}

impl PropagatedMoe {
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.formula == MoeFormula::RatioFallback
    }
}

/// MOE of the proportion `numerator / denominator`, where the numerator
/// is a subset of the denominator.
///
/// ```text
/// p = numerator / denominator
/// moe = sqrt(numerator_moe² - p² · denominator_moe²) / denominator
/// ```
///
/// When the radicand is negative (highly correlated numerator and
/// denominator) the ratio formula `sqrt(numerator_moe² + p² ·
/// denominator_moe²) / denominator` is used and the result is tagged
/// [`MoeFormula::RatioFallback`].
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] if `denominator` is zero.
pub fn proportion_moe(
    numerator: f64,
    denominator: f64,
    numerator_moe: f64,
    denominator_moe: f64,
) -> Result<PropagatedMoe, MoeError> {
    if denominator == 0.0 {
        return Err(MoeError::DivisionByZero);
    }

    let p = numerator / denominator;
    let num_sq = numerator_moe.powi(2);
    let scaled_den_sq = p.powi(2) * denominator_moe.powi(2);
    let radicand = num_sq - scaled_den_sq;

    if radicand >= 0.0 {
        return Ok(PropagatedMoe {
            moe: radicand.sqrt() / denominator.abs(),
            formula: MoeFormula::Proportion,
        });
    }

    log::debug!(
        "proportion MOE radicand negative ({radicand}) for {numerator}/{denominator}, \
         using ratio formula"
    );

    Ok(PropagatedMoe {
        moe: (num_sq + scaled_den_sq).sqrt() / denominator.abs(),
        formula: MoeFormula::RatioFallback,
    })
}

/// MOE of the ratio `numerator / denominator` for estimates where the
/// numerator is not a subset of the denominator.
///
/// ```text
/// r = numerator / denominator
/// moe = sqrt(numerator_moe² + r² · denominator_moe²) / denominator
/// ```
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] if `denominator` is zero.
pub fn ratio_moe(
    numerator: f64,
    denominator: f64,
    numerator_moe: f64,
    denominator_moe: f64,
) -> Result<f64, MoeError> {
    if denominator == 0.0 {
        return Err(MoeError::DivisionByZero);
    }

    let r = numerator / denominator;
    Ok((numerator_moe.powi(2) + r.powi(2) * denominator_moe.powi(2)).sqrt() / denominator.abs())
}

/// MOE of a sum (or difference) of estimates: the root sum of squares.
///
/// The handbook recommends including the MOE of only the largest
/// zero-estimate term; callers aggregating many zero cells should filter
/// before calling.
#[must_use]
pub fn sum_moe(moes: &[f64]) -> f64 {
    moes.iter().map(|m| m.powi(2)).sum::<f64>().sqrt()
}

/// MOE of the product `a · b`.
///
/// ```text
/// moe = sqrt(a² · b_moe² + b² · a_moe²)
/// ```
#[must_use]
pub fn product_moe(a: f64, b: f64, a_moe: f64, b_moe: f64) -> f64 {
    (a.powi(2) * b_moe.powi(2) + b.powi(2) * a_moe.powi(2)).sqrt()
}

/// Coefficient of variation (standard error / estimate) as a percentage.
///
/// Commonly used to flag unreliable estimates (above 30% is a frequent
/// cut-off).
///
/// # Errors
///
/// Returns [`MoeError::DivisionByZero`] if `estimate` is zero.
pub fn coefficient_of_variation(estimate: f64, moe: f64) -> Result<f64, MoeError> {
    if estimate == 0.0 {
        return Err(MoeError::DivisionByZero);
    }
    Ok((moe / Z_90) / estimate.abs() * 100.0)
}
