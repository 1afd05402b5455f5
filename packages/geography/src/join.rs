//! Pairing records with boundaries by geography id.

use std::collections::BTreeMap;

use census_explorer_census_models::Geographic;
use census_explorer_geography_models::GeographyUnit;

/// A record and the boundary of its geography.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined<'a, T> {
    pub record: &'a T,
    pub unit: &'a GeographyUnit,
}

/// Outcome of [`join_geometry`].
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResult<'a, T> {
    /// Records with a boundary, in input order.
    pub matched: Vec<Joined<'a, T>>,
    /// Records whose geography id has no boundary.
    pub unmatched: Vec<&'a T>,
}

impl<T> JoinResult<'_, T> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unmatched.is_empty()
    }
}

/// Pairs each record with the unit of the same geography id.
///
/// Records without a unit are reported in [`JoinResult::unmatched`] rather
/// than dropped. If `units` repeats an id, the first unit wins.
#[must_use]
pub fn join_geometry<'a, T: Geographic>(
    records: &'a [T],
    units: &'a [GeographyUnit],
) -> JoinResult<'a, T> {
    let mut by_id: BTreeMap<&str, &GeographyUnit> = BTreeMap::new();
    for unit in units {
        if by_id.contains_key(unit.id.as_str()) {
            log::warn!("Duplicate boundary for geography {}, keeping the first", unit.id);
        } else {
            by_id.insert(unit.id.as_str(), unit);
        }
    }

    let mut matched = Vec::with_capacity(records.len());
    let mut unmatched = Vec::new();
    for record in records {
        match by_id.get(record.geography_id()) {
            Some(unit) => matched.push(Joined { record, unit }),
            None => unmatched.push(record),
        }
    }

    if !unmatched.is_empty() {
        log::warn!(
            "{} of {} records have no boundary",
            unmatched.len(),
            records.len()
        );
    }

    JoinResult { matched, unmatched }
}
