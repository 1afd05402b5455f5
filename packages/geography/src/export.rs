//! `GeoJSON` output for presentation layers.

use geojson::{Feature, FeatureCollection, Geometry, feature::Id};
use serde::Serialize;

use census_explorer_census_models::Geographic;

use crate::GeoError;
use crate::join::JoinResult;

/// Renders matched records as a `FeatureCollection`: one feature per
/// record, the record's fields as properties, and the unit name as
/// `geographyUnitName`. Non-finite values become `null`.
///
/// # Errors
///
/// Returns [`GeoError::Json`] if a record cannot be serialized, or
/// [`GeoError::Conversion`] if it does not serialize to an object.
pub fn to_feature_collection<T>(joined: &JoinResult<'_, T>) -> Result<FeatureCollection, GeoError>
where
    T: Serialize + Geographic,
{
    let features = joined
        .matched
        .iter()
        .map(|pair| {
            let serde_json::Value::Object(mut properties) = serde_json::to_value(pair.record)?
            else {
                return Err(GeoError::Conversion {
                    message: format!(
                        "Record for {} did not serialize to an object",
                        pair.record.geography_id()
                    ),
                });
            };
            properties.insert(
                "geographyUnitName".to_string(),
                serde_json::Value::String(pair.unit.name.clone()),
            );

            Ok(Feature {
                bbox: None,
                geometry: Some(Geometry::new(geojson::Value::from(&pair.unit.boundary))),
                id: Some(Id::String(pair.record.geography_id().to_string())),
                properties: Some(properties),
                foreign_members: None,
            })
        })
        .collect::<Result<Vec<_>, GeoError>>()?;

    Ok(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}
