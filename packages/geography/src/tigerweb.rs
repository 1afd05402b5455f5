//! Boundary retrieval from the Census Bureau `TIGERweb` REST API.
//!
//! Each ACS vintage has its own `tigerWMS_ACS{year}` map service. Layers
//! are queried as `GeoJSON` in WGS84 (`outSR=4326`), page by page with
//! `resultOffset` + `resultRecordCount`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use census_explorer_census::config::MAX_RETRIES_LIMIT;
use census_explorer_census::query::{GeographyClause, geography_clause};
use census_explorer_census::retry::backoff_delay;
use census_explorer_census_models::{GeographyFilter, GeographyLevel};
use census_explorer_geography_models::GeographyUnit;
use geo::MultiPolygon;
use reqwest::StatusCode;
use serde_json::Value;

use crate::{GeoError, GeometryProvider};

const TIGERWEB_BASE_URL: &str = "https://tigerweb.geo.census.gov/arcgis/rest/services/TIGERweb";

/// Page size for `TIGERweb` paginated requests. Kept low to avoid WAF
/// blocks on large geospatial responses.
const TIGERWEB_PAGE_SIZE: u32 = 100;

/// Retries per page after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 4;

/// Pause between successive pages.
const PAGE_DELAY: Duration = Duration::from_millis(100);

/// Browser-like User-Agent to avoid WAF blocks on `TIGERweb`.
const TIGERWEB_USER_AGENT: &str = "Mozilla/5.0 (compatible; census_explorer/0.1)";

const INCORPORATED_PLACES_LAYER: u32 = 28;
const CENSUS_DESIGNATED_PLACES_LAYER: u32 = 30;

/// [`GeometryProvider`] backed by `TIGERweb`.
#[derive(Debug, Clone)]
pub struct TigerWebProvider {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    max_retries: u32,
}

impl TigerWebProvider {
    /// Creates a provider for the public `TIGERweb` service.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, GeoError> {
        let client = reqwest::Client::builder()
            .user_agent(TIGERWEB_USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: TIGERWEB_BASE_URL.to_string(),
            page_size: TIGERWEB_PAGE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Points the provider at another `ArcGIS` services root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Retries per page, capped like the Census client's.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.min(MAX_RETRIES_LIMIT);
        self
    }

    /// Map service layers holding the boundaries of `level`. Places span
    /// two layers: incorporated places and census designated places.
    #[must_use]
    pub const fn layer_ids(level: GeographyLevel) -> &'static [u32] {
        match level {
            GeographyLevel::State => &[80],
            GeographyLevel::County => &[82],
            GeographyLevel::Tract => &[8],
            GeographyLevel::BlockGroup => &[10],
            GeographyLevel::Place => &[INCORPORATED_PLACES_LAYER, CENSUS_DESIGNATED_PLACES_LAYER],
            _ => &[],
        }
    }

    /// Query endpoint of a layer in a vintage's map service.
    #[must_use]
    pub fn query_url(&self, year: u16, layer: u32) -> String {
        format!(
            "{}/tigerWMS_ACS{year}/MapServer/{layer}/query",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Query parameters for one page of a layer.
    fn page_params(&self, where_filter: &str, offset: u32) -> Vec<(String, String)> {
        [
            ("where", where_filter.to_string()),
            ("outFields", "GEOID,NAME".to_string()),
            ("outSR", "4326".to_string()),
            ("f", "geojson".to_string()),
            ("returnGeometry", "true".to_string()),
            ("resultRecordCount", self.page_size.to_string()),
            ("resultOffset", offset.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Fetches one page, retrying transient failures with the Census
    /// client's backoff.
    async fn fetch_page(
        &self,
        url: &str,
        params: &[(String, String)],
        label: &str,
        offset: u32,
    ) -> Result<Value, GeoError> {
        let mut last_failure = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                log::warn!(
                    "{label} (offset={offset}): retry {attempt}/{} in {delay:?}...",
                    self.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = match self.client.get(url).query(params).send().await {
                Err(e) => PageOutcome::Retry(format!("HTTP request error: {e}")),
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(body) => classify_page(status, &body),
                        Err(e) => {
                            PageOutcome::Retry(format!("failed to read response body: {e}"))
                        }
                    }
                }
            };

            match outcome {
                PageOutcome::Page(page) => return Ok(page),
                PageOutcome::Fail(message) => {
                    return Err(GeoError::Unavailable {
                        message: format!("{label} (offset={offset}): {message}"),
                    });
                }
                PageOutcome::Retry(reason) => {
                    log::warn!("{label} (offset={offset}, attempt {attempt}): {reason}");
                    last_failure = reason;
                }
            }
        }

        Err(GeoError::Unavailable {
            message: format!(
                "{label} (offset={offset}): {last_failure} (after {} retries)",
                self.max_retries
            ),
        })
    }

    /// Fetches every page of one layer and converts its features.
    async fn fetch_layer(
        &self,
        year: u16,
        layer: u32,
        where_filter: &str,
        label: &str,
    ) -> Result<Vec<GeographyUnit>, GeoError> {
        let url = self.query_url(year, layer);
        let label = format!("{label}, layer {layer}");
        log::info!("Fetching {label} from TIGERweb...");

        let features = paginate(&label, |offset| {
            let params = self.page_params(where_filter, offset);
            let url = &url;
            let label = &label;
            async move {
                if offset > 0 {
                    tokio::time::sleep(PAGE_DELAY).await;
                }
                self.fetch_page(url, &params, label, offset).await
            }
        })
        .await?;

        let units = features
            .iter()
            .map(feature_to_unit)
            .filter_map(Result::transpose)
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("{label}: {} units", units.len());
        Ok(units)
    }
}

#[async_trait]
impl GeometryProvider for TigerWebProvider {
    async fn fetch_geometry(
        &self,
        level: GeographyLevel,
        filter: &GeographyFilter,
    ) -> Result<Vec<GeographyUnit>, GeoError> {
        let layers = Self::layer_ids(level);
        if layers.is_empty() {
            return Err(GeoError::Unsupported { level });
        }
        let clause = geography_clause(level, filter)?;
        let where_filter = where_clause(&clause);
        let label = format!("{level} boundaries {}", filter.year);

        let units = collect_layers(layers, |layer| {
            self.fetch_layer(filter.year, layer, &where_filter, &label)
        })
        .await?;

        log::info!("{label}: {} units", units.len());
        Ok(units)
    }
}

/// Result of one page request.
#[derive(Debug)]
enum PageOutcome {
    Page(Value),
    Retry(String),
    Fail(String),
}

/// Maps a completed response onto a page, a transient failure, or a
/// permanent one. `ArcGIS` reports some failures inside an HTTP 200 as
/// `{"error": {"code": ..., "message": ...}}`.
fn classify_page(status: StatusCode, body: &str) -> PageOutcome {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return PageOutcome::Retry(format!("HTTP {status}: {}", truncate_for_log(body, 500)));
    }
    if !status.is_success() {
        return PageOutcome::Fail(format!("HTTP {status}: {}", truncate_for_log(body, 500)));
    }

    let page: Value = match serde_json::from_str(body) {
        Ok(page) => page,
        Err(e) => {
            return PageOutcome::Retry(format!(
                "JSON parse error: {e}. Response body: {}",
                truncate_for_log(body, 500)
            ));
        }
    };

    let Some(error) = page.get("error") else {
        return PageOutcome::Page(page);
    };
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let reason = format!("ArcGIS error {code}: {message}");
    if matches!(code, 400 | 404) {
        PageOutcome::Fail(reason)
    } else {
        PageOutcome::Retry(reason)
    }
}

/// Fetches each layer in turn and merges the units ordered by id. An id
/// served by more than one layer keeps the boundary of the earlier layer.
///
/// # Errors
///
/// Returns the first layer error.
pub async fn collect_layers<F, Fut>(
    layers: &[u32],
    mut fetch_layer: F,
) -> Result<Vec<GeographyUnit>, GeoError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<GeographyUnit>, GeoError>>,
{
    let mut units = Vec::new();
    for &layer in layers {
        units.extend(fetch_layer(layer).await?);
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));
    units.dedup_by(|later, earlier| {
        let duplicate = later.id == earlier.id;
        if duplicate {
            log::warn!("Boundary {} appears in more than one layer", later.id);
        }
        duplicate
    });
    Ok(units)
}

/// `ArcGIS` `where` expression selecting the units inside a clause.
#[must_use]
pub fn where_clause(clause: &GeographyClause) -> String {
    let mut conditions: Vec<String> = clause
        .parents
        .iter()
        .filter_map(|(level, code)| field_condition(*level, code))
        .collect();
    if clause.selector != "*"
        && let Some(condition) = field_condition(clause.level, &clause.selector)
    {
        conditions.push(condition);
    }

    if conditions.is_empty() {
        "1=1".to_string()
    } else {
        conditions.join(" AND ")
    }
}

fn field_condition(level: GeographyLevel, code: &str) -> Option<String> {
    match level {
        GeographyLevel::State => Some(format!("STATE='{code}'")),
        GeographyLevel::County => Some(format!("COUNTY='{code}'")),
        _ => None,
    }
}

/// Collects features page by page, starting at offset zero, for as long
/// as the service reports `exceededTransferLimit`.
///
/// # Errors
///
/// Returns the first page error, or [`GeoError::Conversion`] for a page
/// without a `features` array.
pub async fn paginate<F, Fut>(label: &str, mut fetch_page: F) -> Result<Vec<Value>, GeoError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Value, GeoError>>,
{
    let mut features = Vec::new();
    let mut next = Some(0);

    while let Some(offset) = next {
        let (page, following) = split_page(fetch_page(offset).await?, offset, label)?;
        features.extend(page);
        if following.is_some() {
            log::debug!("{label}: {} features so far", features.len());
        }
        next = following;
    }

    Ok(features)
}

/// Takes the features out of a page along with the offset of the page
/// after it, if the service has more.
fn split_page(
    mut page: Value,
    offset: u32,
    label: &str,
) -> Result<(Vec<Value>, Option<u32>), GeoError> {
    let more = page
        .get("exceededTransferLimit")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(Value::Array(features)) = page.get_mut("features").map(Value::take) else {
        return Err(GeoError::Conversion {
            message: format!("No features array in TIGERweb response for {label} (offset={offset})"),
        });
    };

    let next = if more && !features.is_empty() {
        u32::try_from(features.len())
            .ok()
            .and_then(|n| offset.checked_add(n))
    } else {
        None
    };
    Ok((features, next))
}

/// Converts one `GeoJSON` feature into a unit. Features without geometry
/// are skipped with a warning.
///
/// # Errors
///
/// Returns [`GeoError::Conversion`] if the feature has no `GEOID` or its
/// geometry is not polygonal.
pub fn feature_to_unit(feature: &Value) -> Result<Option<GeographyUnit>, GeoError> {
    let props = &feature["properties"];
    let id = props["GEOID"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GeoError::Conversion {
            message: "Feature without GEOID".to_string(),
        })?;
    let name = props["NAME"].as_str().unwrap_or_default();

    if feature["geometry"].is_null() {
        log::warn!("Skipping feature {id}: no geometry");
        return Ok(None);
    }

    let geometry: geojson::Geometry = serde_json::from_value(feature["geometry"].clone())?;
    let geo_geom: geo::Geometry<f64> = geometry.try_into().map_err(|e| GeoError::Conversion {
        message: format!("Invalid geometry for {id}: {e}"),
    })?;

    let boundary = match geo_geom {
        geo::Geometry::MultiPolygon(mp) => mp,
        geo::Geometry::Polygon(p) => MultiPolygon(vec![p]),
        _ => {
            return Err(GeoError::Conversion {
                message: format!("Feature {id} is not polygonal"),
            });
        }
    };

    Ok(Some(GeographyUnit::new(id, name, boundary)))
}

/// Truncates a string for logging, appending "..." if it exceeds `max_len`.
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use census_explorer_census::CensusError;
    use census_explorer_census_models::Survey;
    use serde_json::json;

    use super::*;

    fn square_feature(geoid: &str) -> Value {
        json!({
            "type": "Feature",
            "properties": {"GEOID": geoid, "NAME": format!("Tract {geoid}")},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[-97.8, 30.2], [-97.7, 30.2], [-97.7, 30.3], [-97.8, 30.3], [-97.8, 30.2]]]
            }
        })
    }

    #[test]
    fn layers_cover_supported_levels() {
        assert_eq!(TigerWebProvider::layer_ids(GeographyLevel::State), &[80]);
        assert_eq!(TigerWebProvider::layer_ids(GeographyLevel::County), &[82]);
        assert_eq!(TigerWebProvider::layer_ids(GeographyLevel::Tract), &[8]);
        assert_eq!(TigerWebProvider::layer_ids(GeographyLevel::BlockGroup), &[10]);
        assert_eq!(TigerWebProvider::layer_ids(GeographyLevel::Place), &[28, 30]);
        assert!(TigerWebProvider::layer_ids(GeographyLevel::Zcta).is_empty());
    }

    fn unit(geoid: &str, name: &str) -> GeographyUnit {
        let mut unit = feature_to_unit(&square_feature(geoid)).unwrap().unwrap();
        unit.name = name.to_string();
        unit
    }

    #[tokio::test]
    async fn places_merge_incorporated_and_designated_layers() {
        let requested = RefCell::new(Vec::new());

        let units = collect_layers(
            TigerWebProvider::layer_ids(GeographyLevel::Place),
            |layer| {
                requested.borrow_mut().push(layer);
                let page = match layer {
                    28 => vec![unit("4805000", "Austin city"), unit("4835000", "Houston city")],
                    _ => vec![
                        unit("4819624", "Cinco Ranch CDP"),
                        unit("4805000", "Austin duplicate"),
                    ],
                };
                async move { Ok(page) }
            },
        )
        .await
        .unwrap();

        assert_eq!(*requested.borrow(), vec![28, 30]);
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["4805000", "4819624", "4835000"]);
        assert_eq!(units[0].name, "Austin city");
    }

    #[tokio::test]
    async fn layer_failure_fails_the_merge() {
        let result = collect_layers(&[28, 30], |layer| async move {
            if layer == 30 {
                Err(GeoError::Unavailable {
                    message: "down".to_string(),
                })
            } else {
                Ok(vec![unit("4805000", "Austin city")])
            }
        })
        .await;
        assert!(matches!(result, Err(GeoError::Unavailable { .. })));
    }

    #[test]
    fn transient_statuses_are_retried() {
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY] {
            assert!(matches!(classify_page(status, "busy"), PageOutcome::Retry(_)));
        }
        assert!(matches!(
            classify_page(StatusCode::OK, r#"{"type":"FeatureCollection","feat"#),
            PageOutcome::Retry(_)
        ));
        assert!(matches!(
            classify_page(StatusCode::OK, r#"{"error":{"code":500,"message":"Error performing query"}}"#),
            PageOutcome::Retry(_)
        ));
    }

    #[test]
    fn rejected_queries_fail_without_retry() {
        assert!(matches!(
            classify_page(StatusCode::FORBIDDEN, "blocked"),
            PageOutcome::Fail(_)
        ));
        assert!(matches!(
            classify_page(StatusCode::OK, r#"{"error":{"code":400,"message":"Invalid query"}}"#),
            PageOutcome::Fail(_)
        ));
        assert!(matches!(
            classify_page(StatusCode::OK, r#"{"type":"FeatureCollection","features":[]}"#),
            PageOutcome::Page(_)
        ));
    }

    #[test]
    fn page_params_carry_offset_and_projection() {
        let provider = TigerWebProvider::new().unwrap();
        let params = provider.page_params("STATE='48'", 200);

        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("where"), Some("STATE='48'"));
        assert_eq!(get("outSR"), Some("4326"));
        assert_eq!(get("resultOffset"), Some("200"));
        assert_eq!(get("resultRecordCount"), Some("100"));
    }

    #[test]
    fn retries_are_capped() {
        let provider = TigerWebProvider::new().unwrap().with_max_retries(500);
        assert_eq!(provider.max_retries, MAX_RETRIES_LIMIT);
    }

    #[test]
    fn query_url_uses_vintage_service() {
        let provider = TigerWebProvider::new().unwrap();
        assert_eq!(
            provider.query_url(2022, 8),
            "https://tigerweb.geo.census.gov/arcgis/rest/services/TIGERweb/tigerWMS_ACS2022/MapServer/8/query"
        );
    }

    #[test]
    fn where_clause_follows_filter() {
        let filter = GeographyFilter::new(2022, Survey::Acs5);

        let all_states = geography_clause(GeographyLevel::State, &filter).unwrap();
        assert_eq!(where_clause(&all_states), "1=1");

        let tracts = geography_clause(
            GeographyLevel::Tract,
            &filter.clone().with_state("TX").with_county("453"),
        )
        .unwrap();
        assert_eq!(where_clause(&tracts), "STATE='48' AND COUNTY='453'");

        let one_county = geography_clause(
            GeographyLevel::County,
            &filter.with_state("48").with_county("453"),
        )
        .unwrap();
        assert_eq!(where_clause(&one_county), "STATE='48' AND COUNTY='453'");
    }

    #[test]
    fn polygon_features_become_units() {
        let unit = feature_to_unit(&square_feature("48453001100")).unwrap().unwrap();
        assert_eq!(unit.id, "48453001100");
        assert_eq!(unit.part_count(), 1);

        let multi = json!({
            "properties": {"GEOID": "15", "NAME": "Hawaii"},
            "geometry": {
                "type": "MultiPolygon",
                "coordinates": [
                    [[[-155.0, 19.0], [-154.9, 19.0], [-154.9, 19.1], [-155.0, 19.0]]],
                    [[[-156.0, 20.0], [-155.9, 20.0], [-155.9, 20.1], [-156.0, 20.0]]]
                ]
            }
        });
        assert_eq!(feature_to_unit(&multi).unwrap().unwrap().part_count(), 2);
    }

    #[test]
    fn bad_features() {
        let no_geometry = json!({"properties": {"GEOID": "48"}, "geometry": null});
        assert!(feature_to_unit(&no_geometry).unwrap().is_none());

        let point = json!({
            "properties": {"GEOID": "48"},
            "geometry": {"type": "Point", "coordinates": [-97.7, 30.2]}
        });
        assert!(matches!(
            feature_to_unit(&point),
            Err(GeoError::Conversion { .. })
        ));

        let no_id = json!({"properties": {}, "geometry": null});
        assert!(feature_to_unit(&no_id).is_err());
    }

    #[tokio::test]
    async fn paginate_follows_transfer_limit() {
        let offsets = RefCell::new(Vec::new());

        let features = paginate("tracts", |offset| {
            offsets.borrow_mut().push(offset);
            let page = match offset {
                0 => json!({"features": [square_feature("1"), square_feature("2")], "exceededTransferLimit": true}),
                2 => json!({"features": [square_feature("3")], "exceededTransferLimit": false}),
                _ => json!({"features": []}),
            };
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(features.len(), 3);
        assert_eq!(*offsets.borrow(), vec![0, 2]);
    }

    #[tokio::test]
    async fn paginate_rejects_pages_without_features() {
        let result = paginate("tracts", |_| async { Ok(json!({"foo": 1})) }).await;
        assert!(matches!(result, Err(GeoError::Conversion { .. })));
    }

    #[tokio::test]
    async fn unsupported_level_and_bad_filter_fail_fast() {
        let provider = TigerWebProvider::new()
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let filter = GeographyFilter::new(2022, Survey::Acs5);

        assert!(matches!(
            provider.fetch_geometry(GeographyLevel::Zcta, &filter).await,
            Err(GeoError::Unsupported { level: GeographyLevel::Zcta })
        ));
        assert!(matches!(
            provider.fetch_geometry(GeographyLevel::Tract, &filter).await,
            Err(GeoError::Census(CensusError::BadRequest { .. }))
        ));
    }
}
