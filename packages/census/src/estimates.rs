//! Estimate fetching: variable lists, whole tables, and multi-year series.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use census_explorer_census_models::{
    EstimateRecord, GeographyFilter, GeographyLevel, SummaryValue, TableKind,
};
use futures::{StreamExt as _, TryStreamExt as _};

use crate::parse::{group_codes, parse_table, records_from_table};
use crate::progress::{ProgressCallback, null_progress};
use crate::query::{
    GeographyClause, geography_clause, get_fields, normalize_variable, plan_requests,
};
use crate::variables::ensure_published;
use crate::{CacheKey, CensusClient, CensusError};

/// A request for estimate/MOE pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateQuery {
    pub geography: GeographyLevel,
    /// Variable codes, with or without the `E` suffix.
    pub variables: Vec<String>,
    pub filter: GeographyFilter,
    /// Denominator variable attached to every record as
    /// [`EstimateRecord::summary`].
    pub summary_variable: Option<String>,
    pub use_cache: bool,
}

impl EstimateQuery {
    #[must_use]
    pub fn new<I, S>(geography: GeographyLevel, variables: I, filter: GeographyFilter) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            geography,
            variables: variables.into_iter().map(Into::into).collect(),
            filter,
            summary_variable: None,
            use_cache: true,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, code: impl Into<String>) -> Self {
        self.summary_variable = Some(code.into());
        self
    }

    #[must_use]
    pub const fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Returns a copy of this query for another survey year.
    #[must_use]
    pub fn for_year(&self, year: u16) -> Self {
        Self {
            filter: self.filter.for_year(year),
            ..self.clone()
        }
    }
}

impl CensusClient {
    /// Fetches one record per `(geography, variable)` for the query.
    ///
    /// Variables are split by table family and into requests of at most
    /// 50 `get` fields. With a summary variable every record carries the
    /// denominator value of its geography.
    ///
    /// # Errors
    ///
    /// * [`CensusError::BadRequest`] for an empty variable list, a
    ///   malformed code, an invalid filter combination, or an upstream
    ///   rejection (e.g. an unknown variable)
    /// * [`CensusError::NotFound`] for an unpublished year or dataset
    /// * [`CensusError::Parse`] for malformed or duplicated rows
    /// * [`CensusError::UpstreamUnavailable`] / [`CensusError::RateLimited`]
    pub async fn fetch_estimates(
        &self,
        query: &EstimateQuery,
    ) -> Result<Vec<EstimateRecord>, CensusError> {
        if query.variables.is_empty() {
            return Err(CensusError::BadRequest {
                message: "At least one variable is required".to_string(),
            });
        }

        let codes = query
            .variables
            .iter()
            .map(|v| normalize_variable(v))
            .collect::<Result<Vec<_>, _>>()?;
        let summary_code = query
            .summary_variable
            .as_deref()
            .map(normalize_variable)
            .transpose()?;
        let clause = geography_clause(query.geography, &query.filter)?;
        ensure_published(query.filter.year, query.filter.survey)?;

        let plan = plan_requests(&codes);
        log::info!(
            "Fetching {} variables at {} level for {} {} in {} request(s)",
            codes.len(),
            query.geography,
            query.filter.survey,
            query.filter.year,
            plan.len()
        );

        let concurrency = self.config().concurrency.max(1);
        let chunks: Vec<Vec<EstimateRecord>> = futures::stream::iter(plan)
            .map(|(kind, chunk)| {
                let clause = &clause;
                async move {
                    self.fetch_chunk(kind, &chunk, clause, &query.filter, query.use_cache)
                        .await
                }
            })
            .buffered(concurrency)
            .try_collect()
            .await?;
        let mut records: Vec<EstimateRecord> = chunks.into_iter().flatten().collect();

        if let Some(summary_code) = summary_code {
            let kind = TableKind::from_code(&summary_code);
            let summaries: HashMap<String, SummaryValue> = self
                .fetch_chunk(
                    kind,
                    std::slice::from_ref(&summary_code),
                    &clause,
                    &query.filter,
                    query.use_cache,
                )
                .await?
                .into_iter()
                .map(|r| {
                    (
                        r.geography_id,
                        SummaryValue {
                            variable_code: r.variable_code,
                            estimate: r.estimate,
                            margin_of_error: r.margin_of_error,
                        },
                    )
                })
                .collect();

            for record in &mut records {
                record.summary = summaries.get(&record.geography_id).cloned();
                if record.summary.is_none() {
                    log::warn!(
                        "No {summary_code} value for geography {}",
                        record.geography_id
                    );
                }
            }
        }

        Ok(records)
    }

    /// Fetches every estimate of a table via `group(<table>)`.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::BadRequest`] for an invalid table id or
    /// filter, [`CensusError::NotFound`] if the table has no estimate
    /// columns, plus the errors of [`CensusClient::fetch_estimates`].
    pub async fn fetch_table(
        &self,
        table: &str,
        geography: GeographyLevel,
        filter: &GeographyFilter,
        use_cache: bool,
    ) -> Result<Vec<EstimateRecord>, CensusError> {
        let table = table.trim().to_ascii_uppercase();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CensusError::BadRequest {
                message: format!("'{table}' is not a table id"),
            });
        }

        let clause = geography_clause(geography, filter)?;
        ensure_published(filter.year, filter.survey)?;

        let kind = TableKind::from_code(&table);
        let url = self.dataset_url(filter.year, filter.survey, kind);
        let mut params = vec![("get".to_string(), format!("NAME,group({table})"))];
        params.extend(clause.to_params());
        let key = CacheKey::new(
            &url,
            filter.year,
            filter.survey,
            &geography.to_string(),
            &params,
        );

        let payload = self.get_cached(&url, &params, &key, use_cache).await?;
        let parsed = parse_table(&payload)?;
        let codes = group_codes(&parsed);
        if codes.is_empty() {
            return Err(CensusError::NotFound {
                message: format!("Table {table} has no estimate columns"),
            });
        }

        log::info!(
            "Fetched table {table}: {} variables x {} geographies",
            codes.len(),
            parsed.rows.len()
        );
        records_from_table(
            &parsed,
            &codes,
            &clause.id_columns(),
            filter.year,
            filter.survey,
        )
    }

    /// Runs `query` once per year with at most `concurrency` requests in
    /// flight. Records are returned in year order.
    ///
    /// # Errors
    ///
    /// Fails with the first error of any year; no partial series is
    /// returned.
    pub async fn fetch_time_series(
        &self,
        query: &EstimateQuery,
        years: &[u16],
        concurrency: usize,
    ) -> Result<Vec<EstimateRecord>, CensusError> {
        self.fetch_time_series_with_progress(query, years, concurrency, &null_progress())
            .await
    }

    /// [`CensusClient::fetch_time_series`] reporting one unit of progress
    /// per completed year.
    ///
    /// # Errors
    ///
    /// See [`CensusClient::fetch_time_series`].
    pub async fn fetch_time_series_with_progress(
        &self,
        query: &EstimateQuery,
        years: &[u16],
        concurrency: usize,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<Vec<EstimateRecord>, CensusError> {
        let years: BTreeSet<u16> = years.iter().copied().collect();
        if years.is_empty() {
            return Err(CensusError::BadRequest {
                message: "At least one year is required".to_string(),
            });
        }

        progress.set_total(years.len() as u64);

        let mut per_year: Vec<(u16, Vec<EstimateRecord>)> = futures::stream::iter(years)
            .map(|year| {
                let query = query.for_year(year);
                async move {
                    progress.set_message(format!("{} {year}", query.filter.survey));
                    let records = self.fetch_estimates(&query).await?;
                    progress.inc(1);
                    Ok::<_, CensusError>((year, records))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

        per_year.sort_by_key(|(year, _)| *year);
        let records: Vec<EstimateRecord> =
            per_year.into_iter().flat_map(|(_, records)| records).collect();

        progress.finish(format!("{} records", records.len()));
        Ok(records)
    }

    async fn fetch_chunk(
        &self,
        kind: TableKind,
        codes: &[String],
        clause: &GeographyClause,
        filter: &GeographyFilter,
        use_cache: bool,
    ) -> Result<Vec<EstimateRecord>, CensusError> {
        let url = self.dataset_url(filter.year, filter.survey, kind);
        let mut params = vec![("get".to_string(), get_fields(codes))];
        params.extend(clause.to_params());
        let key = CacheKey::new(
            &url,
            filter.year,
            filter.survey,
            &clause.level.to_string(),
            &params,
        );

        let payload = self.get_cached(&url, &params, &key, use_cache).await?;
        let table = parse_table(&payload)?;
        records_from_table(
            &table,
            codes,
            &clause.id_columns(),
            filter.year,
            filter.survey,
        )
    }
}

#[cfg(test)]
mod tests {
    use census_explorer_census_models::Survey;
    use serde_json::json;

    use super::*;
    use crate::CensusConfig;
    use crate::testing::{MockTransport, param, params};

    /// Answers any data request with two Texas counties. Summary-style
    /// totals (`_001`) are 1000, everything else 100.
    fn county_rows(_url: &str, query: &[(String, String)]) -> Result<serde_json::Value, CensusError> {
        let fields: Vec<&str> = param(query, "get").unwrap().split(',').collect();
        let mut header: Vec<String> = fields.iter().map(ToString::to_string).collect();
        header.extend(["state".to_string(), "county".to_string()]);

        let row = |county: &str, name: &str| {
            let mut row: Vec<String> = fields
                .iter()
                .map(|f| match *f {
                    "NAME" => name.to_string(),
                    f if f.ends_with("_001E") => "1000".to_string(),
                    f if f.ends_with('E') => "100".to_string(),
                    _ => "10".to_string(),
                })
                .collect();
            row.extend(["48".to_string(), county.to_string()]);
            row
        };

        Ok(json!([
            header,
            row("453", "Travis County, Texas"),
            row("201", "Harris County, Texas")
        ]))
    }

    /// Answers a data request the way the upstream nests geographies:
    /// every enclosing level comes back as its own trailing column, filtered
    /// or not. Each unit is a name and its comma-separated codes.
    fn nested_rows(
        query: &[(String, String)],
        geography: &[&str],
        units: &[(&str, &str)],
    ) -> serde_json::Value {
        let fields: Vec<&str> = param(query, "get").unwrap().split(',').collect();
        let header: Vec<&str> = fields.iter().chain(geography).copied().collect();
        let mut rows = vec![json!(header)];
        for (name, codes) in units {
            let row: Vec<&str> = fields
                .iter()
                .map(|f| match *f {
                    "NAME" => *name,
                    f if f.ends_with('E') => "250",
                    _ => "25",
                })
                .chain(codes.split(','))
                .collect();
            rows.push(json!(row));
        }
        serde_json::Value::Array(rows)
    }

    fn client(transport: Arc<MockTransport>) -> CensusClient {
        let config = CensusConfig {
            api_key: Some("test-key".to_string()),
            cache_dir: None,
            ..CensusConfig::default()
        };
        CensusClient::with_transport(config, transport).unwrap()
    }

    fn texas(year: u16) -> GeographyFilter {
        GeographyFilter::new(year, Survey::Acs5).with_state("TX")
    }

    #[tokio::test]
    async fn fetches_one_record_per_geography_and_variable() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());
        let query = EstimateQuery::new(
            GeographyLevel::County,
            ["B19013_001E", "B17001_002"],
            texas(2022),
        );

        let records = client.fetch_estimates(&query).await.unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].geography_id, "48453");
        assert_eq!(records[0].variable_code, "B19013_001");
        assert!(records.iter().all(|r| r.year == 2022 && r.summary.is_none()));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(param(&calls[0].1, "for"), Some("county:*"));
        assert_eq!(params(&calls[0].1, "in"), vec!["state:48"]);
        assert_eq!(param(&calls[0].1, "key"), Some("test-key"));
    }

    #[tokio::test]
    async fn large_variable_lists_are_chunked() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());
        let variables: Vec<String> = (2..=31).map(|i| format!("B01001_{i:03}E")).collect();
        let query = EstimateQuery::new(GeographyLevel::County, variables, texas(2022));

        let records = client.fetch_estimates(&query).await.unwrap();

        assert_eq!(records.len(), 60);
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        for (_, query) in &calls {
            assert!(param(query, "get").unwrap().split(',').count() <= 50);
        }
    }

    #[tokio::test]
    async fn subject_variables_use_subject_endpoint() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());
        let query = EstimateQuery::new(
            GeographyLevel::County,
            ["B19013_001", "S1701_C03_001"],
            texas(2022),
        );

        client.fetch_estimates(&query).await.unwrap();

        let mut urls: Vec<String> = transport.calls().into_iter().map(|(url, _)| url).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://api.census.gov/data/2022/acs/acs5",
                "https://api.census.gov/data/2022/acs/acs5/subject"
            ]
        );
    }

    #[tokio::test]
    async fn summary_variable_is_joined_by_geography() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());
        let query = EstimateQuery::new(GeographyLevel::County, ["B15003_022"], texas(2022))
            .with_summary("B15003_001E");

        let records = client.fetch_estimates(&query).await.unwrap();

        assert_eq!(transport.call_count(), 2);
        assert_eq!(records.len(), 2);
        let summary = records[0].summary.as_ref().unwrap();
        assert_eq!(summary.variable_code, "B15003_001");
        assert!((summary.estimate - 1000.0).abs() < f64::EPSILON);
        assert!((records[0].estimate - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn invalid_filters_fail_before_any_request() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());

        let county_only = GeographyFilter::new(2022, Survey::Acs5).with_county("453");
        let query = EstimateQuery::new(GeographyLevel::County, ["B19013_001"], county_only);
        assert!(matches!(
            client.fetch_estimates(&query).await,
            Err(CensusError::BadRequest { .. })
        ));

        let empty = EstimateQuery::new(GeographyLevel::County, Vec::<String>::new(), texas(2022));
        assert!(matches!(
            client.fetch_estimates(&empty).await,
            Err(CensusError::BadRequest { .. })
        ));

        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_variable_is_an_error_not_an_empty_result() {
        let transport = Arc::new(MockTransport::new(|_, _| {
            Err(CensusError::BadRequest {
                message: "error: unknown variable 'B99999_999E'".to_string(),
            })
        }));
        let client = client(transport);
        let query = EstimateQuery::new(GeographyLevel::County, ["B99999_999"], texas(2022));

        assert!(matches!(
            client.fetch_estimates(&query).await,
            Err(CensusError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_rows_fail() {
        let transport = Arc::new(MockTransport::new(|_, _| {
            Ok(json!([
                ["NAME", "B01001_001E", "B01001_001M", "state"],
                ["Texas", "1", "0", "48"],
                ["Texas", "1", "0", "48"]
            ]))
        }));
        let client = client(transport);
        let query = EstimateQuery::new(
            GeographyLevel::State,
            ["B01001_001"],
            GeographyFilter::new(2022, Survey::Acs5),
        );

        assert!(matches!(
            client.fetch_estimates(&query).await,
            Err(CensusError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn cache_serves_repeat_queries() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(county_rows));
        let config = CensusConfig {
            api_key: Some("test-key".to_string()),
            cache_dir: Some(dir.path().to_path_buf()),
            ..CensusConfig::default()
        };
        let client = CensusClient::with_transport(config, transport.clone()).unwrap();
        let query = EstimateQuery::new(GeographyLevel::County, ["B19013_001"], texas(2022));

        let first = client.fetch_estimates(&query).await.unwrap();
        let second = client.fetch_estimates(&query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.call_count(), 1);

        client
            .fetch_estimates(&query.clone().use_cache(false))
            .await
            .unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn fetch_table_reads_group_columns() {
        let transport = Arc::new(MockTransport::new(|_, query| {
            assert_eq!(param(query, "get"), Some("NAME,group(B17001)"));
            Ok(json!([
                ["GEO_ID", "NAME", "B17001_001E", "B17001_001EA", "B17001_001M", "B17001_001MA", "B17001_002E", "B17001_002M", "state"],
                ["0400000US48", "Texas", "28000000", null, "-555555555", null, "3900000", "40000", "48"]
            ]))
        }));
        let client = client(transport);

        let records = client
            .fetch_table(
                "b17001",
                GeographyLevel::State,
                &GeographyFilter::new(2022, Survey::Acs5).with_state("48"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].variable_code, "B17001_001");
        assert!(records[0].margin_of_error.abs() < f64::EPSILON);
        assert_eq!(records[1].geography_id, "48");
    }

    #[tokio::test]
    async fn time_series_spans_years_in_order() {
        let transport = Arc::new(MockTransport::new(county_rows));
        let client = client(transport.clone());
        let query = EstimateQuery::new(GeographyLevel::County, ["B19013_001"], texas(2022));

        let records = client
            .fetch_time_series(&query, &[2021, 2019, 2020, 2021], 2)
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 3);
        let years: Vec<u16> = records.iter().map(|r| r.year).collect();
        assert_eq!(years, vec![2019, 2019, 2020, 2020, 2021, 2021]);
    }

    #[tokio::test]
    async fn time_series_fails_as_a_whole() {
        let transport = Arc::new(MockTransport::new(|url, query| {
            if url.contains("/2020/") {
                Err(CensusError::NotFound {
                    message: "no dataset".to_string(),
                })
            } else {
                county_rows(url, query)
            }
        }));
        let client = client(transport);
        let query = EstimateQuery::new(GeographyLevel::County, ["B19013_001"], texas(2022));

        assert!(matches!(
            client.fetch_time_series(&query, &[2019, 2020, 2021], 4).await,
            Err(CensusError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn nationwide_counties_keep_state_in_geoid() {
        let transport = Arc::new(MockTransport::new(|_, query| {
            Ok(nested_rows(
                query,
                &["state", "county"],
                &[
                    ("Autauga County, Alabama", "01,001"),
                    ("Los Angeles County, California", "06,037"),
                    ("Travis County, Texas", "48,453"),
                    ("Harris County, Texas", "48,201"),
                    ("Baldwin County, Georgia", "13,009"),
                    ("Baldwin County, Alabama", "01,003"),
                ],
            ))
        }));
        let client = client(transport.clone());
        let query = EstimateQuery::new(
            GeographyLevel::County,
            ["B19013_001"],
            GeographyFilter::new(2022, Survey::Acs5),
        );

        let records = client.fetch_estimates(&query).await.unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.geography_id.as_str()).collect();
        assert_eq!(ids, vec!["01001", "06037", "48453", "48201", "13009", "01003"]);
        assert!(ids.iter().all(|id| id.len() == 5));
        assert!(params(&transport.calls()[0].1, "in").is_empty());
    }

    #[tokio::test]
    async fn tracts_by_state_keep_county_in_geoid() {
        let transport = Arc::new(MockTransport::new(|_, query| {
            Ok(nested_rows(
                query,
                &["state", "county", "tract"],
                &[
                    ("Census Tract 1.01; Travis County; Texas", "48,453,000101"),
                    ("Census Tract 1.01; Harris County; Texas", "48,201,000101"),
                ],
            ))
        }));
        let client = client(transport);
        let query = EstimateQuery::new(GeographyLevel::Tract, ["B19013_001"], texas(2022));

        let records = client.fetch_estimates(&query).await.unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.geography_id.as_str()).collect();
        assert_eq!(ids, vec!["48453000101", "48201000101"]);
    }

    #[tokio::test]
    async fn block_groups_keep_tract_in_geoid() {
        let transport = Arc::new(MockTransport::new(|_, query| {
            Ok(nested_rows(
                query,
                &["state", "county", "tract", "block group"],
                &[
                    ("Block Group 1; Census Tract 1.01; Travis County; Texas", "48,453,000101,1"),
                    ("Block Group 1; Census Tract 1.02; Travis County; Texas", "48,453,000102,1"),
                    ("Block Group 2; Census Tract 1.02; Travis County; Texas", "48,453,000102,2"),
                ],
            ))
        }));
        let client = client(transport.clone());
        let query = EstimateQuery::new(
            GeographyLevel::BlockGroup,
            ["B19013_001"],
            texas(2022).with_county("453"),
        );

        let records = client.fetch_estimates(&query).await.unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.geography_id.as_str()).collect();
        assert_eq!(ids, vec!["484530001011", "484530001021", "484530001022"]);
        assert_eq!(
            params(&transport.calls()[0].1, "in"),
            vec!["state:48", "county:453"]
        );
    }
}
