//! Variable catalog loading.

use census_explorer_census_models::{Survey, TableKind, VariableCatalog};

use crate::parse::parse_variables;
use crate::{CacheKey, CensusClient, CensusError};

/// Fails with [`CensusError::NotFound`] for a `(year, survey)` pair that
/// was never published, so no request is wasted on it.
pub(crate) fn ensure_published(year: u16, survey: Survey) -> Result<(), CensusError> {
    if survey.is_published(year) {
        Ok(())
    } else {
        Err(CensusError::NotFound {
            message: format!("ACS {survey} estimates were not published for {year}"),
        })
    }
}

impl CensusClient {
    /// Loads the detailed-table variable catalog of a dataset vintage.
    ///
    /// # Errors
    ///
    /// See [`CensusClient::load_variables_for`].
    pub async fn load_variables(
        &self,
        dataset_year: u16,
        survey: Survey,
        use_cache: bool,
    ) -> Result<VariableCatalog, CensusError> {
        self.load_variables_for(dataset_year, survey, TableKind::Detailed, use_cache)
            .await
    }

    /// Loads the variable catalog served by one table family endpoint.
    ///
    /// With `use_cache` a cached catalog is returned without any network
    /// request.
    ///
    /// # Errors
    ///
    /// * [`CensusError::NotFound`] if the survey was not published for
    ///   `dataset_year` or the upstream has no such dataset
    /// * [`CensusError::UpstreamUnavailable`] after exhausted retries
    /// * [`CensusError::RateLimited`] on HTTP 429
    /// * [`CensusError::Parse`] if the catalog document is malformed
    pub async fn load_variables_for(
        &self,
        dataset_year: u16,
        survey: Survey,
        table_kind: TableKind,
        use_cache: bool,
    ) -> Result<VariableCatalog, CensusError> {
        ensure_published(dataset_year, survey)?;

        let url = format!(
            "{}/variables.json",
            self.dataset_url(dataset_year, survey, table_kind)
        );
        let key = CacheKey::new(&url, dataset_year, survey, table_kind.as_ref(), &[]);

        let payload = self.get_cached(&url, &[], &key, use_cache).await?;
        let catalog = parse_variables(&payload, dataset_year, survey, table_kind)?;

        log::info!(
            "Loaded {} variables for {survey} {dataset_year} ({table_kind})",
            catalog.len()
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::CensusConfig;
    use crate::testing::MockTransport;

    fn catalog_doc() -> serde_json::Value {
        json!({
            "variables": {
                "for": {"label": "Census API FIPS 'for' clause"},
                "B19013_001E": {
                    "label": "Estimate!!Median household income in the past 12 months",
                    "concept": "MEDIAN HOUSEHOLD INCOME IN THE PAST 12 MONTHS",
                    "predicateType": "int",
                    "group": "B19013"
                },
                "B19013_001M": {"label": "Margin of Error!!Median household income"}
            }
        })
    }

    fn client(transport: Arc<MockTransport>, cache_dir: Option<&std::path::Path>) -> CensusClient {
        let config = CensusConfig {
            api_key: Some("test-key".to_string()),
            cache_dir: cache_dir.map(std::path::Path::to_path_buf),
            ..CensusConfig::default()
        };
        CensusClient::with_transport(config, transport).unwrap()
    }

    #[tokio::test]
    async fn loads_catalog_from_variables_endpoint() {
        let transport = Arc::new(MockTransport::new(|_, _| Ok(catalog_doc())));
        let client = client(transport.clone(), None);

        let catalog = client.load_variables(2022, Survey::Acs5, true).await.unwrap();

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.table_kind, TableKind::Detailed);
        let calls = transport.calls();
        assert_eq!(calls[0].0, "https://api.census.gov/data/2022/acs/acs5/variables.json");
        assert_eq!(crate::testing::param(&calls[0].1, "key"), Some("test-key"));
    }

    #[tokio::test]
    async fn subject_catalog_uses_subject_endpoint() {
        let transport = Arc::new(MockTransport::new(|_, _| Ok(json!({"variables": {}}))));
        let client = client(transport.clone(), None);

        client
            .load_variables_for(2021, Survey::Acs1, TableKind::Subject, true)
            .await
            .unwrap();

        assert!(transport.calls()[0].0.ends_with("/2021/acs/acs1/subject/variables.json"));
    }

    #[tokio::test]
    async fn cached_catalog_makes_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(|_, _| Ok(catalog_doc())));
        let client = client(transport.clone(), Some(dir.path()));

        let first = client.load_variables(2022, Survey::Acs5, true).await.unwrap();
        let second = client.load_variables(2022, Survey::Acs5, true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.call_count(), 1);

        client.load_variables(2022, Survey::Acs5, false).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn unpublished_vintage_is_not_found_without_request() {
        let transport = Arc::new(MockTransport::new(|_, _| Ok(catalog_doc())));
        let client = client(transport.clone(), None);

        let err = client
            .load_variables(2020, Survey::Acs1, true)
            .await
            .unwrap_err();

        assert!(matches!(err, CensusError::NotFound { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn upstream_errors_propagate() {
        let transport = Arc::new(MockTransport::new(|_, _| {
            Err(CensusError::RateLimited { retry_after: None })
        }));
        let client = client(transport, None);

        assert!(matches!(
            client.load_variables(2022, Survey::Acs5, true).await,
            Err(CensusError::RateLimited { .. })
        ));
    }
}
