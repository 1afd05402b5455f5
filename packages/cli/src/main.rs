#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line front end for the Census data API.
//!
//! ```text
//! census_explorer variables --year 2022 --search "median household income"
//! census_explorer estimates B19013_001 --geography county --state TX
//! census_explorer proportion B15003_022 B15003_001 --geography tract --state TX --county 453
//! census_explorer time-series B19013_001 --years 2018,2019,2021,2022 --geography state
//! census_explorer geometry B19013_001 --geography county --state TX --output travis.geojson
//! census_explorer cache clear
//! ```
//!
//! The API key is read from `CENSUS_API_KEY` or the `--config` TOML file.
//! Set `RUST_LOG=info` to see request progress.

mod output;
mod progress;

use std::io::Write as _;
use std::path::PathBuf;

use census_explorer_census::{CensusClient, CensusConfig, EstimateQuery, ResponseCache};
use census_explorer_census_models::{GeographyFilter, GeographyLevel, Survey, TableKind};
use census_explorer_geography::{
    GeometryProvider as _, TigerWebProvider, join_geometry, to_feature_collection,
};
use census_explorer_moe::derive::{ZeroDenominator, derive_ratios, proportions_from_summary};
use clap::{Args, Parser, Subcommand};

use crate::output::{OutputFormat, Row, write_rows};
use crate::progress::YearsProgress;

#[derive(Parser)]
#[command(
    name = "census_explorer",
    about = "Query American Community Survey estimates and derive margins of error"
)]
struct Cli {
    /// TOML configuration file (API key, cache directory, retries).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format: table, csv, or json.
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Dataset vintage and geography shared by the data subcommands.
#[derive(Args, Clone)]
struct GeographyArgs {
    /// Geography level (state, county, tract, block-group, place, ...).
    #[arg(long, default_value = "state")]
    geography: GeographyLevel,

    /// State FIPS code, abbreviation, or name.
    #[arg(long)]
    state: Option<String>,

    /// Three-digit county FIPS code (requires --state).
    #[arg(long)]
    county: Option<String>,

    /// Last year of the estimate period.
    #[arg(long, default_value = "2022")]
    year: u16,

    /// acs1, acs3, or acs5.
    #[arg(long, default_value = "acs5")]
    survey: Survey,

    /// Ignore cached responses (the cache is still refreshed).
    #[arg(long)]
    no_cache: bool,
}

impl GeographyArgs {
    fn filter(&self) -> GeographyFilter {
        let mut filter = GeographyFilter::new(self.year, self.survey);
        filter.state.clone_from(&self.state);
        filter.county.clone_from(&self.county);
        filter
    }

    fn query<I, S>(&self, variables: I) -> EstimateQuery
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EstimateQuery::new(self.geography, variables, self.filter()).use_cache(!self.no_cache)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List or search the variables of a dataset
    Variables {
        #[arg(long, default_value = "2022")]
        year: u16,
        #[arg(long, default_value = "acs5")]
        survey: Survey,
        /// Table family: detailed, subject, profile, or cprofile.
        #[arg(long, default_value = "detailed")]
        kind: TableKind,
        /// Case-insensitive term matched against code, label, and concept.
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Fetch estimates and margins of error
    Estimates {
        /// Variable codes, with or without the E suffix.
        #[arg(required = true)]
        variables: Vec<String>,
        /// Denominator variable attached to every row.
        #[arg(long)]
        summary: Option<String>,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Fetch every estimate of a table
    Table {
        /// Table id, e.g. B17001.
        table: String,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Derive a proportion (part of a whole) with its margin of error
    Proportion {
        numerator: String,
        denominator: String,
        /// Emit empty values instead of failing on a zero denominator.
        #[arg(long)]
        nan_on_zero: bool,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Derive a ratio of two estimates with its margin of error
    Ratio {
        numerator: String,
        denominator: String,
        #[arg(long)]
        nan_on_zero: bool,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Fetch the same estimates for several years
    TimeSeries {
        #[arg(required = true)]
        variables: Vec<String>,
        /// Comma-separated survey years.
        #[arg(long, value_delimiter = ',', required = true)]
        years: Vec<u16>,
        /// Concurrent requests (defaults to the configured value).
        #[arg(long)]
        concurrency: Option<usize>,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Join estimates to TIGERweb boundaries and write GeoJSON
    Geometry {
        #[arg(required = true)]
        variables: Vec<String>,
        /// Output file (stdout when omitted).
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[command(flatten)]
        geo: GeographyArgs,
    },
    /// Manage the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every cached response
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = progress::init_logger();
    let cli = Cli::parse();
    let config = CensusConfig::load(cli.config.as_deref())?;
    let format = cli.format;

    match cli.command {
        Commands::Cache {
            action: CacheAction::Clear,
        } => cmd_cache_clear(&config),
        Commands::Variables {
            year,
            survey,
            kind,
            search,
            no_cache,
        } => {
            let client = CensusClient::new(config)?;
            let catalog = client
                .load_variables_for(year, survey, kind, !no_cache)
                .await?;
            let variables: Vec<_> = match search.as_deref() {
                Some(term) => catalog.search(term).into_iter().cloned().collect(),
                None => catalog.iter().cloned().collect(),
            };
            print_rows(format, &variables)
        }
        Commands::Estimates {
            variables,
            summary,
            geo,
        } => {
            let client = CensusClient::new(config)?;
            let mut query = geo.query(variables);
            query.summary_variable = summary;
            let records = client.fetch_estimates(&query).await?;
            print_rows(format, &records)
        }
        Commands::Table { table, geo } => {
            let client = CensusClient::new(config)?;
            let records = client
                .fetch_table(&table, geo.geography, &geo.filter(), !geo.no_cache)
                .await?;
            print_rows(format, &records)
        }
        Commands::Proportion {
            numerator,
            denominator,
            nan_on_zero,
            geo,
        } => {
            let client = CensusClient::new(config)?;
            let query = geo.query([numerator]).with_summary(denominator);
            let records = client.fetch_estimates(&query).await?;
            let stats = proportions_from_summary(&records, zero_policy(nan_on_zero))?;
            print_rows(format, &stats)
        }
        Commands::Ratio {
            numerator,
            denominator,
            nan_on_zero,
            geo,
        } => {
            let client = CensusClient::new(config)?;
            let numerators = client.fetch_estimates(&geo.query([numerator])).await?;
            let denominators = client.fetch_estimates(&geo.query([denominator])).await?;
            let stats = derive_ratios(&numerators, &denominators, zero_policy(nan_on_zero))?;
            print_rows(format, &stats)
        }
        Commands::TimeSeries {
            variables,
            years,
            concurrency,
            geo,
        } => {
            let client = CensusClient::new(config)?;
            let concurrency = concurrency.unwrap_or(client.config().concurrency);
            let bar = YearsProgress::start(&multi, "Fetching time series");
            let records = client
                .fetch_time_series_with_progress(&geo.query(variables), &years, concurrency, &bar)
                .await?;
            print_rows(format, &records)
        }
        Commands::Geometry {
            variables,
            output,
            geo,
        } => {
            let client = CensusClient::new(config)?;
            cmd_geometry(&client, &geo, variables, output).await
        }
    }
}

const fn zero_policy(nan_on_zero: bool) -> ZeroDenominator {
    if nan_on_zero {
        ZeroDenominator::NotANumber
    } else {
        ZeroDenominator::Fail
    }
}

fn print_rows<T: Row>(format: OutputFormat, rows: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_rows(&mut out, format, rows)?;
    out.flush()?;
    Ok(())
}

fn cmd_cache_clear(config: &CensusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = &config.cache_dir else {
        println!("Caching is disabled; nothing to clear.");
        return Ok(());
    };
    let removed = ResponseCache::new(dir.clone(), None).clear()?;
    println!("Removed {removed} cached responses from {}", dir.display());
    Ok(())
}

async fn cmd_geometry(
    client: &CensusClient,
    geo: &GeographyArgs,
    variables: Vec<String>,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = client.fetch_estimates(&geo.query(variables)).await?;

    let provider = TigerWebProvider::new()?.with_max_retries(client.config().max_retries);
    let units = provider.fetch_geometry(geo.geography, &geo.filter()).await?;

    let joined = join_geometry(&records, &units);
    if !joined.unmatched.is_empty() {
        eprintln!(
            "{} of {} records had no boundary and were left out",
            joined.unmatched.len(),
            records.len()
        );
    }

    let text = to_feature_collection(&joined)?.to_string();
    match output {
        Some(path) => {
            std::fs::write(&path, text)?;
            println!(
                "Wrote {} features to {}",
                joined.matched.len(),
                path.display()
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}
