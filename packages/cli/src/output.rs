//! Rendering of records as aligned text, CSV, or JSON.

use std::io::Write;

use census_explorer_census_models::{DerivedStatistic, EstimateRecord, VariableDescriptor};
use serde::Serialize;
use strum_macros::{Display, EnumString};

/// Output format selected with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Json,
}

/// A record that can be printed as one row.
pub trait Row: Serialize {
    fn headers() -> &'static [&'static str];
    fn fields(&self) -> Vec<String>;
}

impl Row for EstimateRecord {
    fn headers() -> &'static [&'static str] {
        &[
            "geography_id",
            "name",
            "variable",
            "year",
            "estimate",
            "moe",
            "summary_estimate",
            "summary_moe",
        ]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.geography_id.clone(),
            self.geography_name.clone(),
            self.variable_code.clone(),
            self.year.to_string(),
            number(self.estimate),
            number(self.margin_of_error),
            self.summary
                .as_ref()
                .map_or_else(String::new, |s| number(s.estimate)),
            self.summary
                .as_ref()
                .map_or_else(String::new, |s| number(s.margin_of_error)),
        ]
    }
}

impl Row for DerivedStatistic {
    fn headers() -> &'static [&'static str] {
        &["geography_id", "year", "kind", "value", "moe", "status"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.geography_id.clone(),
            self.year.to_string(),
            self.kind.to_string(),
            number(self.value),
            number(self.margin_of_error),
            self.status.to_string(),
        ]
    }
}

impl Row for VariableDescriptor {
    fn headers() -> &'static [&'static str] {
        &["code", "group", "concept", "label"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.code.clone(),
            self.group.clone().unwrap_or_default(),
            self.concept.clone(),
            self.label.clone(),
        ]
    }
}

/// Undefined values print as an empty cell.
fn number(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

fn pad_line<'a>(values: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    values
        .zip(widths)
        .map(|(v, &w)| format!("{v:<w$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Writes `rows` to `out` in `format`.
///
/// # Errors
///
/// Returns an error if writing or serialization fails.
pub fn write_rows<T: Row, W: Write>(
    out: &mut W,
    format: OutputFormat,
    rows: &[T],
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, rows)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record(T::headers())?;
            for row in rows {
                writer.write_record(row.fields())?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            let cells: Vec<Vec<String>> = rows.iter().map(Row::fields).collect();
            let mut widths: Vec<usize> = T::headers().iter().map(|h| h.len()).collect();
            for row in &cells {
                for (width, cell) in widths.iter_mut().zip(row) {
                    *width = (*width).max(cell.chars().count());
                }
            }

            writeln!(out, "{}", pad_line(T::headers().iter().copied(), &widths))?;
            for row in &cells {
                writeln!(out, "{}", pad_line(row.iter().map(String::as_str), &widths))?;
            }
        }
    }
    Ok(())
}
