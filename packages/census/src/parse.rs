//! Decoding of upstream JSON into typed records.
//!
//! Data endpoints answer with an array of arrays: a header row followed by
//! one row per geography, every cell a string (or `null`). Catalog
//! endpoints answer with `{"variables": {code: {...}}}`.

use std::collections::{BTreeMap, HashMap, HashSet};

use census_explorer_census_models::{
    EstimateRecord, Survey, TableKind, VariableCatalog, VariableDescriptor,
};
use serde::Deserialize;

use crate::CensusError;
use crate::query::{estimate_column, estimate_column_base, moe_column};

/// MOE annotation for a controlled estimate: the value is exact.
const CONTROLLED_MOE: f64 = -555_555_555.0;

/// Negative placeholders the upstream publishes instead of a value.
const ANNOTATION_SENTINELS: [f64; 6] = [
    -999_999_999.0,
    -888_888_888.0,
    -666_666_666.0,
    -555_555_555.0,
    -333_333_333.0,
    -222_222_222.0,
];

/// Pseudo-variables listed in every catalog that are query predicates
/// rather than data.
const PREDICATE_ONLY: [&str; 3] = ["for", "in", "ucgid"];

/// A decoded tabular response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Index of a header column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    fn require_column(&self, name: &str) -> Result<usize, CensusError> {
        self.column(name).ok_or_else(|| CensusError::Parse {
            message: format!("Response is missing column '{name}'"),
        })
    }
}

/// Splits a tabular response into header and rows.
///
/// # Errors
///
/// Returns [`CensusError::Parse`] if the payload is not an array of
/// equally sized arrays of scalars.
pub fn parse_table(payload: &serde_json::Value) -> Result<Table, CensusError> {
    let parse_err = |message: String| CensusError::Parse { message };

    let rows = payload
        .as_array()
        .ok_or_else(|| parse_err("Expected a JSON array of rows".to_string()))?;
    let (header, body) = rows
        .split_first()
        .ok_or_else(|| parse_err("Response has no header row".to_string()))?;

    let header: Vec<String> = decode_row(header, 0)?
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect();

    let mut decoded = Vec::with_capacity(body.len());
    for (i, row) in body.iter().enumerate() {
        let cells = decode_row(row, i + 1)?;
        if cells.len() != header.len() {
            return Err(parse_err(format!(
                "Row {} has {} cells, header has {}",
                i + 1,
                cells.len(),
                header.len()
            )));
        }
        decoded.push(cells);
    }

    Ok(Table {
        header,
        rows: decoded,
    })
}

fn decode_row(row: &serde_json::Value, index: usize) -> Result<Vec<Option<String>>, CensusError> {
    let cells = row.as_array().ok_or_else(|| CensusError::Parse {
        message: format!("Row {index} is not an array"),
    })?;

    cells
        .iter()
        .map(|cell| match cell {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s.clone())),
            serde_json::Value::Number(n) => Ok(Some(n.to_string())),
            other => Err(CensusError::Parse {
                message: format!("Row {index} has a non-scalar cell: {other}"),
            }),
        })
        .collect()
}

/// Decodes one numeric cell.
///
/// Missing cells and annotation sentinels become `NaN`, except the
/// controlled-estimate MOE which becomes `0.0`.
///
/// # Errors
///
/// Returns [`CensusError::Parse`] for non-numeric text.
#[allow(clippy::float_cmp)]
pub fn decode_value(cell: Option<&str>, is_moe: bool) -> Result<f64, CensusError> {
    let Some(text) = cell.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(f64::NAN);
    };

    let value: f64 = text.parse().map_err(|_| CensusError::Parse {
        message: format!("'{text}' is not a number"),
    })?;

    if is_moe && value == CONTROLLED_MOE {
        return Ok(0.0);
    }
    if ANNOTATION_SENTINELS.contains(&value) {
        return Ok(f64::NAN);
    }

    Ok(value)
}

/// Converts a data table into one record per geography and variable.
///
/// The geography id is the concatenation of `id_columns` (e.g. state,
/// county, tract).
///
/// # Errors
///
/// Returns [`CensusError::Parse`] if a required column is absent, a value
/// is not numeric, or the same `(geography, variable)` appears twice.
pub fn records_from_table(
    table: &Table,
    codes: &[String],
    id_columns: &[String],
    year: u16,
    survey: Survey,
) -> Result<Vec<EstimateRecord>, CensusError> {
    let name_idx = table.require_column("NAME")?;
    let id_idx = id_columns
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<Vec<_>, _>>()?;
    let value_idx = codes
        .iter()
        .map(|code| {
            Ok((
                code,
                table.require_column(&estimate_column(code))?,
                table.require_column(&moe_column(code))?,
            ))
        })
        .collect::<Result<Vec<_>, CensusError>>()?;

    let mut seen: HashSet<(String, &str)> = HashSet::new();
    let mut records = Vec::with_capacity(table.rows.len() * codes.len());

    for row in &table.rows {
        let geography_id: String = id_idx
            .iter()
            .map(|&i| row[i].as_deref().unwrap_or_default())
            .collect();
        if geography_id.is_empty() {
            return Err(CensusError::Parse {
                message: "Row without geography identifier".to_string(),
            });
        }
        let geography_name = row[name_idx].clone().unwrap_or_default();

        for &(code, e_idx, m_idx) in &value_idx {
            if !seen.insert((geography_id.clone(), code.as_str())) {
                return Err(CensusError::Parse {
                    message: format!(
                        "Duplicate row for geography {geography_id} and variable {code}"
                    ),
                });
            }

            records.push(EstimateRecord {
                geography_id: geography_id.clone(),
                geography_name: geography_name.clone(),
                variable_code: code.clone(),
                estimate: decode_value(row[e_idx].as_deref(), false)?,
                margin_of_error: decode_value(row[m_idx].as_deref(), true)?,
                year,
                survey,
                summary: None,
            });
        }
    }

    Ok(records)
}

/// Base codes of a `group()` response: every estimate column that has a
/// matching margin column, in header order.
#[must_use]
pub fn group_codes(table: &Table) -> Vec<String> {
    let columns: HashSet<&str> = table.header.iter().map(String::as_str).collect();
    table
        .header
        .iter()
        .filter_map(|h| estimate_column_base(h))
        .filter(|base| columns.contains(moe_column(base).as_str()))
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    variables: HashMap<String, RawVariable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVariable {
    #[serde(default)]
    label: String,
    #[serde(default)]
    concept: Option<String>,
    #[serde(default)]
    predicate_type: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

/// Parses a `variables.json` document into a catalog of estimate variables.
///
/// Predicate-only entries are skipped and margin and annotation columns
/// are folded away, leaving one descriptor per base code.
///
/// # Errors
///
/// Returns [`CensusError::Parse`] if the document lacks a `variables` map.
pub fn parse_variables(
    payload: &serde_json::Value,
    dataset_year: u16,
    survey: Survey,
    table_kind: TableKind,
) -> Result<VariableCatalog, CensusError> {
    let raw = RawCatalog::deserialize(payload).map_err(|e| CensusError::Parse {
        message: format!("Invalid variables document: {e}"),
    })?;

    let mut variables = BTreeMap::new();
    for (name, var) in raw.variables {
        if PREDICATE_ONLY.contains(&name.as_str()) {
            continue;
        }
        let Some(code) = estimate_column_base(&name) else {
            continue;
        };

        let descriptor = VariableDescriptor {
            code: code.to_string(),
            label: var.label,
            concept: var.concept.unwrap_or_default(),
            group: var.group.filter(|g| !g.is_empty() && g != "N/A"),
            predicate_type: var.predicate_type,
            dataset_year,
            survey,
        };
        variables.insert(descriptor.code.clone(), descriptor);
    }

    log::debug!(
        "Parsed {} {table_kind} variables for {survey} {dataset_year}",
        variables.len()
    );

    Ok(VariableCatalog {
        dataset_year,
        survey,
        table_kind,
        variables,
    })
}
