//! Input table loading and row identity

use std::path::Path;

use anyhow::{Context, Result};
use chemharvest_core::{IdentityTable, ItemId, JobError};

use crate::config::Config;

/// One input row reduced to what generation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: ItemId,
    /// Values of the id columns, in configured order
    pub id_values: Vec<String>,
    pub text: String,
}

impl Row {
    pub fn new(id_values: Vec<String>, text: String) -> Self {
        Self {
            id: ItemId::composite(&id_values),
            id_values,
            text,
        }
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize, JobError> {
    headers.iter().position(|h| h == name).ok_or_else(|| {
        JobError::Config(format!("{}: no column named '{name}'", path.display()))
    })
}

/// Read the input CSV. Missing id or text columns are configuration errors.
pub fn load_rows(config: &Config) -> Result<Vec<Row>> {
    let path = config.data_path.as_path();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let id_idx = config
        .id_columns
        .iter()
        .map(|c| column_index(&headers, c, path))
        .collect::<Result<Vec<_>, _>>()?;
    let text_idx = column_index(&headers, &config.text_column, path)?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("{}: bad row {}", path.display(), line + 2))?;
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        rows.push(Row::new(
            id_idx.iter().map(|&i| field(i)).collect(),
            field(text_idx),
        ));
    }
    log::info!("{}: {} rows", path.display(), chemharvest_core::fmt_num(rows.len()));
    Ok(rows)
}

/// Identity columns of the results table: id columns, then the text column.
pub fn identity_table(config: &Config, rows: &[Row]) -> IdentityTable {
    let columns = config
        .id_columns
        .iter()
        .chain(std::iter::once(&config.text_column))
        .cloned()
        .collect();
    let mut table = IdentityTable::new(columns);
    for row in rows {
        let mut values = row.id_values.clone();
        values.push(row.text.clone());
        table.insert(row.id.clone(), values);
    }
    table
}
