//! Result merger: sink records joined with identifying columns into a CSV.

use std::io;
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::item::{CompletionRecord, ItemId};

/// Identifying columns per item id, in the original input order.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    columns: Vec<String>,
    rows: FxHashMap<ItemId, Vec<String>>,
    order: Vec<ItemId>,
}

impl IdentityTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    /// Add the identifying values of one item; the first insert per id wins.
    pub fn insert(&mut self, id: ItemId, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.columns.len());
        if !self.rows.contains_key(&id) {
            self.order.push(id.clone());
            self.rows.insert(id, values);
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, id: &ItemId) -> Option<&[String]> {
        self.rows.get(id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Coverage of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub rows_written: usize,
    /// Identities with no completion record (failed or never reached)
    pub missing: usize,
    /// Records whose id has no identity row
    pub unmatched: usize,
}

impl MergeReport {
    pub fn log(&self, path: &Path) {
        log::info!(
            "{}: {} rows ({} without result, {} without identity)",
            path.display(),
            crate::progress::fmt_num(self.rows_written),
            crate::progress::fmt_num(self.missing),
            crate::progress::fmt_num(self.unmatched)
        );
    }
}

/// Write one CSV row per record id: identity columns, then `fields`.
///
/// `project` maps a result to exactly `fields.len()` cells. With an identity
/// table that has no columns the output is the projection alone. Duplicate
/// record ids keep the first record. Written to `<path>.tmp` then renamed.
pub fn merge_csv<R>(
    path: &Path,
    records: &[CompletionRecord<R>],
    identities: &IdentityTable,
    fields: &[&str],
    project: impl Fn(&ItemId, &R) -> Vec<String>,
) -> io::Result<MergeReport> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let joined = !identities.columns().is_empty();
    let tmp_path = tmp_path(path);
    let mut writer = csv::Writer::from_path(&tmp_path).map_err(csv_err)?;

    let header: Vec<&str> = identities
        .columns()
        .iter()
        .map(String::as_str)
        .chain(fields.iter().copied())
        .collect();
    writer.write_record(&header).map_err(csv_err)?;

    let blank = vec![String::new(); identities.columns().len()];
    let mut report = MergeReport::default();
    let mut written = FxHashSet::default();
    for rec in records {
        if !written.insert(&rec.id) {
            continue;
        }
        let ident = match identities.get(&rec.id) {
            Some(values) => values,
            None => {
                if joined {
                    report.unmatched += 1;
                }
                &blank[..]
            }
        };
        let cells = project(&rec.id, &rec.result);
        if cells.len() != fields.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: projected {} cells for {} fields",
                    rec.id,
                    cells.len(),
                    fields.len()
                ),
            ));
        }
        writer
            .write_record(ident.iter().map(String::as_str).chain(cells.iter().map(String::as_str)))
            .map_err(csv_err)?;
        report.rows_written += 1;
    }
    if joined {
        report.missing = identities
            .order
            .iter()
            .filter(|id| !written.contains(id))
            .count();
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(report)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn csv_err(e: csv::Error) -> io::Error {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => io,
            other => io::Error::other(format!("{other:?}")),
        }
    } else {
        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
    }
}
