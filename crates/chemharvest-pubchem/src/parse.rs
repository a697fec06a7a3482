//! PUG-View record parsing into `compounds.csv` and `descriptions.csv`

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chemharvest_core::{ProgressContext, fmt_num};
use rayon::prelude::*;
use serde_json::Value;

use crate::config::Config;
use crate::download::cid_of;

pub const COMPOUND_COLUMNS: [&str; 7] = [
    "CID",
    "Title",
    "MolecularFormula",
    "IUPACName",
    "InChI",
    "SMILES",
    "Synonyms",
];

pub const DESCRIPTION_COLUMNS: [&str; 8] = [
    "CID",
    "Title",
    "Description",
    "ReferenceNumber",
    "SourceName",
    "SourceID",
    "ReferenceDescription",
    "URL",
];

/// Descriptions from this reference are boilerplate and dropped.
const EXCLUDED_REFERENCE: i64 = 111;

const MIN_SYNONYM_CHARS: usize = 3;
const MAX_SYNONYM_CHARS: usize = 105;

/// Why a record file yields no rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A section every compound record carries is absent
    MissingSection(&'static str),
    /// A required field is absent or has the wrong type
    MissingField(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSection(s) => write!(f, "missing section '{s}'"),
            Self::MissingField(s) => write!(f, "missing field '{s}'"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compound {
    pub cid: u64,
    pub title: String,
    pub molecular_formula: String,
    pub iupac_name: Option<String>,
    pub inchi: Option<String>,
    pub smiles: Option<String>,
    pub synonyms: Vec<String>,
}

impl Compound {
    fn row(&self) -> [String; 7] {
        [
            self.cid.to_string(),
            self.title.clone(),
            self.molecular_formula.clone(),
            self.iupac_name.clone().unwrap_or_default(),
            self.inchi.clone().unwrap_or_default(),
            self.smiles.clone().unwrap_or_default(),
            serde_json::to_string(&self.synonyms).unwrap_or_default(),
        ]
    }
}

/// One record description with the reference it cites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub reference_number: i64,
    pub text: String,
    pub source_name: String,
    pub source_id: String,
    pub reference_description: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub compound: Compound,
    pub descriptions: Vec<Description>,
}

impl ParsedRecord {
    fn description_rows(&self) -> impl Iterator<Item = [String; 8]> + '_ {
        self.descriptions.iter().map(|d| {
            [
                self.compound.cid.to_string(),
                self.compound.title.clone(),
                d.text.clone(),
                d.reference_number.to_string(),
                d.source_name.clone(),
                d.source_id.clone(),
                d.reference_description.clone(),
                d.url.clone(),
            ]
        })
    }
}

/// A synonym worth keeping: no two consecutive digits (registry numbers,
/// catalogue codes) and at least one ASCII letter.
pub fn is_textual(s: &str) -> bool {
    let digit_pair = s
        .chars()
        .zip(s.chars().skip(1))
        .any(|(a, b)| a.is_numeric() && b.is_numeric());
    !digit_pair && s.chars().any(|c| c.is_ascii_alphabetic())
}

fn section<'a>(sections: &'a Value, heading: &str) -> Option<&'a Value> {
    sections
        .as_array()?
        .iter()
        .find(|s| s.get("TOCHeading").and_then(Value::as_str) == Some(heading))
}

/// First markup string of an `Information` entry
fn markup_string(info: &Value) -> Option<String> {
    info.pointer("/Value/StringWithMarkup/0/String")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Scalar as text; strings unquoted, null and missing empty
fn text(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn descriptors(names: &Value) -> Result<(Option<String>, Option<String>, Option<String>), ParseError> {
    let computed = section(&names["Section"], "Computed Descriptors")
        .ok_or(ParseError::MissingSection("Computed Descriptors"))?;
    let (mut iupac, mut inchi, mut smiles) = (None, None, None);
    for item in computed["Section"].as_array().into_iter().flatten() {
        let value = || markup_string(&item["Information"][0]);
        match item.get("TOCHeading").and_then(Value::as_str) {
            Some("IUPAC Name") => iupac = value(),
            Some("InChI") => inchi = value(),
            Some("SMILES") => smiles = value(),
            _ => {}
        }
    }
    Ok((iupac, inchi, smiles))
}

fn synonyms(names: &Value) -> Vec<String> {
    section(&names["Section"], "Synonyms")
        .and_then(|s| section(&s["Section"], "Depositor-Supplied Synonyms"))
        .and_then(|s| s.pointer("/Information/0/Value/StringWithMarkup"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("String").and_then(Value::as_str))
        .filter(|s| is_textual(s))
        .filter(|s| (MIN_SYNONYM_CHARS..=MAX_SYNONYM_CHARS).contains(&s.chars().count()))
        .map(str::to_string)
        .collect()
}

/// Record descriptions in first-seen reference order; a later entry for the
/// same reference replaces the earlier text.
fn descriptions(record: &Value, names: &Value) -> Vec<Description> {
    let Some(record_desc) = section(&names["Section"], "Record Description") else {
        return Vec::new();
    };
    let references = record["Reference"].as_array();
    let reference = |n: i64| {
        references.and_then(|refs| {
            refs.iter()
                .find(|r| r.get("ReferenceNumber").and_then(Value::as_i64) == Some(n))
        })
    };

    let mut out: Vec<Description> = Vec::new();
    for info in record_desc["Information"].as_array().into_iter().flatten() {
        let Some(number) = info.get("ReferenceNumber").and_then(Value::as_i64) else {
            continue;
        };
        if number == EXCLUDED_REFERENCE {
            continue;
        }
        let Some(desc_text) = markup_string(info) else {
            continue;
        };
        if let Some(existing) = out.iter_mut().find(|d| d.reference_number == number) {
            existing.text = desc_text;
            continue;
        }
        let r = reference(number);
        if r.is_none() {
            log::debug!("description cites unknown reference {number}");
        }
        out.push(Description {
            reference_number: number,
            text: desc_text,
            source_name: text(r.and_then(|r| r.get("SourceName"))),
            source_id: text(r.and_then(|r| r.get("SourceID"))),
            reference_description: text(r.and_then(|r| r.get("Description"))),
            url: text(r.and_then(|r| r.get("URL"))),
        });
    }
    out
}

/// Extract the compound row and its descriptions from one PUG-View record.
pub fn parse_record(value: &Value) -> Result<ParsedRecord, ParseError> {
    let record = value.get("Record").ok_or(ParseError::MissingField("Record"))?;
    let cid = record
        .get("RecordNumber")
        .and_then(Value::as_u64)
        .ok_or(ParseError::MissingField("RecordNumber"))?;
    let title = text(record.get("RecordTitle"));
    let names = section(&record["Section"], "Names and Identifiers")
        .ok_or(ParseError::MissingSection("Names and Identifiers"))?;
    let molecular_formula = section(&names["Section"], "Molecular Formula")
        .and_then(|s| markup_string(&s["Information"][0]))
        .ok_or(ParseError::MissingSection("Molecular Formula"))?;
    let (iupac_name, inchi, smiles) = descriptors(names)?;

    Ok(ParsedRecord {
        compound: Compound {
            cid,
            title,
            molecular_formula,
            iupac_name,
            inchi,
            smiles,
            synonyms: synonyms(names),
        },
        descriptions: descriptions(record, names),
    })
}

fn read_record(path: &Path) -> Result<ParsedRecord> {
    let file = File::open(path)?;
    let value: Value = serde_json::from_reader(BufReader::new(file))?;
    Ok(parse_record(&value)?)
}

/// `cid_*.json` files of a directory, in ascending CID order.
pub fn record_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let pattern = dir.join("cid_*.json");
    let paths = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut files: Vec<(u64, PathBuf)> = paths
        .filter_map(Result::ok)
        .filter_map(|p| {
            let cid = p
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(cid_of)?
                .as_u64()?;
            Some((cid, p))
        })
        .collect();
    files.sort_unstable_by_key(|(cid, _)| *cid);
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Outcome of a parse run
#[derive(Debug, Clone, Default)]
pub struct ParseSummary {
    pub files: usize,
    pub compounds: usize,
    pub descriptions: usize,
    /// Unreadable files and records lacking required sections
    pub skipped: usize,
    pub elapsed: Duration,
}

impl ParseSummary {
    pub fn log(&self) {
        log::info!(
            "parse: {} files -> {} compounds, {} descriptions ({} skipped) in {:.1}s",
            fmt_num(self.files),
            fmt_num(self.compounds),
            fmt_num(self.descriptions),
            fmt_num(self.skipped),
            self.elapsed.as_secs_f64()
        );
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn csv_writer(path: &Path) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    csv::Writer::from_path(tmp_path(path))
        .with_context(|| format!("failed to create {}", path.display()))
}

fn finish(writer: csv::Writer<File>, path: &Path) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush {}: {}", path.display(), e.error()))?;
    file.sync_all()?;
    std::fs::rename(tmp_path(path), path)
        .with_context(|| format!("failed to finalize {}", path.display()))
}

/// Rebuild both tables from every downloaded record.
///
/// Records are parsed in parallel, `parse_batch_size` at a time, and written
/// in CID order. A record that cannot be parsed is skipped with a warning.
pub fn parse_dir(config: &Config, progress: &ProgressContext) -> Result<ParseSummary> {
    let start = Instant::now();
    let files = record_files(&config.json_dir)
        .with_context(|| format!("failed to list {}", config.json_dir.display()))?;
    log::info!(
        "parse: {} record files in {}",
        fmt_num(files.len()),
        config.json_dir.display()
    );

    let mut compounds = csv_writer(&config.compounds_csv)?;
    let mut descriptions = csv_writer(&config.descriptions_csv)?;
    compounds.write_record(COMPOUND_COLUMNS)?;
    descriptions.write_record(DESCRIPTION_COLUMNS)?;

    let bar = progress.job_bar("parse", Some(files.len() as u64));
    let mut summary = ParseSummary {
        files: files.len(),
        ..Default::default()
    };
    for chunk in files.chunks(config.parse_batch_size.max(1)) {
        let parsed: Vec<Result<ParsedRecord>> = chunk.par_iter().map(|p| read_record(p)).collect();
        for (path, result) in chunk.iter().zip(parsed) {
            match result {
                Ok(record) => {
                    compounds.write_record(record.compound.row())?;
                    for row in record.description_rows() {
                        descriptions.write_record(row)?;
                    }
                    summary.compounds += 1;
                    summary.descriptions += record.descriptions.len();
                }
                Err(e) => {
                    summary.skipped += 1;
                    log::warn!("{}: skipped: {e:#}", path.display());
                }
            }
        }
        bar.inc(chunk.len() as u64);
    }
    bar.finish_and_clear();

    finish(compounds, &config.compounds_csv)?;
    finish(descriptions, &config.descriptions_csv)?;
    summary.elapsed = start.elapsed();
    Ok(summary)
}
