//! `download` and `parse` stages

use anyhow::{Context, Result};
use chemharvest_core::{
    Dispatcher, FileSink, JobSummary, Ledger, ProgressContext, Shutdown, fmt_num, is_valid_json,
};

use crate::config::Config;
use crate::download::{cid_of, cid_source, fetch_compound, file_name};
use crate::parse::{ParseSummary, parse_dir};

/// Download every configured CID whose record is not yet on disk.
pub fn download(config: &Config, shutdown: &Shutdown, progress: &ProgressContext) -> Result<JobSummary> {
    let (cids, total) = cid_source(config)?;
    let dispatcher = Dispatcher::new("pubchem-download", config.download.clone(), shutdown.clone())?;

    let ledger = Ledger::from_files(&config.json_dir, "cid_*.json", cid_of, is_valid_json)
        .with_context(|| format!("failed to scan {}", config.json_dir.display()))?;
    let sink = FileSink::new(&config.json_dir, file_name)
        .with_context(|| format!("failed to create {}", config.json_dir.display()))?;
    log::info!(
        "PubChem: {} CIDs requested, {} records on disk",
        fmt_num(total as usize),
        fmt_num(ledger.len())
    );

    let dispatcher = dispatcher.with_progress(progress.job_bar("download", Some(total)));
    let base_url = config.base_url.as_str();
    let timeout = config.download.call_timeout;
    let summary = dispatcher.run(cids, &ledger, &sink, |item| {
        fetch_compound(base_url, item.payload, timeout)
    })?;
    Ok(summary)
}

/// Rebuild `compounds.csv` and `descriptions.csv` from the downloaded records.
pub fn parse(config: &Config, progress: &ProgressContext) -> Result<ParseSummary> {
    let summary = parse_dir(config, progress)?;
    summary.log();
    Ok(summary)
}
