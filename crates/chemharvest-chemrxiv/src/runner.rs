//! `gather` and `download` stages

use anyhow::{Context, Result};
use chemharvest_core::{
    Dispatcher, FileSink, IdentityTable, ItemId, JobSummary, JsonlSink, Ledger, Paginated,
    ProgressContext, Shutdown, WorkItem, fmt_num, is_valid_pdf, merge_csv, read_records,
};
use serde_json::Value;

use crate::api::{self, ChemRxivApi};
use crate::config::Config;
use crate::metadata::{self, CSV_COLUMNS};

/// Page through the listing, persist every new hit to the JSONL store, then
/// rebuild the metadata CSV from it.
pub fn gather(config: &Config, shutdown: &Shutdown, progress: &ProgressContext) -> Result<JobSummary> {
    let api = ChemRxivApi::new(&config.base_url, config.gather.call_timeout);
    let total = match api.total_count() {
        Ok(n) => Some(n),
        Err(e) => {
            log::warn!("could not read preprint count: {e}");
            None
        }
    };

    let ledger = Ledger::from_records(&config.jsonl_path)
        .with_context(|| format!("failed to read {}", config.jsonl_path.display()))?;
    let sink = JsonlSink::<Value>::open(&config.jsonl_path)
        .with_context(|| format!("failed to open {}", config.jsonl_path.display()))?;
    log::info!(
        "ChemRxiv: {} preprints listed, {} already gathered",
        total.map_or_else(|| "?".to_string(), |n| fmt_num(n as usize)),
        fmt_num(ledger.len())
    );

    let pending = total.map(|n| n.saturating_sub(ledger.len() as u64));
    let dispatcher = Dispatcher::new("chemrxiv-gather", config.gather.clone(), shutdown.clone())?
        .with_progress(progress.job_bar("gather", pending));
    let listing = Paginated::new(
        api,
        dispatcher.retry_policy(),
        dispatcher.clock(),
        shutdown.clone(),
    );

    let summary = dispatcher.run(listing, &ledger, &sink, |item| Ok(item.payload.clone()))?;
    drop(sink);

    write_metadata_csv(config)?;
    Ok(summary)
}

/// Rebuild `chemrxiv_metadata.csv` from the JSONL store.
pub fn write_metadata_csv(config: &Config) -> Result<()> {
    let records = read_records::<Value>(&config.jsonl_path)
        .with_context(|| format!("failed to read {}", config.jsonl_path.display()))?;
    let report = merge_csv(
        &config.csv_path,
        &records,
        &IdentityTable::default(),
        CSV_COLUMNS,
        metadata::project,
    )
    .with_context(|| format!("failed to write {}", config.csv_path.display()))?;
    report.log(&config.csv_path);
    Ok(())
}

/// Download the original PDF of every gathered preprint not yet on disk.
pub fn download(config: &Config, shutdown: &Shutdown, progress: &ProgressContext) -> Result<JobSummary> {
    let candidates = pdf_candidates(config)?;
    let ledger = Ledger::from_files(
        &config.download_dir,
        "*.pdf",
        |name| name.strip_suffix(".pdf").map(ItemId::from),
        is_valid_pdf,
    )
    .with_context(|| format!("failed to scan {}", config.download_dir.display()))?;
    let sink = FileSink::new(&config.download_dir, |id| {
        metadata::safe_filename(&format!("{id}.pdf"))
    })
    .with_context(|| format!("failed to create {}", config.download_dir.display()))?;

    let pending = candidates
        .iter()
        .filter(|c| !ledger.is_complete(&c.id))
        .count();
    log::info!(
        "ChemRxiv: {} PDFs listed, {} to download",
        fmt_num(candidates.len()),
        fmt_num(pending)
    );

    let timeout = config.download.call_timeout;
    let dispatcher = Dispatcher::new("chemrxiv-download", config.download.clone(), shutdown.clone())?
        .with_progress(progress.job_bar("download", Some(pending as u64)));
    let summary = dispatcher.run(
        candidates.into_iter().map(Ok),
        &ledger,
        &sink,
        |item| api::download_pdf(&item.payload, timeout),
    )?;
    Ok(summary)
}

/// Gathered preprints that carry a PDF URL, keyed by preprint id.
fn pdf_candidates(config: &Config) -> Result<Vec<WorkItem<String>>> {
    let records = read_records::<Value>(&config.jsonl_path)
        .with_context(|| format!("failed to read {}", config.jsonl_path.display()))?;
    if records.is_empty() {
        log::warn!(
            "{} holds no preprints; run `chemrxiv gather` first",
            config.jsonl_path.display()
        );
    }
    Ok(records
        .into_iter()
        .filter_map(|rec| {
            let url = metadata::pdf_url(&rec.result)?.to_string();
            Some(WorkItem::new(rec.id, url))
        })
        .collect())
}
