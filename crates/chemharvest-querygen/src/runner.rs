//! `run`, `submit`, `collect` and `merge` stages

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chemharvest_core::{
    BatchRunner, CompletionRecord, Dispatcher, HandleStore, JobError, JobSummary, JsonlSink, Ledger,
    MergeReport, ProgressContext, Shutdown, SystemClock, WorkItem, from_rows, merge_csv,
    read_records,
};

use crate::batch::OpenAiBatch;
use crate::config::Config;
use crate::generation::{ChatClient, Generation, render_prompt};
use crate::input::{self, Row};
use crate::sample;

/// Output columns after the identity columns
pub const RESULT_FIELDS: &[&str] = &["generated_query"];

/// Validated configuration, sampled input rows.
fn prepare(config: &Config) -> Result<Vec<Row>> {
    config.validate()?;
    std::fs::create_dir_all(&config.root_dir)
        .with_context(|| format!("failed to create {}", config.root_dir.display()))?;
    let rows = input::load_rows(config)?;
    sample::apply(&config.sample, &config.sample_ids_path(), rows)
}

fn records(path: &Path) -> Result<Vec<CompletionRecord<Generation>>> {
    read_records(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Ids already generated by either mode
fn completed(config: &Config) -> Result<Ledger> {
    let sync = records(&config.cache_path())?;
    let batch = records(&config.batch_results_path())?;
    Ok(Ledger::from_ids(
        sync.into_iter().chain(batch).map(|r| r.id),
    ))
}

/// Rows as work items whose payload is the rendered prompt
fn prompts(
    config: &Config,
    rows: Vec<Row>,
) -> impl Iterator<Item = Result<WorkItem<String>, JobError>> + Send {
    let template = config.prompt_template.clone();
    from_rows(rows, |r: &Row| r.id.clone()).map(move |item| {
        item.map(|row| WorkItem {
            payload: render_prompt(&template, &row.payload.text),
            id: row.id,
        })
    })
}

/// Generate a question for every pending row through the synchronous API,
/// then rebuild `results.csv`.
pub fn run(config: &Config, shutdown: &Shutdown, progress: &ProgressContext) -> Result<JobSummary> {
    let rows = prepare(config)?;
    let ledger = completed(config)?;
    let sink = JsonlSink::<Generation>::open(&config.cache_path())
        .with_context(|| format!("failed to open {}", config.cache_path().display()))?;

    let pending = rows.iter().filter(|r| !ledger.is_complete(&r.id)).count();
    let client = ChatClient::new(config);
    let dispatcher = Dispatcher::new("querygen", config.sync.clone(), shutdown.clone())?
        .with_progress(progress.job_bar("querygen", Some(pending as u64)));
    let summary = dispatcher.run(prompts(config, rows.clone()), &ledger, &sink, |item| {
        client.complete(&item.payload)
    })?;
    drop(sink);

    merge_with(config, &rows)?;
    Ok(summary)
}

fn backend(config: &Config) -> OpenAiBatch {
    OpenAiBatch::new(
        ChatClient::new(config),
        config.requests_dir(),
        config.batch_params.clone(),
        config.batch_calls.call_timeout,
    )
}

fn batch_runner(config: &Config, shutdown: &Shutdown) -> Result<BatchRunner> {
    Ok(BatchRunner::new(
        "querygen-batch",
        config.batch.clone(),
        config.batch_calls.retry_policy(),
        Arc::new(SystemClock),
        shutdown.clone(),
    )?)
}

/// Shard every pending row into batch request files and submit them.
pub fn submit(config: &Config, shutdown: &Shutdown) -> Result<JobSummary> {
    let rows = prepare(config)?;
    let ledger = completed(config)?;
    let mut store = HandleStore::open(&config.root_dir)?;
    let summary = batch_runner(config, shutdown)?.submit(
        prompts(config, rows),
        &ledger,
        &backend(config),
        &mut store,
    )?;
    Ok(summary)
}

/// Poll submitted batches, sink the responses of finished ones and rebuild
/// `results.csv`. Without `wait` only already finished batches are collected.
pub fn collect(config: &Config, shutdown: &Shutdown, wait: bool) -> Result<JobSummary> {
    config.validate()?;
    let ledger = completed(config)?;
    let mut store = HandleStore::open(&config.root_dir)?;
    let sink = JsonlSink::<Generation>::open(&config.batch_results_path())
        .with_context(|| format!("failed to open {}", config.batch_results_path().display()))?;
    let summary =
        batch_runner(config, shutdown)?.collect(&backend(config), &ledger, &sink, &mut store, wait)?;
    drop(sink);

    merge(config)?;
    Ok(summary)
}

/// Rebuild `results.csv` from both result sinks.
pub fn merge(config: &Config) -> Result<MergeReport> {
    let rows = prepare(config)?;
    merge_with(config, &rows)
}

fn merge_with(config: &Config, rows: &[Row]) -> Result<MergeReport> {
    let mut all = records(&config.cache_path())?;
    all.extend(records(&config.batch_results_path())?);
    let identities = input::identity_table(config, rows);
    let path = config.results_csv_path();
    let report = merge_csv(&path, &all, &identities, RESULT_FIELDS, |_, g: &Generation| {
        vec![g.question.clone()]
    })
    .with_context(|| format!("failed to write {}", path.display()))?;
    report.log(&path);
    Ok(report)
}
