//! `chemharvest querygen` - LLM query generation

use anyhow::Result;
use chemharvest_core::{ProgressContext, Shutdown};
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct QueryGenArgs {
    #[command(subcommand)]
    pub stage: QueryGenStage,
}

#[derive(Subcommand, Debug)]
pub enum QueryGenStage {
    /// Generate through the synchronous chat-completions API
    Run,
    /// Submit pending rows as batch jobs
    Submit,
    /// Poll submitted batch jobs and collect their results
    Collect {
        /// Collect finished batches only, without waiting for running ones
        #[arg(long)]
        no_wait: bool,
    },
    /// Rebuild results.csv from the result files
    Merge,
}

pub fn run(
    args: QueryGenArgs,
    config: &Config,
    shutdown: &Shutdown,
    progress: &ProgressContext,
) -> Result<u8> {
    let querygen = config.querygen.resolve()?;
    if querygen.api_key.is_none() && !matches!(args.stage, QueryGenStage::Merge) {
        log::warn!("no API key configured, requests are sent unauthenticated");
    }
    let summary = match args.stage {
        QueryGenStage::Run => {
            log::info!("Generating queries with {}", querygen.model);
            log::info!("  Input: {}", querygen.data_path.display());
            chemharvest_querygen::run(&querygen, shutdown, progress)?
        }
        QueryGenStage::Submit => chemharvest_querygen::submit(&querygen, shutdown)?,
        QueryGenStage::Collect { no_wait } => {
            chemharvest_querygen::collect(&querygen, shutdown, !no_wait)?
        }
        QueryGenStage::Merge => {
            let report = chemharvest_querygen::merge(&querygen)?;
            log::info!(
                "{} rows merged, {} still without a query",
                report.rows_written,
                report.missing
            );
            return Ok(0);
        }
    };
    Ok(crate::report(&summary, progress))
}
