//! `chemharvest chemrxiv` - preprint metadata and PDFs

use anyhow::Result;
use chemharvest_core::{ProgressContext, Shutdown};
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct ChemRxivArgs {
    #[command(subcommand)]
    pub stage: ChemRxivStage,
}

#[derive(Subcommand, Debug)]
pub enum ChemRxivStage {
    /// Page through the public listing into the metadata JSONL and CSV
    Gather,
    /// Download the PDF of every gathered preprint
    Download,
}

pub fn run(
    args: ChemRxivArgs,
    config: &Config,
    shutdown: &Shutdown,
    progress: &ProgressContext,
) -> Result<u8> {
    let chemrxiv = config.chemrxiv.resolve()?;
    let summary = match args.stage {
        ChemRxivStage::Gather => {
            log::info!("Gathering ChemRxiv metadata from {}", chemrxiv.base_url);
            log::info!("  Output: {}", chemrxiv.jsonl_path.display());
            chemharvest_chemrxiv::gather(&chemrxiv, shutdown, progress)?
        }
        ChemRxivStage::Download => {
            log::info!("Downloading ChemRxiv PDFs");
            log::info!("  Output: {}", chemrxiv.download_dir.display());
            chemharvest_chemrxiv::download(&chemrxiv, shutdown, progress)?
        }
    };
    Ok(crate::report(&summary, progress))
}
