//! `chemharvest pubchem` - compound records

use anyhow::Result;
use chemharvest_core::{ProgressContext, Shutdown};
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct PubChemArgs {
    #[command(subcommand)]
    pub stage: PubChemStage,
}

#[derive(Subcommand, Debug)]
pub enum PubChemStage {
    /// Download one PUG-View record per CID
    Download,
    /// Flatten downloaded records into the compounds and descriptions CSVs
    Parse,
}

pub fn run(
    args: PubChemArgs,
    config: &Config,
    shutdown: &Shutdown,
    progress: &ProgressContext,
) -> Result<u8> {
    let pubchem = config.pubchem.resolve()?;
    match args.stage {
        PubChemStage::Download => {
            log::info!("Downloading PubChem records");
            log::info!("  Output: {}", pubchem.json_dir.display());
            let summary = chemharvest_pubchem::download(&pubchem, shutdown, progress)?;
            Ok(crate::report(&summary, progress))
        }
        PubChemStage::Parse => {
            log::info!("Parsing PubChem records in {}", pubchem.json_dir.display());
            let summary = chemharvest_pubchem::parse(&pubchem, progress)?;
            if summary.skipped > 0 {
                log::warn!(
                    "{} records skipped, see the warnings above",
                    summary.skipped
                );
            }
            Ok(0)
        }
    }
}
