//! ChemRxiv stage configuration

use std::path::PathBuf;
use std::time::Duration;

use chemharvest_core::JobConfig;

/// Public Engage API root
pub const DEFAULT_BASE_URL: &str = "https://chemrxiv.org/engage/chemrxiv/public-api/v1";

/// Runtime configuration of the `gather` and `download` stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: String,
    /// Raw listing hits, one per line (the gather sink)
    pub jsonl_path: PathBuf,
    /// Flattened metadata table
    pub csv_path: PathBuf,
    /// Downloaded PDFs
    pub download_dir: PathBuf,
    pub gather: JobConfig,
    pub download: JobConfig,
}

/// Pacing both stages start from
pub fn stage_defaults() -> JobConfig {
    JobConfig {
        worker_count: 1,
        request_delay: Duration::from_secs(1),
        batch_size: 1000,
        batch_delay: Duration::from_secs(120),
        cooldown_time: Duration::from_secs(120),
        ..Default::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            jsonl_path: PathBuf::from("./ChemRxiv/chemrxiv_metadata.jsonl"),
            csv_path: PathBuf::from("./ChemRxiv/chemrxiv_metadata.csv"),
            download_dir: PathBuf::from("./ChemRxiv/papers"),
            gather: stage_defaults(),
            download: stage_defaults(),
        }
    }
}
