//! PubChem stage configuration

use std::path::PathBuf;
use std::time::Duration;

use chemharvest_core::JobConfig;

/// PUG-View compound record endpoint; the CID and `/JSON/` are appended.
pub const DEFAULT_BASE_URL: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug_view/data/compound";

/// Runtime configuration of the `download` and `parse` stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: String,
    /// Downloaded `cid_{cid}.json` records; the input of `parse`
    pub json_dir: PathBuf,
    /// First CID of the range download
    pub start_cid: u64,
    /// Last CID of the range download (inclusive)
    pub max_cid: Option<u64>,
    /// JSON array of CIDs; replaces the range when set
    pub predefined_cids_path: Option<PathBuf>,
    pub compounds_csv: PathBuf,
    pub descriptions_csv: PathBuf,
    /// Records parsed in parallel before their rows are written
    pub parse_batch_size: usize,
    pub download: JobConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            json_dir: PathBuf::from("./PubChem"),
            start_cid: 1,
            max_cid: None,
            predefined_cids_path: None,
            compounds_csv: PathBuf::from("compounds.csv"),
            descriptions_csv: PathBuf::from("descriptions.csv"),
            parse_batch_size: 1000,
            download: JobConfig {
                worker_count: 1,
                request_delay: Duration::from_secs(3),
                batch_size: 1000,
                batch_delay: Duration::from_secs(120),
                cooldown_time: Duration::from_secs(120),
                call_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        }
    }
}
