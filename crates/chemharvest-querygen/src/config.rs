//! Query generation configuration

use std::path::PathBuf;
use std::time::Duration;

use chemharvest_core::{BatchConfig, JobConfig, JobError};
use serde_json::{Map, Value};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Placeholder the row text is substituted for
pub const TEXT_PLACEHOLDER: &str = "{text}";

/// Seeded row sampling. Inactive unless `sample_size` or `sample_frac` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConfig {
    /// Exact number of rows (wins over `sample_frac`)
    pub sample_size: Option<usize>,
    /// Fraction of rows in (0, 1]
    pub sample_frac: Option<f64>,
    pub random_seed: u64,
    /// File in `root_dir` holding the drawn ids
    pub sample_ids_file: String,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sample_size: None,
            sample_frac: None,
            random_seed: 42,
            sample_ids_file: "sampled_ids.json".to_string(),
        }
    }
}

impl SampleConfig {
    pub fn is_active(&self) -> bool {
        self.sample_size.is_some() || self.sample_frac.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Input CSV with one row per text
    pub data_path: PathBuf,
    /// Holds every piece of job state: caches, request shards, handles, results
    pub root_dir: PathBuf,
    pub id_columns: Vec<String>,
    pub text_column: String,
    pub prompt_template: String,
    pub model: String,
    /// OpenAI-compatible API root
    pub api_base: String,
    pub api_key: Option<String>,
    pub max_completion_tokens: u32,
    pub temperature: f64,
    pub sample: SampleConfig,
    /// Synchronous `run` pacing
    pub sync: JobConfig,
    pub batch: BatchConfig,
    /// Retry and timeout of the batch API calls (upload, create, poll, download)
    pub batch_calls: JobConfig,
    /// Extra request body fields for batch requests (e.g. `reasoning_effort`)
    pub batch_params: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data.csv"),
            root_dir: PathBuf::from("./querygen"),
            id_columns: vec!["id".to_string()],
            text_column: "text".to_string(),
            prompt_template: TEXT_PLACEHOLDER.to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            max_completion_tokens: 1024,
            temperature: 0.0,
            sample: SampleConfig::default(),
            sync: JobConfig {
                worker_count: 4,
                request_delay: Duration::from_millis(500),
                cooldown_time: Duration::from_secs(60),
                call_timeout: Duration::from_secs(300),
                ..Default::default()
            },
            batch: BatchConfig::default(),
            batch_calls: JobConfig {
                cooldown_time: Duration::from_secs(60),
                max_retries: Some(5),
                call_timeout: Duration::from_secs(600),
                ..Default::default()
            },
            batch_params: Map::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id_columns.is_empty() {
            return Err(JobError::Config("id_columns must name at least one column".into()));
        }
        if !self.prompt_template.contains(TEXT_PLACEHOLDER) {
            return Err(JobError::Config(format!(
                "prompt_template must contain {TEXT_PLACEHOLDER}"
            )));
        }
        if let Some(frac) = self.sample.sample_frac {
            if !(frac > 0.0 && frac <= 1.0) {
                return Err(JobError::Config(format!(
                    "sample_frac must be in (0, 1], got {frac}"
                )));
            }
        }
        if self.sample.sample_size == Some(0) {
            return Err(JobError::Config("sample_size must be at least 1".into()));
        }
        self.sync.validate()?;
        self.batch_calls.validate()?;
        self.batch.validate()
    }

    /// Synchronous completion cache
    pub fn cache_path(&self) -> PathBuf {
        self.root_dir.join("cache_result.jsonl")
    }

    /// Collected batch responses
    pub fn batch_results_path(&self) -> PathBuf {
        self.root_dir.join("batch_results.jsonl")
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root_dir.join("requests")
    }

    pub fn results_csv_path(&self) -> PathBuf {
        self.root_dir.join("results.csv")
    }

    pub fn sample_ids_path(&self) -> PathBuf {
        self.root_dir.join(&self.sample.sample_ids_file)
    }
}
