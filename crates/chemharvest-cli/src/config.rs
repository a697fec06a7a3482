//! Configuration loading from TOML files
//!
//! Every key is optional. A stage section (`[chemrxiv.gather]`,
//! `[pubchem.download]`, `[querygen.sync]`, ...) only overrides the pacing
//! fields it names; the rest keep the stage's own defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chemharvest_core::{BatchConfig, JobError, JobOverrides};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Environment variable read when `querygen.api_key` is unset
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Global configuration for chemharvest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chemrxiv: ChemRxivSection,
    pub pubchem: PubChemSection,
    pub querygen: QueryGenSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChemRxivSection {
    pub base_url: Option<String>,
    pub jsonl_path: Option<PathBuf>,
    pub csv_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub gather: JobOverrides,
    pub download: JobOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PubChemSection {
    pub base_url: Option<String>,
    pub json_dir: Option<PathBuf>,
    pub start_cid: Option<u64>,
    pub max_cid: Option<u64>,
    pub predefined_cids_path: Option<PathBuf>,
    pub compounds_csv: Option<PathBuf>,
    pub descriptions_csv: Option<PathBuf>,
    pub parse_batch_size: Option<usize>,
    pub download: JobOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryGenSection {
    pub data_path: Option<PathBuf>,
    pub root_dir: Option<PathBuf>,
    pub id_columns: Option<Vec<String>>,
    pub text_column: Option<String>,
    pub prompt_template: Option<String>,
    pub model: Option<String>,
    pub api_base: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
    pub max_completion_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub sample: SampleSection,
    pub sync: JobOverrides,
    pub batch: BatchSection,
    /// Pacing of the batch API calls themselves
    pub batch_calls: JobOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampleSection {
    pub sample_size: Option<usize>,
    pub sample_frac: Option<f64>,
    pub random_seed: Option<u64>,
    pub sample_ids_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub shard_size: Option<usize>,
    /// Seconds between two status polls
    pub poll_interval: Option<f64>,
    /// Extra request body fields of every batch request
    pub params: Map<String, Value>,
}

impl BatchSection {
    fn apply(&self, base: BatchConfig) -> Result<BatchConfig, JobError> {
        let poll_interval = match self.poll_interval {
            None => base.poll_interval,
            Some(v) => Duration::try_from_secs_f64(v)
                .map_err(|e| JobError::Config(format!("poll_interval = {v}: {e}")))?,
        };
        Ok(BatchConfig {
            shard_size: self.shard_size.unwrap_or(base.shard_size),
            poll_interval,
        })
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl ChemRxivSection {
    /// Adapter configuration with these settings layered over its defaults.
    pub fn resolve(&self) -> Result<chemharvest_chemrxiv::Config, JobError> {
        let base = chemharvest_chemrxiv::Config::default();
        let config = chemharvest_chemrxiv::Config {
            base_url: self.base_url.clone().unwrap_or(base.base_url),
            jsonl_path: self.jsonl_path.clone().unwrap_or(base.jsonl_path),
            csv_path: self.csv_path.clone().unwrap_or(base.csv_path),
            download_dir: self.download_dir.clone().unwrap_or(base.download_dir),
            gather: self.gather.apply(base.gather)?,
            download: self.download.apply(base.download)?,
        };
        config.gather.validate()?;
        config.download.validate()?;
        Ok(config)
    }
}

impl PubChemSection {
    pub fn resolve(&self) -> Result<chemharvest_pubchem::Config, JobError> {
        let base = chemharvest_pubchem::Config::default();
        let config = chemharvest_pubchem::Config {
            base_url: self.base_url.clone().unwrap_or(base.base_url),
            json_dir: self.json_dir.clone().unwrap_or(base.json_dir),
            start_cid: self.start_cid.unwrap_or(base.start_cid),
            max_cid: self.max_cid.or(base.max_cid),
            predefined_cids_path: self
                .predefined_cids_path
                .clone()
                .or(base.predefined_cids_path),
            compounds_csv: self.compounds_csv.clone().unwrap_or(base.compounds_csv),
            descriptions_csv: self.descriptions_csv.clone().unwrap_or(base.descriptions_csv),
            parse_batch_size: self.parse_batch_size.unwrap_or(base.parse_batch_size),
            download: self.download.apply(base.download)?,
        };
        if config.parse_batch_size == 0 {
            return Err(JobError::Config("parse_batch_size must be at least 1".into()));
        }
        config.download.validate()?;
        Ok(config)
    }
}

impl QueryGenSection {
    pub fn resolve(&self) -> Result<chemharvest_querygen::Config, JobError> {
        let base = chemharvest_querygen::Config::default();
        let sample = chemharvest_querygen::SampleConfig {
            sample_size: self.sample.sample_size.or(base.sample.sample_size),
            sample_frac: self.sample.sample_frac.or(base.sample.sample_frac),
            random_seed: self.sample.random_seed.unwrap_or(base.sample.random_seed),
            sample_ids_file: self
                .sample
                .sample_ids_file
                .clone()
                .unwrap_or(base.sample.sample_ids_file),
        };
        let config = chemharvest_querygen::Config {
            data_path: self.data_path.clone().unwrap_or(base.data_path),
            root_dir: self.root_dir.clone().unwrap_or(base.root_dir),
            id_columns: self.id_columns.clone().unwrap_or(base.id_columns),
            text_column: self.text_column.clone().unwrap_or(base.text_column),
            prompt_template: self.prompt_template.clone().unwrap_or(base.prompt_template),
            model: self.model.clone().unwrap_or(base.model),
            api_base: self.api_base.clone().unwrap_or(base.api_base),
            api_key: self
                .api_key
                .clone()
                .or_else(|| std::env::var(API_KEY_ENV).ok()),
            max_completion_tokens: self
                .max_completion_tokens
                .unwrap_or(base.max_completion_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            sample,
            sync: self.sync.apply(base.sync)?,
            batch: self.batch.apply(base.batch)?,
            batch_calls: self.batch_calls.apply(base.batch_calls)?,
            batch_params: self.batch.params.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./chemharvest.toml (current directory)
    /// 2. the platform config dir, e.g. ~/.config/chemharvest/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("chemharvest.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "chemharvest") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
