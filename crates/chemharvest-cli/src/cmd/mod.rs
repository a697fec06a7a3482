//! Subcommands

pub mod chemrxiv;
pub mod pubchem;
pub mod querygen;

use anyhow::Result;
use chemharvest_core::{BatchConfig, JobConfig};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use crate::config::Config;

fn pacing(job: &JobConfig) -> String {
    let retries = job
        .max_retries
        .map_or_else(|| "unbounded".to_string(), |n| n.to_string());
    let mut out = format!(
        "{} worker(s), {:.1}s apart, cooldown {:.0}s, retries {retries}",
        job.worker_count,
        job.request_delay.as_secs_f64(),
        job.cooldown_time.as_secs_f64(),
    );
    if job.batch_size > 0 {
        out.push_str(&format!(
            ", pause {:.0}s every {}",
            job.batch_delay.as_secs_f64(),
            job.batch_size
        ));
    }
    out
}

fn batching(batch: &BatchConfig) -> String {
    format!(
        "{} items per shard, poll every {:.0}s",
        batch.shard_size,
        batch.poll_interval.as_secs_f64()
    )
}

fn section(table: &mut Table, title: &str) {
    table.add_row(vec![
        Cell::new(title).fg(Color::Green),
        Cell::new(""),
    ]);
}

/// `chemharvest config`: print the effective configuration of every stage.
pub fn show_config(config: &Config) -> Result<()> {
    let chemrxiv = config.chemrxiv.resolve()?;
    let pubchem = config.pubchem.resolve()?;
    let querygen = config.querygen.resolve()?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    section(&mut table, "chemrxiv");
    table.add_row(vec!["Base URL", &chemrxiv.base_url]);
    table.add_row(vec!["Metadata JSONL", &chemrxiv.jsonl_path.display().to_string()]);
    table.add_row(vec!["Metadata CSV", &chemrxiv.csv_path.display().to_string()]);
    table.add_row(vec!["PDF directory", &chemrxiv.download_dir.display().to_string()]);
    table.add_row(vec!["Gather", &pacing(&chemrxiv.gather)]);
    table.add_row(vec!["Download", &pacing(&chemrxiv.download)]);

    section(&mut table, "pubchem");
    table.add_row(vec!["Base URL", &pubchem.base_url]);
    let cids = match (&pubchem.predefined_cids_path, pubchem.max_cid) {
        (Some(path), _) => format!("listed in {}", path.display()),
        (None, Some(max)) => format!("{}..={max}", pubchem.start_cid),
        (None, None) => "max_cid not set".to_string(),
    };
    table.add_row(vec!["CIDs", &cids]);
    table.add_row(vec!["JSON directory", &pubchem.json_dir.display().to_string()]);
    table.add_row(vec!["Compounds CSV", &pubchem.compounds_csv.display().to_string()]);
    table.add_row(vec![
        "Descriptions CSV",
        &pubchem.descriptions_csv.display().to_string(),
    ]);
    table.add_row(vec!["Parse batch", &pubchem.parse_batch_size.to_string()]);
    table.add_row(vec!["Download", &pacing(&pubchem.download)]);

    section(&mut table, "querygen");
    table.add_row(vec!["Input CSV", &querygen.data_path.display().to_string()]);
    table.add_row(vec!["Root directory", &querygen.root_dir.display().to_string()]);
    table.add_row(vec!["Id columns", &querygen.id_columns.join(", ")]);
    table.add_row(vec!["Text column", &querygen.text_column]);
    table.add_row(vec!["Model", &querygen.model]);
    table.add_row(vec!["API base", &querygen.api_base]);
    table.add_row(vec![
        "API key",
        if querygen.api_key.is_some() {
            "configured"
        } else {
            "not set"
        },
    ]);
    let sample = match (querygen.sample.sample_size, querygen.sample.sample_frac) {
        (Some(n), _) => format!("{n} rows, seed {}", querygen.sample.random_seed),
        (None, Some(f)) => format!("{f} of rows, seed {}", querygen.sample.random_seed),
        (None, None) => "all rows".to_string(),
    };
    table.add_row(vec!["Sample", &sample]);
    table.add_row(vec!["Sync", &pacing(&querygen.sync)]);
    table.add_row(vec!["Batch", &batching(&querygen.batch)]);
    if !querygen.batch_params.is_empty() {
        let params = serde_json::Value::Object(querygen.batch_params.clone());
        table.add_row(vec!["Batch params", &params.to_string()]);
    }

    eprintln!("\n{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pacing_mentions_batch_pause_only_when_set() {
        let job = JobConfig {
            worker_count: 2,
            request_delay: Duration::from_millis(500),
            max_retries: Some(3),
            ..Default::default()
        };
        assert_eq!(
            pacing(&job),
            "2 worker(s), 0.5s apart, cooldown 60s, retries 3"
        );
        let paused = JobConfig {
            batch_size: 1000,
            batch_delay: Duration::from_secs(120),
            ..job
        };
        assert!(pacing(&paused).ends_with(", pause 120s every 1000"));
    }

    #[test]
    fn default_config_prints() {
        assert!(show_config(&Config::default()).is_ok());
    }
}
