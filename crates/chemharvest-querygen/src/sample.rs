//! Reproducible row sampling
//!
//! Each row is ranked by a keyed hash of its id and the `k` lowest ranks are
//! drawn, so the sample depends only on the seed and the id set, not on row
//! order. The drawn ids are written to the sample file on first use and read
//! back on every later run.

use std::path::Path;

use anyhow::{Context, Result};
use chemharvest_core::{ItemId, JobError, write_atomic};
use rustc_hash::FxHashSet;

use crate::config::SampleConfig;
use crate::input::Row;

/// Number of rows to draw out of `n`.
pub fn sample_len(config: &SampleConfig, n: usize) -> usize {
    let k = match (config.sample_size, config.sample_frac) {
        (Some(size), _) => size,
        (None, Some(frac)) => ((n as f64 * frac) as usize).max(1),
        (None, None) => n,
    };
    k.min(n)
}

fn rank(seed: u64, row: &Row) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(row.id.as_str().as_bytes());
    hasher.finalize()
}

/// Draw a fresh sample of id tuples.
pub fn draw(config: &SampleConfig, rows: &[Row]) -> Vec<Vec<String>> {
    let mut ranked: Vec<(blake3::Hash, &Row)> = rows
        .iter()
        .map(|r| (rank(config.random_seed, r), r))
        .collect();
    ranked.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let mut seen = FxHashSet::default();
    ranked
        .into_iter()
        .filter(|(_, r)| seen.insert(r.id.clone()))
        .take(sample_len(config, rows.len()))
        .map(|(_, r)| r.id_values.clone())
        .collect()
}

/// Restrict `rows` to the persisted sample, drawing and persisting it first
/// when the sample file does not exist yet.
pub fn apply(config: &SampleConfig, path: &Path, rows: Vec<Row>) -> Result<Vec<Row>> {
    if !config.is_active() {
        return Ok(rows);
    }
    let ids: Vec<Vec<String>> = match std::fs::read_to_string(path) {
        Ok(json) => {
            let ids: Vec<Vec<String>> = serde_json::from_str(&json).map_err(|e| {
                JobError::State(format!("{}: not a list of id tuples: {e}", path.display()))
            })?;
            log::info!("{}: reusing sample of {} ids", path.display(), ids.len());
            ids
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let ids = draw(config, &rows);
            let json = serde_json::to_vec(&ids)?;
            write_atomic(path, &json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            log::info!(
                "sampled {} of {} rows (seed {}) into {}",
                ids.len(),
                rows.len(),
                config.random_seed,
                path.display()
            );
            ids
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let keep: FxHashSet<ItemId> = ids.iter().map(|t| ItemId::composite(t.as_slice())).collect();
    Ok(rows.into_iter().filter(|r| keep.contains(&r.id)).collect())
}
