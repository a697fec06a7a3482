//! Compound record download: CID sources, the PUG-View fetch and file naming

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chemharvest_core::stream;
use chemharvest_core::{
    CallError, CallResult, IdRange, ItemId, JobError, WorkItem, from_list, http_client,
};

use crate::config::Config;

/// Record file name for a CID
pub fn file_name(id: &ItemId) -> String {
    format!("cid_{id}.json")
}

/// CID of a `cid_{cid}.json` file name
pub fn cid_of(name: &str) -> Option<ItemId> {
    let cid: u64 = name.strip_prefix("cid_")?.strip_suffix(".json")?.parse().ok()?;
    Some(ItemId::from(cid))
}

/// Read a predefined CID list. Anything but a JSON array of non-negative
/// integers is rejected.
pub fn load_cid_list(path: &Path) -> Result<Vec<u64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read CID list {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("CID list {} is not valid JSON", path.display()))?;
    let Some(entries) = value.as_array() else {
        bail!("CID list {} must be a JSON array of integers", path.display());
    };
    entries
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_u64().with_context(|| {
                format!("CID list {}: entry {i} ({v}) is not a non-negative integer", path.display())
            })
        })
        .collect()
}

/// Boxed CID enumerator handed to the dispatcher
pub type CidSource = Box<dyn Iterator<Item = Result<WorkItem<u64>, JobError>> + Send>;

/// The CIDs to download: the predefined list when configured, else
/// `start_cid..=max_cid`. Returns the enumerator and its length.
pub fn cid_source(config: &Config) -> Result<(CidSource, u64), JobError> {
    if let Some(path) = &config.predefined_cids_path {
        let cids = load_cid_list(path).map_err(|e| JobError::Config(format!("{e:#}")))?;
        log::info!("using predefined CID list with {} entries", cids.len());
        let len = cids.len() as u64;
        return Ok((Box::new(from_list(cids)), len));
    }
    let Some(max_cid) = config.max_cid else {
        return Err(JobError::Config(
            "pubchem download needs either max_cid or predefined_cids_path".into(),
        ));
    };
    let range = IdRange::new(config.start_cid, max_cid);
    let len = range.len();
    Ok((Box::new(range.into_iter()), len))
}

/// Fetch one compound record. The body must be JSON; 404 and other client
/// errors are item-fatal.
pub fn fetch_compound(base_url: &str, cid: u64, timeout: Duration) -> CallResult<Vec<u8>> {
    let url = format!("{}/{cid}/JSON/", base_url.trim_end_matches('/'));
    let body = stream::send_bytes(http_client().get(url), timeout)?;
    serde_json::from_slice::<serde::de::IgnoredAny>(&body)
        .map_err(|e| CallError::fatal(format!("CID {cid}: response is not JSON: {e}")))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_names_round_trip_to_cids() {
        assert_eq!(file_name(&ItemId::from(2244u64)), "cid_2244.json");
        assert_eq!(cid_of("cid_2244.json"), Some(ItemId::from(2244u64)));
        assert_eq!(cid_of("cid_x.json"), None);
        assert_eq!(cid_of("cid_7.json.tmp"), None);
    }

    #[test]
    fn cid_list_must_be_integer_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cids.json");

        std::fs::write(&path, "[5, 3, 9]").unwrap();
        assert_eq!(load_cid_list(&path).unwrap(), vec![5, 3, 9]);

        std::fs::write(&path, r#"{"cids": [1]}"#).unwrap();
        assert!(load_cid_list(&path).is_err());

        std::fs::write(&path, r#"[1, "two"]"#).unwrap();
        assert!(load_cid_list(&path).is_err());

        std::fs::write(&path, "[1, -4]").unwrap();
        assert!(load_cid_list(&path).is_err());
    }

    #[test]
    fn range_source_needs_max_cid() {
        let config = Config::default();
        assert!(cid_source(&config).is_err());

        let config = Config {
            start_cid: 10,
            max_cid: Some(12),
            ..Default::default()
        };
        let (source, len) = cid_source(&config).unwrap();
        assert_eq!(len, 3);
        let ids: Vec<u64> = source.map(|r| r.unwrap().payload).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }
}
