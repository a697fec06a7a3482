//! Completion ledger: which item ids already produced a durable result.
//!
//! Two backings feed the same in-memory set:
//! - a JSONL record store (record-producing work: metadata, generated queries)
//! - an output directory of per-item files (file-producing work: PDFs, JSON)
//!
//! The ledger must never report a false positive, so file artifacts are only
//! counted after an integrity check passes.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::item::ItemId;
use crate::sink::cleanup_tmp_files;

/// Set of completed ids, shared by all worker lanes of one job.
#[derive(Debug, Default)]
pub struct Ledger {
    ids: Mutex<FxHashSet<ItemId>>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: ItemId,
}

impl Ledger {
    /// Ledger with nothing completed
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = ItemId>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// Scan a JSONL record store for ids already present.
    ///
    /// Duplicate lines collapse to one id; malformed or torn lines are ignored.
    /// A missing store means nothing is complete yet.
    pub fn from_records(path: &Path) -> io::Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(e),
        };
        let mut ids = FxHashSet::default();
        // Byte lines: a torn tail may end inside a multi-byte character
        for line in BufReader::new(file).split(b'\n') {
            let line = line?;
            if let Ok(rec) = serde_json::from_slice::<IdOnly>(&line) {
                ids.insert(rec.id);
            }
        }
        log::debug!("{}: {} completed ids", path.display(), ids.len());
        Ok(Self {
            ids: Mutex::new(ids),
        })
    }

    /// Scan an output directory for per-item artifacts matching `pattern`
    /// (e.g. `cid_*.json`).
    ///
    /// `id_of` maps a file name back to its item id; `verify` rejects
    /// truncated or corrupt artifacts, which are then redone. Stale `*.tmp`
    /// files are removed first.
    pub fn from_files(
        dir: &Path,
        pattern: &str,
        id_of: impl Fn(&str) -> Option<ItemId>,
        verify: impl Fn(&Path) -> bool,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        cleanup_tmp_files(dir)?;

        let glob_pattern = dir.join(pattern);
        let paths = glob::glob(&glob_pattern.to_string_lossy())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut ids = FxHashSet::default();
        let mut rejected = 0usize;
        for path in paths.filter_map(Result::ok) {
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(&id_of)
            else {
                continue;
            };
            if verify(&path) {
                ids.insert(id);
            } else {
                rejected += 1;
                log::warn!("{}: incomplete artifact, will redo", path.display());
            }
        }
        log::debug!(
            "{}: {} completed artifacts ({rejected} rejected)",
            dir.display(),
            ids.len()
        );
        Ok(Self {
            ids: Mutex::new(ids),
        })
    }

    pub fn is_complete(&self, id: &ItemId) -> bool {
        self.ids.lock().expect("ledger lock poisoned").contains(id)
    }

    /// Record completion; returns `false` if the id was already complete.
    pub fn mark_complete(&self, id: &ItemId) -> bool {
        self.ids
            .lock()
            .expect("ledger lock poisoned")
            .insert(id.clone())
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes of the file tail searched for the `%%EOF` marker
const PDF_TAIL: u64 = 1024;

/// Check that a file starts with a PDF header and ends with an EOF marker.
///
/// A download cut short keeps the header but loses the trailer.
pub fn is_valid_pdf(path: &Path) -> bool {
    fn check(path: &Path) -> io::Result<bool> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut head = [0u8; 5];
        if len < head.len() as u64 {
            return Ok(false);
        }
        file.read_exact(&mut head)?;
        if &head != b"%PDF-" {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(len.saturating_sub(PDF_TAIL)))?;
        let mut tail = Vec::with_capacity(PDF_TAIL as usize);
        file.read_to_end(&mut tail)?;
        Ok(tail.windows(5).any(|w| w == b"%%EOF"))
    }
    check(path).unwrap_or(false)
}

/// Check that bytes look like a complete PDF document.
pub fn is_pdf_bytes(bytes: &[u8]) -> bool {
    let tail_start = bytes.len().saturating_sub(PDF_TAIL as usize);
    bytes.starts_with(b"%PDF-") && bytes[tail_start..].windows(5).any(|w| w == b"%%EOF")
}

/// Check that a file holds one complete JSON document.
pub fn is_valid_json(path: &Path) -> bool {
    File::open(path)
        .ok()
        .map(BufReader::new)
        .is_some_and(|r| serde_json::from_reader::<_, serde::de::IgnoredAny>(r).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cid_of(name: &str) -> Option<ItemId> {
        let n: u64 = name.strip_prefix("cid_")?.strip_suffix(".json")?.parse().ok()?;
        Some(ItemId::from(n))
    }

    #[test]
    fn records_ledger_dedupes_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"id\":\"a\",\"result\":1}\n",
                "not json\n",
                "{\"id\":\"a\",\"result\":2}\n",
                "{\"id\":\"b\",\"result\":3}\n",
                "{\"id\":\"c\",\"res",
            ),
        )
        .unwrap();

        let ledger = Ledger::from_records(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.is_complete(&ItemId::from("a")));
        assert!(ledger.is_complete(&ItemId::from("b")));
        assert!(!ledger.is_complete(&ItemId::from("c")));
    }

    #[test]
    fn records_ledger_survives_torn_multibyte_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.jsonl");
        let mut bytes = b"{\"id\":\"a\",\"result\":\"ok\"}\n".to_vec();
        bytes.extend_from_slice(b"{\"id\":\"b\",\"result\":\"caf\xC3");
        std::fs::write(&path, &bytes).unwrap();

        let ledger = Ledger::from_records(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_complete(&ItemId::from("a")));
        assert!(!ledger.is_complete(&ItemId::from("b")));
    }

    #[test]
    fn records_ledger_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::from_records(&dir.path().join("none.jsonl")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn mark_complete_reports_first_insert() {
        let ledger = Ledger::empty();
        assert!(ledger.mark_complete(&ItemId::from("x")));
        assert!(!ledger.mark_complete(&ItemId::from("x")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn file_ledger_rejects_truncated_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cid_1.json"), br#"{"Record": {}}"#).unwrap();
        std::fs::write(dir.path().join("cid_2.json"), br#"{"Record": {"#).unwrap();
        std::fs::write(dir.path().join("cid_3.json.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let ledger = Ledger::from_files(dir.path(), "cid_*.json", cid_of, is_valid_json).unwrap();
        assert!(ledger.is_complete(&ItemId::from(1u64)));
        assert!(!ledger.is_complete(&ItemId::from(2u64)));
        assert!(!ledger.is_complete(&ItemId::from(3u64)));
        assert!(!dir.path().join("cid_3.json.tmp").exists());
    }

    #[test]
    fn pdf_validation() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.pdf");
        let cut = dir.path().join("cut.pdf");
        let html = dir.path().join("html.pdf");
        std::fs::write(&good, b"%PDF-1.7\n...body...\n%%EOF\n").unwrap();
        std::fs::write(&cut, b"%PDF-1.7\n...bo").unwrap();
        std::fs::write(&html, b"<html>rate limited</html>").unwrap();

        assert!(is_valid_pdf(&good));
        assert!(!is_valid_pdf(&cut));
        assert!(!is_valid_pdf(&html));
        assert!(!is_valid_pdf(&dir.path().join("missing.pdf")));
    }

    #[test]
    fn pdf_bytes_validation() {
        assert!(is_pdf_bytes(b"%PDF-1.4 x %%EOF"));
        assert!(!is_pdf_bytes(b"%PDF-1.4 truncated"));
        assert!(!is_pdf_bytes(b""));
    }
}
