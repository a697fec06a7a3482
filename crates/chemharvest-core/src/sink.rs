//! Output sinks: append-only JSONL record store and atomic per-item files

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::item::{CompletionRecord, ItemId};

/// Durable destination for completed results.
///
/// `append` returns only after the result is recoverable by the next run's
/// ledger scan.
pub trait Sink<R>: Sync {
    fn append(&self, id: &ItemId, result: R) -> io::Result<()>;
}

/// Append-only, line-delimited store of [`CompletionRecord`]s.
///
/// Each record is serialized to one buffer and written with a single
/// `write_all` under the lock; prior lines are never rewritten.
pub struct JsonlSink<R> {
    path: PathBuf,
    file: Mutex<File>,
    _result: PhantomData<fn(R)>,
}

impl<R> std::fmt::Debug for JsonlSink<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<R> JsonlSink<R> {
    /// Open (or create) the store for appending.
    ///
    /// A torn last line from a crashed writer is terminated with a newline so
    /// the next record stays independently parseable.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        if has_torn_tail(&mut file)? {
            log::warn!("{}: terminating torn last line", path.display());
            file.write_all(b"\n")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _result: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R: Serialize> Sink<R> for JsonlSink<R> {
    fn append(&self, id: &ItemId, result: R) -> io::Result<()> {
        let record = CompletionRecord::now(id.clone(), result);
        let mut line = serde_json::to_vec(&record).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut file = self.file.lock().expect("sink lock poisoned");
        file.write_all(&line)?;
        file.sync_data()
    }
}

/// Whether the file is non-empty and does not end with a newline
fn has_torn_tail(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read every parseable record, keeping the first one seen per id.
///
/// Malformed or torn lines are skipped. A missing file reads as empty.
pub fn read_records<R: DeserializeOwned>(path: &Path) -> io::Result<Vec<CompletionRecord<R>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut seen = FxHashSet::default();
    let mut records = Vec::new();
    let mut skipped = 0usize;
    // Byte lines: a torn tail may end inside a multi-byte character
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CompletionRecord<R>>(&line) {
            Ok(rec) => {
                if seen.insert(rec.id.clone()) {
                    records.push(rec);
                }
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        log::debug!("{}: skipped {skipped} unparseable lines", path.display());
    }
    Ok(records)
}

/// Sink writing each result to its own file, named from the item id.
///
/// Files are written to `<name>.tmp` and renamed, so a final name only ever
/// holds a complete artifact.
pub struct FileSink {
    dir: PathBuf,
    name_of: Box<dyn Fn(&ItemId) -> String + Send + Sync>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileSink {
    pub fn new(
        dir: &Path,
        name_of: impl Fn(&ItemId) -> String + Send + Sync + 'static,
    ) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name_of: Box::new(name_of),
        })
    }

    /// Final path for an item
    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        self.dir.join((self.name_of)(id))
    }
}

impl Sink<Vec<u8>> for FileSink {
    fn append(&self, id: &ItemId, result: Vec<u8>) -> io::Result<()> {
        write_atomic(&self.path_for(id), &result)
    }
}

/// Write `bytes` to `path` via a synced tmp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)
}

/// Remove stale .tmp files in the output directory
pub fn cleanup_tmp_files(output_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
