//! Async batch submission: shard, submit, persist handles, poll, collect.
//!
//! Handle state lives in `<root>/batch_handles.json` and is rewritten
//! atomically right after every submission, so an interrupted `submit` or
//! `collect` resumes without resubmitting or losing a remote job. Handles
//! whose results were collected move to `<root>/batch_handles.archive.jsonl`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::config::BatchConfig;
use crate::dispatch::JobSummary;
use crate::error::{CallResult, JobError};
use crate::item::{ItemId, WorkItem};
use crate::ledger::Ledger;
use crate::progress::fmt_num;
use crate::retry::{Abandoned, Clock, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::sink::{Sink, write_atomic};

pub const HANDLES_FILE: &str = "batch_handles.json";
pub const ARCHIVE_FILE: &str = "batch_handles.archive.jsonl";

/// Remote state of one submitted shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One submitted shard and the ids it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub shard_id: usize,
    pub remote_job_id: String,
    pub status: BatchStatus,
    pub submitted_at: DateTime<Utc>,
    pub item_ids: Vec<ItemId>,
}

/// A group of work items submitted as one remote job.
#[derive(Debug)]
pub struct Shard<P> {
    pub shard_id: usize,
    pub items: Vec<WorkItem<P>>,
}

/// One per-item response from a downloaded batch result file.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse<R> {
    /// Id embedded in the response (`custom_id`)
    pub id: ItemId,
    /// Parsed result, or the item-fatal reason
    pub outcome: Result<R, String>,
}

/// Remote batch API.
pub trait BatchBackend: Sync {
    type Payload;
    type Output;

    /// Upload and create the remote job for a shard; returns its id.
    fn submit(&self, shard: &Shard<Self::Payload>) -> CallResult<String>;

    fn poll(&self, remote_job_id: &str) -> CallResult<BatchStatus>;

    /// Fetch all responses of a succeeded job.
    fn download(&self, remote_job_id: &str) -> CallResult<Vec<BatchResponse<Self::Output>>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HandleFile {
    next_shard_id: usize,
    handles: Vec<BatchHandle>,
}

/// Persisted set of live batch handles under a job root.
#[derive(Debug)]
pub struct HandleStore {
    path: PathBuf,
    archive_path: PathBuf,
    state: HandleFile,
}

impl HandleStore {
    /// Load the handle file; a missing file means no live handles.
    pub fn open(root: &Path) -> Result<Self, JobError> {
        std::fs::create_dir_all(root)
            .map_err(|e| JobError::State(format!("{}: {e}", root.display())))?;
        let path = root.join(HANDLES_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| JobError::State(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HandleFile::default(),
            Err(e) => return Err(JobError::State(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            archive_path: root.join(ARCHIVE_FILE),
            state,
        })
    }

    pub fn handles(&self) -> &[BatchHandle] {
        &self.state.handles
    }

    /// Ids covered by a live handle
    pub fn covered_ids(&self) -> FxHashSet<ItemId> {
        self.state
            .handles
            .iter()
            .flat_map(|h| h.item_ids.iter().cloned())
            .collect()
    }

    fn next_shard_id(&mut self) -> usize {
        let id = self.state.next_shard_id;
        self.state.next_shard_id += 1;
        id
    }

    fn save(&self) -> Result<(), JobError> {
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| JobError::State(format!("serialize handles: {e}")))?;
        write_atomic(&self.path, &json)
            .map_err(|e| JobError::State(format!("{}: {e}", self.path.display())))
    }

    /// Record a fresh submission and persist it.
    fn push(&mut self, handle: BatchHandle) -> Result<(), JobError> {
        self.state.handles.push(handle);
        self.save()
    }

    fn set_status(&mut self, shard_id: usize, status: BatchStatus) -> Result<(), JobError> {
        if let Some(h) = self.state.handles.iter_mut().find(|h| h.shard_id == shard_id) {
            h.status = status;
        }
        self.save()
    }

    /// Move a collected handle from the live file to the archive.
    fn archive(&mut self, shard_id: usize) -> Result<(), JobError> {
        let Some(pos) = self
            .state
            .handles
            .iter()
            .position(|h| h.shard_id == shard_id)
        else {
            return Ok(());
        };
        let handle = self.state.handles.remove(pos);
        let mut line = serde_json::to_vec(&handle)
            .map_err(|e| JobError::State(format!("serialize handle: {e}")))?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)
            .and_then(|mut f| f.write_all(&line))
            .map_err(|e| JobError::State(format!("{}: {e}", self.archive_path.display())))?;
        self.save()
    }
}

/// Drives the submit and collect phases of an async batch job.
pub struct BatchRunner {
    name: String,
    config: BatchConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
}

impl BatchRunner {
    pub fn new(
        name: impl Into<String>,
        config: BatchConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Result<Self, JobError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            retry,
            clock,
            shutdown,
        })
    }

    /// Shard and submit every item that is neither complete nor covered by a
    /// live handle.
    ///
    /// `succeeded` counts items in accepted shards; items of a shard whose
    /// submission failed are item-fatal and are picked up by the next submit.
    pub fn submit<B, I>(
        &self,
        items: I,
        ledger: &Ledger,
        backend: &B,
        store: &mut HandleStore,
    ) -> Result<JobSummary, JobError>
    where
        B: BatchBackend,
        I: IntoIterator<Item = Result<WorkItem<B::Payload>, JobError>>,
    {
        let start = Instant::now();
        let mut summary = JobSummary {
            name: format!("{} submit", self.name),
            ..Default::default()
        };
        let covered = store.covered_ids();
        let mut seen = FxHashSet::default();
        let mut pending = Vec::new();
        for item in items {
            let item = item?;
            summary.enumerated += 1;
            if !seen.insert(item.id.clone()) {
                continue;
            }
            if ledger.is_complete(&item.id) || covered.contains(&item.id) {
                summary.skipped += 1;
                continue;
            }
            pending.push(item);
        }
        log::info!(
            "{}: {} items to submit, {} done or in flight",
            self.name,
            fmt_num(pending.len()),
            fmt_num(summary.skipped)
        );

        let mut pending = pending.into_iter().peekable();
        while pending.peek().is_some() {
            if self.shutdown.is_requested() {
                break;
            }
            let shard = Shard {
                shard_id: store.next_shard_id(),
                items: pending.by_ref().take(self.config.shard_size).collect(),
            };
            let label = format!("shard {:04}", shard.shard_id);
            summary.attempted += shard.items.len();
            match self
                .retry
                .run(&label, self.clock.as_ref(), &self.shutdown, || backend.submit(&shard))
            {
                Ok(remote_job_id) => {
                    log::info!(
                        "{label}: submitted {} items as {remote_job_id}",
                        fmt_num(shard.items.len())
                    );
                    store.push(BatchHandle {
                        shard_id: shard.shard_id,
                        remote_job_id,
                        status: BatchStatus::Submitted,
                        submitted_at: Utc::now(),
                        item_ids: shard.items.iter().map(|i| i.id.clone()).collect(),
                    })?;
                    summary.succeeded += shard.items.len();
                }
                Err(Abandoned::Interrupted) => {
                    summary.attempted -= shard.items.len();
                    break;
                }
                Err(e) => {
                    let reason = format!("{label} submission failed: {}", e.reason());
                    log::error!("{reason}");
                    summary
                        .item_fatal
                        .extend(shard.items.into_iter().map(|i| (i.id, reason.clone())));
                }
            }
        }

        summary.interrupted = self.shutdown.is_requested();
        summary.elapsed = start.elapsed();
        Ok(summary)
    }

    /// Poll live handles and sink the results of finished ones.
    ///
    /// With `wait`, polls every `poll_interval` until no live handle is left
    /// unfinished; otherwise polls once and collects only what is finished.
    /// A handle whose poll fails keeps its last known status and stays live.
    pub fn collect<B>(
        &self,
        backend: &B,
        ledger: &Ledger,
        sink: &dyn Sink<B::Output>,
        store: &mut HandleStore,
        wait: bool,
    ) -> Result<JobSummary, JobError>
    where
        B: BatchBackend,
    {
        let start = Instant::now();
        let mut summary = JobSummary {
            name: format!("{} collect", self.name),
            ..Default::default()
        };

        loop {
            self.poll_live(backend, store)?;
            let running = store
                .handles()
                .iter()
                .filter(|h| !h.status.is_terminal())
                .count();
            if running == 0 || !wait || self.shutdown.is_requested() {
                if running > 0 {
                    log::info!("{}: {running} shards still running", self.name);
                }
                break;
            }
            log::info!(
                "{}: {running} shards running, next poll in {:?}",
                self.name,
                self.config.poll_interval
            );
            if !self.clock.sleep(self.config.poll_interval, &self.shutdown) {
                break;
            }
        }

        let finished: Vec<BatchHandle> = store
            .handles()
            .iter()
            .filter(|h| h.status.is_terminal())
            .cloned()
            .collect();
        for handle in finished {
            if self.shutdown.is_requested() {
                break;
            }
            match self.collect_one(backend, ledger, sink, &handle, &mut summary)? {
                Collected::Done => {}
                // Results still downloadable; the next collect retries
                Collected::Retry => continue,
                Collected::Interrupted => break,
            }
            if summary.aborted.is_some() {
                break;
            }
            store.archive(handle.shard_id)?;
        }

        summary.interrupted = self.shutdown.is_requested();
        summary.elapsed = start.elapsed();
        Ok(summary)
    }

    fn poll_live<B: BatchBackend>(&self, backend: &B, store: &mut HandleStore) -> Result<(), JobError> {
        let live: Vec<(usize, String, BatchStatus)> = store
            .handles()
            .iter()
            .filter(|h| !h.status.is_terminal())
            .map(|h| (h.shard_id, h.remote_job_id.clone(), h.status))
            .collect();
        for (shard_id, remote_job_id, old) in live {
            let label = format!("shard {shard_id:04} ({remote_job_id})");
            let status = match self.retry.run(&label, self.clock.as_ref(), &self.shutdown, || {
                backend.poll(&remote_job_id)
            }) {
                Ok(status) => status,
                Err(Abandoned::Interrupted) => return Ok(()),
                // The remote job may still finish; keep the handle live
                Err(e) => {
                    log::warn!("{label}: poll failed, keeping handle live: {}", e.reason());
                    continue;
                }
            };
            if status != old {
                log::info!("{label}: {old:?} -> {status:?}");
                store.set_status(shard_id, status)?;
            }
        }
        Ok(())
    }

    /// Sink one finished shard.
    fn collect_one<B: BatchBackend>(
        &self,
        backend: &B,
        ledger: &Ledger,
        sink: &dyn Sink<B::Output>,
        handle: &BatchHandle,
        summary: &mut JobSummary,
    ) -> Result<Collected, JobError> {
        let label = format!("shard {:04} ({})", handle.shard_id, handle.remote_job_id);
        summary.attempted += handle.item_ids.len();

        if handle.status == BatchStatus::Failed {
            let reason = format!("{label} failed remotely");
            summary.item_fatal.extend(
                handle
                    .item_ids
                    .iter()
                    .filter(|id| !ledger.is_complete(id))
                    .map(|id| (id.clone(), reason.clone())),
            );
            return Ok(Collected::Done);
        }

        let responses = match self.retry.run(&label, self.clock.as_ref(), &self.shutdown, || {
            backend.download(&handle.remote_job_id)
        }) {
            Ok(r) => r,
            Err(Abandoned::Interrupted) => {
                summary.attempted -= handle.item_ids.len();
                return Ok(Collected::Interrupted);
            }
            Err(e) => {
                let reason = format!("{label} download failed: {}", e.reason());
                log::error!("{reason}");
                summary.item_fatal.extend(
                    handle
                        .item_ids
                        .iter()
                        .filter(|id| !ledger.is_complete(id))
                        .map(|id| (id.clone(), reason.clone())),
                );
                return Ok(Collected::Retry);
            }
        };

        let expected: FxHashSet<&ItemId> = handle.item_ids.iter().collect();
        let mut answered = FxHashSet::default();
        let mut unmatched = 0usize;
        for resp in responses {
            if !expected.contains(&resp.id) {
                unmatched += 1;
                continue;
            }
            if !answered.insert(resp.id.clone()) {
                continue;
            }
            match resp.outcome {
                Ok(result) => {
                    if ledger.is_complete(&resp.id) {
                        summary.skipped += 1;
                        continue;
                    }
                    if let Err(source) = sink.append(&resp.id, result) {
                        let err = JobError::Sink {
                            id: resp.id,
                            source,
                        };
                        log::error!("aborting job: {err}");
                        summary.aborted = Some(err.to_string());
                        return Ok(Collected::Done);
                    }
                    ledger.mark_complete(&resp.id);
                    summary.succeeded += 1;
                }
                Err(reason) => {
                    log::error!("{}: {reason}", resp.id);
                    summary.item_fatal.push((resp.id, reason));
                }
            }
        }
        if unmatched > 0 {
            log::warn!("{label}: ignored {unmatched} responses with ids outside the shard");
        }
        for id in &handle.item_ids {
            if !answered.contains(id) && !ledger.is_complete(id) {
                summary
                    .item_fatal
                    .push((id.clone(), format!("{label}: no response")));
            }
        }
        log::info!("{label}: {} results collected", fmt_num(answered.len()));
        Ok(Collected::Done)
    }
}

/// What to do with a handle after a collection attempt
enum Collected {
    /// Results sunk (or the shard failed remotely): archive the handle
    Done,
    /// Download failed: keep the handle live
    Retry,
    Interrupted,
}
