//! End-to-end behavior of the orchestration core with in-process fakes
//! standing in for remote services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chemharvest_core::{
    BatchBackend, BatchConfig, BatchResponse, BatchRunner, BatchStatus, CallError, CallResult,
    Clock, CompletionRecord, Cursor, Dispatcher, HandleStore, IdentityTable, ItemId, JobConfig,
    JobError, JsonlSink, Ledger, Page, PageSource, Paginated, RetryPolicy, Shard, Shutdown,
    WorkItem, merge_csv, read_records,
};
use tempfile::TempDir;

const COOLDOWN: Duration = Duration::from_secs(120);

/// Records sleeps instead of sleeping.
#[derive(Default)]
struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        self.sleeps.lock().unwrap().push(duration);
        !shutdown.is_requested()
    }
}

fn config(workers: usize) -> JobConfig {
    JobConfig {
        worker_count: workers,
        request_delay: Duration::ZERO,
        cooldown_time: COOLDOWN,
        ..Default::default()
    }
}

fn dispatcher(workers: usize, shutdown: Shutdown) -> (Dispatcher, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::default());
    let d = Dispatcher::new("it", config(workers), shutdown)
        .unwrap()
        .with_clock(clock.clone());
    (d, clock)
}

fn items(n: u64) -> Vec<Result<WorkItem<u64>, JobError>> {
    (1..=n).map(|i| Ok(WorkItem::new(i, i))).collect()
}

fn line_count(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count()
}

#[test]
fn interrupted_run_resumes_to_same_result() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("results.jsonl");

    // First run stops after the fourth item
    let shutdown = Shutdown::new();
    let (d, _) = dispatcher(1, shutdown.clone());
    let sink: JsonlSink<u64> = JsonlSink::open(&path).unwrap();
    let first = d
        .run(items(10), &Ledger::from_records(&path).unwrap(), &sink, |item| {
            if item.payload == 4 {
                shutdown.request();
            }
            Ok(item.payload * 2)
        })
        .unwrap();
    assert!(first.interrupted);
    assert_eq!(first.exit_code(), 130);
    assert_eq!(first.succeeded, 4);

    // Second run picks up the rest
    let (d, _) = dispatcher(1, Shutdown::new());
    let calls = AtomicUsize::new(0);
    let second = d
        .run(items(10), &Ledger::from_records(&path).unwrap(), &sink, |item| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(item.payload * 2)
        })
        .unwrap();
    assert_eq!(second.skipped, 4);
    assert_eq!(second.succeeded, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(second.exit_code(), 0);

    // Same content as one uninterrupted run
    let resumed: Vec<CompletionRecord<u64>> = read_records(&path).unwrap();
    let mut got: Vec<(String, u64)> = resumed
        .iter()
        .map(|r| (r.id.to_string(), r.result))
        .collect();
    got.sort();
    let mut want: Vec<(String, u64)> = (1..=10u64).map(|i| (i.to_string(), i * 2)).collect();
    want.sort();
    assert_eq!(got, want);
    assert_eq!(line_count(&path), 10);
}

#[test]
fn rerun_of_complete_job_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink: JsonlSink<u64> = JsonlSink::open(&path).unwrap();

    for _ in 0..3 {
        let (d, _) = dispatcher(3, Shutdown::new());
        d.run(items(25), &Ledger::from_records(&path).unwrap(), &sink, |i| {
            Ok(i.payload)
        })
        .unwrap();
    }
    assert_eq!(line_count(&path), 25);
}

#[test]
fn never_more_than_worker_count_in_flight() {
    const WORKERS: usize = 3;
    let (d, _) = dispatcher(WORKERS, Shutdown::new());
    let dir = TempDir::new().unwrap();
    let sink: JsonlSink<u64> = JsonlSink::open(&dir.path().join("r.jsonl")).unwrap();

    let current = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let summary = d
        .run(items(40), &Ledger::empty(), &sink, |item| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(item.payload)
        })
        .unwrap();

    assert_eq!(summary.succeeded, 40);
    assert!(peak.load(Ordering::SeqCst) <= WORKERS);
    assert!(summary.peak_in_flight <= WORKERS);
}

#[test]
fn retryable_failures_cool_down_then_sink_once() {
    let (d, clock) = dispatcher(1, Shutdown::new());
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("r.jsonl");
    let sink: JsonlSink<u64> = JsonlSink::open(&path).unwrap();

    let failures = AtomicUsize::new(0);
    let summary = d
        .run(items(1), &Ledger::empty(), &sink, |item| {
            if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CallError::retryable("HTTP 503"))
            } else {
                Ok(item.payload)
            }
        })
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    let cooldowns = clock
        .sleeps
        .lock()
        .unwrap()
        .iter()
        .filter(|d| **d == COOLDOWN)
        .count();
    assert_eq!(cooldowns, 2);
    assert_eq!(line_count(&path), 1);
}

#[test]
fn fatal_item_is_isolated_from_the_rest() {
    let (d, _) = dispatcher(2, Shutdown::new());
    let dir = TempDir::new().unwrap();
    let jsonl = dir.path().join("r.jsonl");
    let sink: JsonlSink<u64> = JsonlSink::open(&jsonl).unwrap();

    let summary = d
        .run(items(10), &Ledger::empty(), &sink, |item| {
            if item.payload == 5 {
                Err(CallError::fatal("HTTP 401: bad credentials"))
            } else {
                Ok(item.payload * item.payload)
            }
        })
        .unwrap();
    assert_eq!(summary.item_fatal.len(), 1);
    assert_eq!(summary.item_fatal[0].0, ItemId::from(5u64));
    assert!(summary.item_fatal[0].1.contains("401"));

    let mut identities = IdentityTable::new(vec!["n".into()]);
    for i in 1..=10u64 {
        identities.insert(ItemId::from(i), vec![i.to_string()]);
    }
    let records: Vec<CompletionRecord<u64>> = read_records(&jsonl).unwrap();
    let csv_path = dir.path().join("merged.csv");
    let report = merge_csv(&csv_path, &records, &identities, &["square"], |_, sq| {
        vec![sq.to_string()]
    })
    .unwrap();
    assert_eq!(report.rows_written, 9);
    assert_eq!(report.missing, 1);
    assert_eq!(line_count(&csv_path), 10);
}

/// Listing with no results at all
struct EmptyListing;

impl PageSource for EmptyListing {
    type Payload = ();

    fn fetch_page(&self, _cursor: &Cursor) -> CallResult<Page<()>> {
        Ok(Page {
            items: Vec::new(),
            skipped: 0,
            next: Some(Cursor::Offset(50)),
        })
    }
}

#[test]
fn empty_listing_terminates_cleanly() {
    let (d, clock) = dispatcher(2, Shutdown::new());
    let dir = TempDir::new().unwrap();
    let sink: JsonlSink<()> = JsonlSink::open(&dir.path().join("r.jsonl")).unwrap();
    let listing = Paginated::new(
        EmptyListing,
        RetryPolicy::new(COOLDOWN, None),
        clock,
        Shutdown::new(),
    );
    let summary = d
        .run(listing, &Ledger::empty(), &sink, |_| Ok(()))
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.exit_code(), 0);
}

/// Batch service finishing jobs out of submission order: job N finishes on
/// poll number `finish_after[N]`.
struct ReorderingBackend {
    finish_after: Vec<usize>,
    polls: Mutex<HashMap<String, usize>>,
    shards: Mutex<Vec<Vec<(ItemId, u64)>>>,
}

impl BatchBackend for ReorderingBackend {
    type Payload = u64;
    type Output = u64;

    fn submit(&self, shard: &Shard<u64>) -> CallResult<String> {
        let mut shards = self.shards.lock().unwrap();
        shards.push(
            shard
                .items
                .iter()
                .map(|i| (i.id.clone(), i.payload))
                .collect(),
        );
        Ok(format!("batch_{}", shards.len() - 1))
    }

    fn poll(&self, remote_job_id: &str) -> CallResult<BatchStatus> {
        let idx: usize = remote_job_id["batch_".len()..].parse().unwrap();
        let mut polls = self.polls.lock().unwrap();
        let n = polls.entry(remote_job_id.to_string()).or_default();
        *n += 1;
        Ok(if *n >= self.finish_after[idx] {
            BatchStatus::Succeeded
        } else {
            BatchStatus::Running
        })
    }

    fn download(&self, remote_job_id: &str) -> CallResult<Vec<BatchResponse<u64>>> {
        let idx: usize = remote_job_id["batch_".len()..].parse().unwrap();
        let shard = self.shards.lock().unwrap()[idx].clone();
        // Responses come back in reverse order
        Ok(shard
            .into_iter()
            .rev()
            .map(|(id, n)| BatchResponse {
                id,
                outcome: Ok(n + 1000),
            })
            .collect())
    }
}

#[test]
fn batch_results_attributed_by_embedded_id() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::default());
    let runner = BatchRunner::new(
        "it",
        BatchConfig {
            shard_size: 4,
            poll_interval: Duration::from_secs(30),
        },
        RetryPolicy::new(COOLDOWN, Some(3)),
        clock.clone(),
        Shutdown::new(),
    )
    .unwrap();
    let backend = ReorderingBackend {
        finish_after: vec![3, 1, 2],
        polls: Mutex::default(),
        shards: Mutex::default(),
    };
    let ledger = Ledger::empty();
    let mut store = HandleStore::open(dir.path()).unwrap();

    let submitted = runner
        .submit(items(12), &ledger, &backend, &mut store)
        .unwrap();
    assert_eq!(submitted.succeeded, 12);
    assert_eq!(store.handles().len(), 3);

    let path = dir.path().join("batch_results.jsonl");
    let sink: JsonlSink<u64> = JsonlSink::open(&path).unwrap();
    let collected = runner
        .collect(&backend, &ledger, &sink, &mut store, true)
        .unwrap();
    assert_eq!(collected.succeeded, 12);
    assert_eq!(collected.exit_code(), 0);
    assert!(store.handles().is_empty());
    assert!(
        clock
            .sleeps
            .lock()
            .unwrap()
            .contains(&Duration::from_secs(30))
    );

    let records: Vec<CompletionRecord<u64>> = read_records(&path).unwrap();
    assert_eq!(records.len(), 12);
    for rec in records {
        assert_eq!(rec.result, rec.id.as_u64().unwrap() + 1000);
    }
}

#[test]
fn collect_without_wait_leaves_running_shards_live() {
    let dir = TempDir::new().unwrap();
    let runner = BatchRunner::new(
        "it",
        BatchConfig {
            shard_size: 2,
            poll_interval: Duration::from_secs(30),
        },
        RetryPolicy::new(COOLDOWN, Some(3)),
        Arc::new(FakeClock::default()),
        Shutdown::new(),
    )
    .unwrap();
    let backend = ReorderingBackend {
        finish_after: vec![1, 5],
        polls: Mutex::default(),
        shards: Mutex::default(),
    };
    let ledger = Ledger::empty();
    let mut store = HandleStore::open(dir.path()).unwrap();
    runner
        .submit(items(4), &ledger, &backend, &mut store)
        .unwrap();

    let sink: JsonlSink<u64> = JsonlSink::open(&dir.path().join("r.jsonl")).unwrap();
    let summary = runner
        .collect(&backend, &ledger, &sink, &mut store, false)
        .unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(store.handles().len(), 1);
    assert_eq!(store.handles()[0].status, BatchStatus::Running);

    // The surviving handle is on disk for the next collect
    let reopened = HandleStore::open(dir.path()).unwrap();
    assert_eq!(reopened.handles().len(), 1);
}
