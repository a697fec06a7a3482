//! Rate-limited dispatcher: bounded worker lanes over a bounded queue.
//!
//! One producer lane drains the enumerator, filters it against the ledger and
//! feeds a bounded channel. `worker_count` lanes take items from the channel,
//! run the work operation under the retry policy, and append each result to
//! the sink before taking the next item.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use indicatif::ProgressBar;
use rustc_hash::FxHashSet;

use crate::config::JobConfig;
use crate::error::{CallError, CallResult, JobError};
use crate::item::{ItemId, WorkItem};
use crate::ledger::Ledger;
use crate::progress::fmt_num;
use crate::retry::{Abandoned, Clock, RetryPolicy, SystemClock};
use crate::shutdown::Shutdown;
use crate::sink::Sink;

/// How long an idle lane waits on the queue before re-checking for shutdown
const RECV_POLL: Duration = Duration::from_millis(100);

/// Item-fatal ids listed in the summary table; the rest are only counted
const TABLE_FAILURE_ROWS: usize = 20;

/// Mutable state of one job run. Created per run, dropped at the end; the
/// durable state lives in the ledger and the sink.
#[derive(Debug, Default)]
pub struct JobState {
    enumerated: AtomicUsize,
    skipped: AtomicUsize,
    attempted: AtomicUsize,
    succeeded: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failed_fatal: Mutex<Vec<(ItemId, String)>>,
    aborted: Mutex<Option<String>>,
}

impl JobState {
    /// Record a job-fatal error. The first reason wins.
    fn abort(&self, reason: String) {
        let mut aborted = self.aborted.lock().expect("job state lock poisoned");
        if aborted.is_none() {
            log::error!("aborting job: {reason}");
            *aborted = Some(reason);
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.lock().expect("job state lock poisoned").is_some()
    }

    fn fail(&self, id: ItemId, reason: String) {
        log::error!("{id}: {reason}");
        self.failed_fatal
            .lock()
            .expect("job state lock poisoned")
            .push((id, reason));
    }

    fn enter_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn into_summary(self, name: &str, interrupted: bool, elapsed: Duration) -> JobSummary {
        JobSummary {
            name: name.to_string(),
            enumerated: self.enumerated.into_inner(),
            skipped: self.skipped.into_inner(),
            attempted: self.attempted.into_inner(),
            succeeded: self.succeeded.into_inner(),
            item_fatal: self
                .failed_fatal
                .into_inner()
                .expect("job state lock poisoned"),
            peak_in_flight: self.peak_in_flight.into_inner(),
            interrupted,
            aborted: self.aborted.into_inner().expect("job state lock poisoned"),
            elapsed,
        }
    }
}

/// Shared pause after every `batch_size` successful items.
///
/// The lane that completes the n-th success sleeps `batch_delay`; the other
/// lanes wait before starting their next call. Failures do not count.
struct BatchGate {
    size: usize,
    delay: Duration,
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    successes: usize,
    paused: bool,
}

impl BatchGate {
    fn new(size: usize, delay: Duration) -> Self {
        Self {
            size,
            delay,
            state: Mutex::default(),
            cond: Condvar::new(),
        }
    }

    /// Count one success; pauses all lanes when a batch boundary is reached.
    fn record_success(&self, clock: &dyn Clock, shutdown: &Shutdown) {
        let pause = {
            let mut st = self.state.lock().expect("batch gate lock poisoned");
            st.successes += 1;
            let boundary = self.size > 0 && st.successes % self.size == 0;
            if boundary && !self.delay.is_zero() {
                st.paused = true;
                true
            } else {
                false
            }
        };
        if pause {
            log::info!(
                "{} items done, pausing {:?} before the next batch",
                fmt_num(self.size),
                self.delay
            );
            clock.sleep(self.delay, shutdown);
            self.state.lock().expect("batch gate lock poisoned").paused = false;
            self.cond.notify_all();
        }
    }

    /// Block while a batch pause is in effect.
    fn wait(&self, shutdown: &Shutdown) {
        let mut st = self.state.lock().expect("batch gate lock poisoned");
        while st.paused && !shutdown.is_requested() {
            st = self
                .cond
                .wait_timeout(st, RECV_POLL)
                .expect("batch gate lock poisoned")
                .0;
        }
    }
}

/// Per-lane call spacing.
struct Pacer<'a> {
    delay: Duration,
    last_start: Option<Instant>,
    clock: &'a dyn Clock,
}

impl Pacer<'_> {
    /// Sleep until `delay` has passed since this lane's previous call.
    fn pace(&mut self, shutdown: &Shutdown) -> bool {
        if let Some(last) = self.last_start {
            let elapsed = last.elapsed();
            if elapsed < self.delay && !self.clock.sleep(self.delay - elapsed, shutdown) {
                return false;
            }
        }
        self.last_start = Some(Instant::now());
        true
    }
}

/// Runs one job: enumerate, filter, dispatch, sink.
pub struct Dispatcher {
    name: String,
    config: JobConfig,
    shutdown: Shutdown,
    clock: Arc<dyn Clock>,
    progress: ProgressBar,
}

impl Dispatcher {
    /// Create a dispatcher; invalid configuration is rejected here.
    pub fn new(
        name: impl Into<String>,
        config: JobConfig,
        shutdown: Shutdown,
    ) -> Result<Self, JobError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            shutdown,
            clock: Arc::new(SystemClock),
            progress: ProgressBar::hidden(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    /// Run `work` over every enumerated item not yet in `ledger`.
    ///
    /// Returns `Err` only if the worker pool cannot be built. Enumeration and
    /// sink failures abort the run and are reported in
    /// [`JobSummary::aborted`]; whatever was sunk before stays valid.
    pub fn run<P, R, I, F>(
        &self,
        items: I,
        ledger: &Ledger,
        sink: &dyn Sink<R>,
        work: F,
    ) -> Result<JobSummary, JobError>
    where
        I: IntoIterator<Item = Result<WorkItem<P>, JobError>>,
        I::IntoIter: Send,
        P: Send,
        F: Fn(&WorkItem<P>) -> CallResult<R> + Sync,
    {
        let start = Instant::now();
        let workers = self.config.worker_count;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers + 1)
            .thread_name({
                let name = self.name.clone();
                move |i| format!("{name}-{i}")
            })
            .build()
            .map_err(|e| JobError::Config(format!("failed to create worker pool: {e}")))?;

        let state = JobState::default();
        let gate = BatchGate::new(self.config.batch_size, self.config.batch_delay);
        let (tx, rx) = mpsc::sync_channel::<WorkItem<P>>(self.config.queue_capacity);
        let rx = Mutex::new(Some(rx));
        let live_lanes = AtomicUsize::new(workers);
        let items = items.into_iter();

        log::info!(
            "{}: {} lanes, {:?} spacing, {} already complete",
            self.name,
            workers,
            self.config.request_delay,
            fmt_num(ledger.len())
        );

        pool.install(|| {
            rayon::scope(|s| {
                let state = &state;
                s.spawn(move |_| self.produce(items, ledger, tx, state));
                for lane in 0..workers {
                    let (rx, gate, live_lanes, work) = (&rx, &gate, &live_lanes, &work);
                    s.spawn(move |_| {
                        self.consume(lane, rx, gate, ledger, sink, work, state);
                        // Last lane out drops the receiver so a blocked producer wakes up
                        if live_lanes.fetch_sub(1, Ordering::SeqCst) == 1 {
                            rx.lock().expect("queue lock poisoned").take();
                        }
                    });
                }
            });
        });

        self.progress.finish_and_clear();
        let summary =
            state.into_summary(&self.name, self.shutdown.is_requested(), start.elapsed());
        Ok(summary)
    }

    /// Producer lane: ledger filter, in-run dedupe, bounded hand-off.
    fn produce<P>(
        &self,
        items: impl Iterator<Item = Result<WorkItem<P>, JobError>>,
        ledger: &Ledger,
        tx: mpsc::SyncSender<WorkItem<P>>,
        state: &JobState,
    ) {
        let mut seen = FxHashSet::default();
        for item in items {
            if self.shutdown.is_requested() || state.is_aborted() {
                break;
            }
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    state.abort(e.to_string());
                    break;
                }
            };
            state.enumerated.fetch_add(1, Ordering::Relaxed);
            if !seen.insert(item.id.clone()) {
                log::debug!("{}: duplicate in listing, dispatched once", item.id);
                continue;
            }
            if ledger.is_complete(&item.id) {
                state.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if tx.send(item).is_err() {
                // Every lane has exited
                break;
            }
        }
    }

    /// Worker lane: strictly sequential, one call in flight at a time.
    #[allow(clippy::too_many_arguments)]
    fn consume<P, R>(
        &self,
        lane: usize,
        rx: &Mutex<Option<Receiver<WorkItem<P>>>>,
        gate: &BatchGate,
        ledger: &Ledger,
        sink: &dyn Sink<R>,
        work: &(impl Fn(&WorkItem<P>) -> CallResult<R> + Sync),
        state: &JobState,
    ) {
        let policy = self.config.retry_policy();
        let clock = self.clock.as_ref();
        let mut pacer = Pacer {
            delay: self.config.request_delay,
            last_start: None,
            clock,
        };

        loop {
            if self.shutdown.is_requested() || state.is_aborted() {
                break;
            }
            gate.wait(&self.shutdown);

            let next = {
                let guard = rx.lock().expect("queue lock poisoned");
                let Some(rx) = guard.as_ref() else { break };
                rx.recv_timeout(RECV_POLL)
            };
            let item = match next {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            state.attempted.fetch_add(1, Ordering::Relaxed);
            let label = format!("lane {lane} {}", item.id);
            let mut paced_out = false;
            let outcome = policy.run(&label, clock, &self.shutdown, || {
                if !pacer.pace(&self.shutdown) {
                    paced_out = true;
                    return Err(CallError::fatal("interrupted"));
                }
                state.enter_call();
                let res = work(&item);
                state.leave_call();
                res
            });
            let outcome = if paced_out {
                Err(Abandoned::Interrupted)
            } else {
                outcome
            };

            match outcome {
                Ok(result) => {
                    if let Err(e) = sink.append(&item.id, result) {
                        state.abort(
                            JobError::Sink {
                                id: item.id.clone(),
                                source: e,
                            }
                            .to_string(),
                        );
                        break;
                    }
                    ledger.mark_complete(&item.id);
                    state.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.progress.inc(1);
                    gate.record_success(clock, &self.shutdown);
                }
                Err(Abandoned::Interrupted) => {
                    log::debug!("{}: interrupted, left for the next run", item.id);
                    break;
                }
                Err(abandoned) => {
                    state.fail(item.id, abandoned.reason());
                    self.progress.inc(1);
                }
            }
        }
    }
}

/// Outcome of one job run.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub name: String,
    /// Distinct and duplicate items yielded by the enumerator
    pub enumerated: usize,
    /// Already complete in the ledger
    pub skipped: usize,
    /// Dequeued by a lane
    pub attempted: usize,
    pub succeeded: usize,
    /// Items given up on, with the reason, in failure order
    pub item_fatal: Vec<(ItemId, String)>,
    /// Highest number of simultaneous in-flight calls observed
    pub peak_in_flight: usize,
    pub interrupted: bool,
    /// Job-fatal reason, if the run was aborted
    pub aborted: Option<String>,
    pub elapsed: Duration,
}

impl JobSummary {
    /// 130 interrupted, 1 any failure, 0 full completion
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            130
        } else if self.aborted.is_some() || !self.item_fatal.is_empty() {
            1
        } else {
            0
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// Format summary table as a string.
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new(&self.name)
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
            ]);

        table.add_row(vec![Cell::new("Enumerated"), Cell::new(fmt_num(self.enumerated))]);
        table.add_row(vec![
            Cell::new("Skipped (done)"),
            Cell::new(fmt_num(self.skipped)),
        ]);
        table.add_row(vec![Cell::new("Attempted"), Cell::new(fmt_num(self.attempted))]);
        table.add_row(vec![
            Cell::new("Succeeded").fg(Color::Green),
            Cell::new(fmt_num(self.succeeded)).fg(Color::Green),
        ]);
        let failed_color = if self.item_fatal.is_empty() {
            Color::Reset
        } else {
            Color::Red
        };
        table.add_row(vec![
            Cell::new("Item-fatal").fg(failed_color),
            Cell::new(fmt_num(self.item_fatal.len())).fg(failed_color),
        ]);
        for (id, reason) in self.item_fatal.iter().take(TABLE_FAILURE_ROWS) {
            table.add_row(vec![Cell::new(format!("  {id}")), Cell::new(reason)]);
        }
        if self.item_fatal.len() > TABLE_FAILURE_ROWS {
            table.add_row(vec![
                Cell::new("  ..."),
                Cell::new(format!(
                    "{} more",
                    self.item_fatal.len() - TABLE_FAILURE_ROWS
                )),
            ]);
        }
        if let Some(reason) = &self.aborted {
            table.add_row(vec![
                Cell::new("Aborted").fg(Color::Red),
                Cell::new(reason).fg(Color::Red),
            ]);
        }
        if self.interrupted {
            table.add_row(vec![
                Cell::new("Interrupted").fg(Color::Yellow),
                Cell::new("resume by re-running"),
            ]);
        }
        table.add_row(vec![
            Cell::new("Elapsed"),
            Cell::new(format!("{:.1}s", self.elapsed.as_secs_f64())),
        ]);
        table.to_string()
    }

    /// Print summary table to stderr (TTY mode).
    pub fn print(&self) {
        eprintln!("{}", self.format_table());
    }

    /// Log summary (non-TTY mode).
    pub fn log(&self) {
        log::info!(
            "{}: {} succeeded, {} failed, {} skipped ({} attempted) [{:.1}s]",
            self.name,
            fmt_num(self.succeeded),
            fmt_num(self.item_fatal.len()),
            fmt_num(self.skipped),
            fmt_num(self.attempted),
            self.elapsed.as_secs_f64()
        );
        for (id, reason) in &self.item_fatal {
            log::warn!("{}: item-fatal {id}: {reason}", self.name);
        }
        if let Some(reason) = &self.aborted {
            log::error!("{}: aborted: {reason}", self.name);
        }
        if self.interrupted {
            log::warn!("{}: interrupted, re-run to resume", self.name);
        }
    }
}
