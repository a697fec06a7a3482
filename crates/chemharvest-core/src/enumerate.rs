//! Work-item enumerators: paginated listings, id ranges, tabular rows.
//!
//! Every enumerator is a lazy iterator of `Result<WorkItem<P>, JobError>`;
//! an `Err` is job-fatal and is always the last element.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{CallResult, JobError};
use crate::item::{ItemId, WorkItem};
use crate::retry::{Abandoned, Clock, RetryPolicy};
use crate::shutdown::Shutdown;

/// Position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Number of items to skip
    Offset(u64),
    /// Opaque continuation token
    Token(String),
}

/// One page of a listing.
#[derive(Debug)]
pub struct Page<P> {
    pub items: Vec<WorkItem<P>>,
    /// Entries the source received but dropped while decoding (no usable id)
    pub skipped: usize,
    /// `None` marks the last page
    pub next: Option<Cursor>,
}

/// Remote listing interface.
pub trait PageSource {
    type Payload;

    /// Cursor of the first page
    fn first_cursor(&self) -> Cursor {
        Cursor::Offset(0)
    }

    /// Fetch and decode one page. A decode failure must be classified fatal.
    fn fetch_page(&self, cursor: &Cursor) -> CallResult<Page<Self::Payload>>;
}

/// Lazy enumerator over a [`PageSource`].
///
/// The cursor only advances after a page was fetched and decoded; listing
/// calls get the same retry discipline as item work.
pub struct Paginated<S: PageSource> {
    source: S,
    cursor: Option<Cursor>,
    buffer: VecDeque<WorkItem<S::Payload>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    pages: usize,
}

impl<S: PageSource> Paginated<S> {
    pub fn new(source: S, retry: RetryPolicy, clock: Arc<dyn Clock>, shutdown: Shutdown) -> Self {
        let cursor = Some(source.first_cursor());
        Self {
            source,
            cursor,
            buffer: VecDeque::new(),
            retry,
            clock,
            shutdown,
            pages: 0,
        }
    }

    /// Pages fetched so far
    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl<S: PageSource> Iterator for Paginated<S> {
    type Item = Result<WorkItem<S::Payload>, JobError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            let cursor = self.cursor.take()?;
            if self.shutdown.is_requested() {
                return None;
            }
            let label = format!("page {}", self.pages);
            let source = &self.source;
            match self.retry.run(&label, self.clock.as_ref(), &self.shutdown, || {
                source.fetch_page(&cursor)
            }) {
                Ok(page) => {
                    self.pages += 1;
                    // Only a page with nothing on it ends the listing
                    if page.items.is_empty() && page.skipped == 0 {
                        log::debug!("{label}: empty, listing finished");
                        return None;
                    }
                    if page.skipped > 0 {
                        log::debug!("{label}: {} entries without id skipped", page.skipped);
                    }
                    self.cursor = page.next;
                    self.buffer.extend(page.items);
                }
                Err(Abandoned::Interrupted) => return None,
                Err(e) => {
                    log::error!("{label}: listing failed: {}", e.reason());
                    return Some(Err(JobError::Enumeration(format!(
                        "{label}: {}",
                        e.reason()
                    ))));
                }
            }
        }
    }
}

/// Inclusive range of integer ids, payload = the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u64,
    pub stop: u64,
}

impl IdRange {
    pub const fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    /// Number of ids in the range (0 if `start > stop`)
    pub fn len(&self) -> u64 {
        if self.start > self.stop {
            0
        } else {
            self.stop - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntoIterator for IdRange {
    type Item = Result<WorkItem<u64>, JobError>;
    type IntoIter = std::iter::Map<std::ops::RangeInclusive<u64>, fn(u64) -> Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        fn to_item(n: u64) -> Result<WorkItem<u64>, JobError> {
            Ok(WorkItem::new(n, n))
        }
        let range = if self.start > self.stop {
            // Empty inclusive range
            1..=0
        } else {
            self.start..=self.stop
        };
        range.map(to_item as fn(u64) -> Self::Item)
    }
}

/// Enumerate a predefined list of integer ids, in list order.
pub fn from_list(ids: Vec<u64>) -> impl Iterator<Item = Result<WorkItem<u64>, JobError>> + Send {
    ids.into_iter().map(|n| Ok(WorkItem::new(n, n)))
}

/// Enumerate tabular rows, deriving each id from its identifying columns.
pub fn from_rows<T: Send>(
    rows: Vec<T>,
    id_of: impl Fn(&T) -> ItemId + Send,
) -> impl Iterator<Item = Result<WorkItem<T>, JobError>> + Send {
    rows.into_iter().map(move |row| {
        let id = id_of(&row);
        Ok(WorkItem { id, payload: row })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::retry::tests::RecordingClock;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves `pages` of ids; scripted failures are consumed front to back.
    struct FakeListing {
        pages: Vec<Vec<&'static str>>,
        failures: Mutex<VecDeque<CallError>>,
        calls: Mutex<Vec<Cursor>>,
    }

    impl FakeListing {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                failures: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageSource for FakeListing {
        type Payload = ();

        fn fetch_page(&self, cursor: &Cursor) -> CallResult<Page<()>> {
            self.calls.lock().unwrap().push(cursor.clone());
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            let Cursor::Offset(n) = cursor else {
                return Err(CallError::fatal("unexpected token cursor"));
            };
            let idx = *n as usize;
            // "" stands for an entry without an id
            let page = self.pages.get(idx).cloned().unwrap_or_default();
            let skipped = page.iter().filter(|id| id.is_empty()).count();
            let items = page
                .into_iter()
                .filter(|id| !id.is_empty())
                .map(|id| WorkItem::new(id, ()))
                .collect();
            Ok(Page {
                items,
                skipped,
                next: Some(Cursor::Offset(*n + 1)),
            })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), None)
    }

    fn ids<P>(items: Vec<Result<WorkItem<P>, JobError>>) -> Vec<String> {
        items
            .into_iter()
            .map(|r| r.unwrap().id.to_string())
            .collect()
    }

    #[test]
    fn pages_until_empty() {
        let listing = FakeListing::new(vec![vec!["a", "b"], vec!["c"]]);
        let clock = Arc::new(RecordingClock::default());
        let items: Vec<_> = Paginated::new(listing, policy(), clock, Shutdown::new()).collect();
        assert_eq!(ids(items), vec!["a", "b", "c"]);
    }

    #[test]
    fn page_of_skipped_entries_does_not_end_listing() {
        let listing = FakeListing::new(vec![vec!["a"], vec!["", ""], vec!["b"]]);
        let clock = Arc::new(RecordingClock::default());
        let mut it = Paginated::new(listing, policy(), clock, Shutdown::new());
        let got: Vec<_> = it.by_ref().collect();
        assert_eq!(ids(got), vec!["a", "b"]);
        assert_eq!(it.pages(), 4);
    }

    #[test]
    fn empty_first_page_yields_nothing() {
        let listing = FakeListing::new(vec![]);
        let clock = Arc::new(RecordingClock::default());
        let mut it = Paginated::new(listing, policy(), clock, Shutdown::new());
        assert!(it.next().is_none());
        assert_eq!(it.pages(), 1);
    }

    #[test]
    fn retryable_listing_failure_is_retried_same_cursor() {
        let listing = FakeListing::new(vec![vec!["a"]]);
        listing
            .failures
            .lock()
            .unwrap()
            .push_back(CallError::retryable("HTTP 503"));
        let clock = Arc::new(RecordingClock::default());
        let mut it = Paginated::new(listing, policy(), clock.clone(), Shutdown::new());
        assert_eq!(it.next().unwrap().unwrap().id, ItemId::from("a"));
        assert!(it.next().is_none());
        assert_eq!(clock.sleeps.lock().unwrap().len(), 1);
        let calls = it.source.calls.lock().unwrap().clone();
        assert_eq!(calls[0], Cursor::Offset(0));
        assert_eq!(calls[1], Cursor::Offset(0));
    }

    #[test]
    fn malformed_page_is_job_fatal_and_terminal() {
        let listing = FakeListing::new(vec![vec!["a"], vec!["b"]]);
        let clock = Arc::new(RecordingClock::default());
        let mut it = Paginated::new(listing, policy(), clock, Shutdown::new());
        assert!(it.next().unwrap().is_ok());
        it.source
            .failures
            .lock()
            .unwrap()
            .push_back(CallError::fatal("decode error: expected value"));
        assert!(matches!(it.next(), Some(Err(JobError::Enumeration(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn id_range_inclusive() {
        let items: Vec<_> = IdRange::new(3, 5).into_iter().collect();
        assert_eq!(ids(items), vec!["3", "4", "5"]);
        assert_eq!(IdRange::new(3, 5).len(), 3);
        assert!(IdRange::new(6, 5).is_empty());
        assert_eq!(IdRange::new(6, 5).into_iter().count(), 0);
    }

    #[test]
    fn rows_use_identifying_columns() {
        let rows = vec![("p1", 1), ("p1", 2)];
        let items: Vec<_> =
            from_rows(rows, |(doc, para)| ItemId::composite(&[doc.to_string(), para.to_string()]))
                .collect();
        assert_eq!(ids(items), vec![r#"["p1","1"]"#, r#"["p1","2"]"#]);
    }

    #[test]
    fn list_keeps_order() {
        let items: Vec<_> = from_list(vec![9, 2, 5]).collect();
        assert_eq!(ids(items), vec!["9", "2", "5"]);
    }
}
