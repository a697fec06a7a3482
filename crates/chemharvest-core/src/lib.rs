//! chemharvest-core - resumable batch-job orchestration
//!
//! Enumerate work items, skip the ones the ledger already holds, dispatch
//! the rest through rate-limited worker lanes (or remote batch jobs), append
//! every result to a durable sink, and merge the sink into a final table.

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod enumerate;
pub mod error;
pub mod item;
pub mod ledger;
pub mod logging;
pub mod merge;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod stream;

// Re-exports for convenience
pub use batch::{BatchBackend, BatchHandle, BatchResponse, BatchRunner, BatchStatus, HandleStore, Shard};
pub use config::{BatchConfig, JobConfig, JobOverrides};
pub use dispatch::{Dispatcher, JobState, JobSummary};
pub use enumerate::{Cursor, IdRange, Page, PageSource, Paginated, from_list, from_rows};
pub use error::{CallError, CallResult, JobError};
pub use item::{CompletionRecord, ItemId, WorkItem};
pub use ledger::{Ledger, is_pdf_bytes, is_valid_json, is_valid_pdf};
pub use logging::{IndicatifLogger, init_logging};
pub use merge::{IdentityTable, MergeReport, merge_csv};
pub use progress::{ProgressContext, fmt_num};
pub use retry::{Abandoned, Clock, RetryPolicy, SystemClock};
pub use shutdown::Shutdown;
pub use sink::{FileSink, JsonlSink, Sink, cleanup_tmp_files, read_records, write_atomic};
pub use stream::{SHARED_RUNTIME, StreamError, http_client};
