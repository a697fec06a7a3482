//! chemharvest querygen - synthetic query generation over tabular rows
//!
//! Every row of an input CSV gets one generated question about its text,
//! either through synchronous chat completions (`run`) or through the async
//! batch API (`submit`, then `collect`). Both modes resume from their result
//! sinks under `root_dir`, and `merge` joins the results back onto the input
//! identity columns as `results.csv`.

pub mod batch;
pub mod config;
pub mod generation;
pub mod input;
pub mod runner;
pub mod sample;

// Re-exports
pub use batch::OpenAiBatch;
pub use config::{Config, SampleConfig};
pub use generation::{ChatClient, Generation, extract_question, split_reasoning};
pub use runner::{collect, merge, run, submit};
