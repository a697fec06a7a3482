//! chemharvest ChemRxiv - preprint metadata and PDF harvesting
//!
//! Two resumable stages over the ChemRxiv Engage public API:
//!
//! - `gather`: page through every listed preprint, append each new hit to a
//!   JSONL store and rebuild a flat metadata CSV from it.
//! - `download`: fetch the original PDF of every gathered preprint that is
//!   not yet on disk (or whose file is truncated).
//!
//! # Example
//!
//! ```ignore
//! use chemharvest_chemrxiv::{Config, gather};
//! use chemharvest_core::{ProgressContext, Shutdown};
//!
//! let summary = gather(&Config::default(), &Shutdown::new(), &ProgressContext::new())?;
//! summary.log();
//! ```

pub mod api;
pub mod config;
pub mod metadata;
pub mod runner;

// Re-exports
pub use api::ChemRxivApi;
pub use config::Config;
pub use runner::{download, gather, write_metadata_csv};
