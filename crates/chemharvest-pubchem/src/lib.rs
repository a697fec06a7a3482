//! chemharvest PubChem - compound record harvesting
//!
//! `download` fetches the PUG-View JSON record of every CID in a range (or a
//! predefined list) into `cid_{cid}.json` files, skipping records already on
//! disk. `parse` turns those files into two flat tables: one row per compound
//! and one row per cited record description.

pub mod config;
pub mod download;
pub mod parse;
pub mod runner;

// Re-exports
pub use config::Config;
pub use parse::{ParseSummary, parse_record};
pub use runner::{download, parse};
