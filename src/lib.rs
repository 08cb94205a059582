//! Snapshot restore orchestration for a sharded, transactional key-value cluster.
//!
//! The crate sequences a restore against external collaborators (schema bootstrapper,
//! file importer, cluster metadata service, checksum executor): it creates schema,
//! derives key rewrite rules, streams data segments through a bounded worker pool,
//! coordinates the cluster ingest mode, replays schema history and validates checksums.

pub mod config;
pub mod errors;
pub mod metadata;
pub mod restore;
pub mod utils;

pub use errors::{RestoreError, Result};
