use thiserror::Error;

use crate::restore::verification::ChecksumReport;

/// Failures surfaced by a restore run.
///
/// Collaborator errors arrive as `anyhow::Error` and are wrapped here with the phase and
/// the object they concern, so a log line is enough to retrace what broke.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Snapshot metadata error: {0}")]
    Metadata(String),

    #[error("Schema creation failed for {object}: {cause:#}")]
    Schema { object: String, cause: anyhow::Error },

    #[error("Import failed for segment {segment}: {cause:#}")]
    Import { segment: String, cause: anyhow::Error },

    #[error("Checksum validation failed: {0}")]
    ChecksumMismatch(ChecksumReport),

    #[error("Checksum task for {table} could not be scheduled: {cause:#}")]
    Checksum { table: String, cause: anyhow::Error },

    #[error("Broadcast to store {store_id} ({address}) failed: {cause:#}")]
    Broadcast {
        store_id: u64,
        address: String,
        cause: anyhow::Error,
    },

    #[error("Advancing cluster clock failed after {attempts} attempt(s): {cause:#}")]
    ClockAdvance { attempts: u32, cause: anyhow::Error },

    #[error("Cluster metadata request '{operation}' failed: {cause:#}")]
    Cluster {
        operation: &'static str,
        cause: anyhow::Error,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage operation failed for {location}: {cause:#}")]
    Storage { location: String, cause: anyhow::Error },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    pub(crate) fn cluster(operation: &'static str, cause: anyhow::Error) -> Self {
        RestoreError::Cluster { operation, cause }
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
