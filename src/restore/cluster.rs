// kvrestore/src/restore/cluster.rs
//! Cluster-side collaborators: the metadata/timestamp service, clock reset and the
//! per-store ingest control connection.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << PHYSICAL_SHIFT_BITS) - 1;

/// A live (not removed, not tombstoned) storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub id: u64,
    pub address: String,
}

#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    /// Allocates a fresh timestamp.
    async fn get_ts(&self) -> Result<u64>;

    /// Lists storage nodes, excluding removed ones.
    async fn list_live_stores(&self) -> Result<Vec<StoreInfo>>;
}

/// Pushes the cluster's timestamp oracle forward through one metadata endpoint.
#[async_trait]
pub trait ClockResetter: Send + Sync {
    async fn reset_ts(&self, endpoint: &str, ts: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Import,
    Normal,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestMode::Import => f.write_str("import"),
            IngestMode::Normal => f.write_str("normal"),
        }
    }
}

/// Dial parameters for one short-lived control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_backoff_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            max_backoff_delay: Duration::from_secs(3),
        }
    }
}

#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, address: &str, options: &ConnectOptions) -> Result<Box<dyn ImportControl>>;
}

/// Unary ingest-control calls on one store.
#[async_trait]
pub trait ImportControl: Send {
    async fn switch_mode(&mut self, mode: IngestMode) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

pub fn compose_ts(physical_ms: u64, logical: u64) -> u64 {
    (physical_ms << PHYSICAL_SHIFT_BITS) | (logical & LOGICAL_MASK)
}

pub fn physical_ms(ts: u64) -> u64 {
    ts >> PHYSICAL_SHIFT_BITS
}

/// Wall-clock time encoded in a timestamp, for logs.
pub fn ts_to_datetime(ts: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(i64::try_from(physical_ms(ts)).ok()?)
}
