use anyhow::Result;
use async_trait::async_trait;

use crate::metadata::DataSegment;
use crate::restore::rewrite::RewriteRules;

/// Transfers and ingests data segments into the target cluster.
#[async_trait]
pub trait FileImporter: Send + Sync {
    /// Downloads `segment`, rewrites its keys with `rules`, and ingests it.
    async fn import(&self, segment: &DataSegment, rules: &RewriteRules) -> Result<()>;

    /// Caps the download throughput of one store, in bytes per second.
    async fn set_download_speed_limit(&self, store_id: u64, rate: u64) -> Result<()>;
}
