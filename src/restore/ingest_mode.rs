// kvrestore/src/restore/ingest_mode.rs
//! Cluster-wide control broadcasts: ingest mode and per-store download rate limit.
//!
//! Both walk the live stores one at a time and abort on the first store that cannot be
//! reached. Stores updated before the failure keep the new setting; the caller retries
//! the whole broadcast.

use anyhow::anyhow;

use crate::errors::{RestoreError, Result};
use crate::restore::client::RestoreClient;
use crate::restore::cluster::IngestMode;

impl RestoreClient {
    pub async fn switch_to_import_mode(&self) -> Result<()> {
        self.switch_ingest_mode(IngestMode::Import).await
    }

    pub async fn switch_to_normal_mode(&self) -> Result<()> {
        self.switch_ingest_mode(IngestMode::Normal).await
    }

    /// Sends `mode` to every live store over its own short-lived connection.
    pub async fn switch_ingest_mode(&self, mode: IngestMode) -> Result<()> {
        let stores = self
            .collaborators
            .cluster
            .list_live_stores()
            .await
            .map_err(|cause| RestoreError::cluster("list live stores", cause))?;
        let options = self.config.switch_mode;

        for store in &stores {
            let broadcast_err = |cause| RestoreError::Broadcast {
                store_id: store.id,
                address: store.address.clone(),
                cause,
            };

            let dial = self.collaborators.connector.connect(&store.address, &options);
            let mut conn = match tokio::time::timeout(options.connect_timeout, dial).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(cause)) => return Err(broadcast_err(cause)),
                Err(_) => {
                    return Err(broadcast_err(anyhow!(
                        "connect timed out after {:?}",
                        options.connect_timeout
                    )));
                }
            };

            if let Err(cause) = conn.switch_mode(mode).await {
                if let Err(close_err) = conn.close().await {
                    tracing::warn!(store = store.id, error = %format!("{close_err:#}"), "close connection failed after switch mode error");
                }
                return Err(broadcast_err(cause));
            }
            if let Err(err) = conn.close().await {
                tracing::error!(store = store.id, error = %format!("{err:#}"), "close connection failed in switch mode");
                continue;
            }
            tracing::debug!(store = store.id, address = %store.address, %mode, "switched store mode");
        }
        tracing::info!(stores = stores.len(), %mode, "switched cluster ingest mode");
        Ok(())
    }

    /// Caps the download rate of every live store. Runs once per client; later calls
    /// are no-ops, and a failed attempt leaves it to be retried by the next batch.
    pub async fn apply_rate_limit(&self) -> Result<()> {
        let rate = self.config.rate_limit;
        if rate == 0 {
            return Ok(());
        }
        self.rate_limited
            .get_or_try_init(|| async {
                let stores = self
                    .collaborators
                    .cluster
                    .list_live_stores()
                    .await
                    .map_err(|cause| RestoreError::cluster("list live stores", cause))?;
                for store in &stores {
                    self.collaborators
                        .importer
                        .set_download_speed_limit(store.id, rate)
                        .await
                        .map_err(|cause| RestoreError::Broadcast {
                            store_id: store.id,
                            address: store.address.clone(),
                            cause,
                        })?;
                }
                tracing::info!(stores = stores.len(), rate, "applied download rate limit");
                Ok::<(), RestoreError>(())
            })
            .await?;
        Ok(())
    }
}
