pub mod client;
pub mod cluster;
pub mod db_restore;
pub mod history;
pub mod import;
pub mod ingest_mode;
pub(crate) mod logic;
pub(crate) mod s3_download;
pub mod rewrite;
pub mod verification;

pub use client::{Collaborators, RestoreClient};
pub use logic::{RestorePlan, RestoreSummary, perform_restore_orchestration, read_snapshot_metadata};

use crate::config::{AppConfig, RestoreConfig};
use crate::errors::Result;

/// Public entry point for the restore process: loads the snapshot metadata named by
/// the configuration, plans the run and drives it with `collaborators`.
///
/// Builds a fresh `RestoreClient` so every run owns its cancellation scope and its
/// one-shot rate-limit state.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
    collaborators: Collaborators,
) -> Result<RestoreSummary> {
    let backup_meta = read_snapshot_metadata(app_config, restore_config).await?;
    let mut client = RestoreClient::new(restore_config.clone(), collaborators);
    client.init_backup_meta(backup_meta)?;
    let plan = RestorePlan::for_client(&client, restore_config.filter.as_ref())?;

    let result = perform_restore_orchestration(&client, &plan).await;
    client.close();
    result
}
