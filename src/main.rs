//! Snapshot restore planner
//!
//! Loads `config.json` and the snapshot metadata it points at, then logs what a restore
//! would create, import and replay. Running the restore itself needs cluster
//! collaborators wired through `kvrestore::restore::run_restore_flow`.

use anyhow::{Context, Result};
use kvrestore::config::{AppConfig, load_restore_config_from_json};
use kvrestore::restore::{RestorePlan, read_snapshot_metadata};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvrestore=info,warn")),
        )
        .init();

    match run_app().await {
        Ok(_) => {
            tracing::info!("operation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = ?e, "operation failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    let restore_config =
        load_restore_config_from_json(&app_config.raw_json_config, app_config.spaces_config.is_some())
            .context("Failed to load restore configuration from JSON")?;
    tracing::info!(storage = %restore_config.storage, pd = ?restore_config.pd_endpoints, "planning restore");

    let backup_meta = read_snapshot_metadata(&app_config, &restore_config)
        .await
        .context("Failed to read snapshot metadata")?;
    tracing::info!(
        start_version = backup_meta.start_version,
        end_version = backup_meta.end_version,
        backed_up_at = ?kvrestore::restore::cluster::ts_to_datetime(backup_meta.end_version),
        "loaded snapshot metadata"
    );

    let plan = RestorePlan::build(&backup_meta, restore_config.filter.as_ref())
        .context("Failed to build restore plan")?;
    plan.log_summary();
    for job in kvrestore::restore::history::replay_order(&plan.ddl_jobs) {
        tracing::info!(version = job.schema_version, db = %job.schema_name, query = %job.query, "planned schema change");
    }
    Ok(())
}
