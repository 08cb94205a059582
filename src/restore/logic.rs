// kvrestore/src/restore/logic.rs
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{AppConfig, RestoreConfig, TableFilter};
use crate::errors::{RestoreError, Result};
use crate::metadata::{Database, DataSegment, DatabaseInfo, SchemaChangeEvent, SnapshotMetadata, Table};
use crate::restore::client::RestoreClient;
use crate::restore::history::filter_ddl_jobs;
use crate::restore::s3_download;
use crate::utils::ProgressCounter;

/// What a restore run will touch, derived from the snapshot and the table filter.
#[derive(Debug, Clone, Default)]
pub struct RestorePlan {
    pub databases: Vec<DatabaseInfo>,
    pub tables: Vec<Table>,
    pub files: Vec<DataSegment>,
    pub ddl_jobs: Vec<SchemaChangeEvent>,
    pub incremental: bool,
}

impl RestorePlan {
    /// Plans straight from snapshot metadata, without a client.
    pub fn build(meta: &SnapshotMetadata, filter: Option<&TableFilter>) -> Result<Self> {
        Self::select(&meta.load_databases(), &meta.sorted_ddls(), meta.is_incremental(), filter)
    }

    /// Plans from the snapshot loaded by `client.init_backup_meta`.
    pub fn for_client(client: &RestoreClient, filter: Option<&TableFilter>) -> Result<Self> {
        client.backup_meta()?;
        Self::select(client.databases(), client.ddl_jobs(), client.is_incremental(), filter)
    }

    fn select(
        databases: &BTreeMap<String, Database>,
        history: &[SchemaChangeEvent],
        incremental: bool,
        filter: Option<&TableFilter>,
    ) -> Result<Self> {
        if let Some(filter) = filter {
            for (db, tables) in &filter.databases {
                let Some(found) = databases.get(&db.to_lowercase()) else {
                    return Err(RestoreError::Config(format!("database '{}' is not in the snapshot", db)));
                };
                for table in tables.iter().flatten() {
                    if found.get_table(table).is_none() {
                        return Err(RestoreError::Config(format!(
                            "table `{}`.`{}` is not in the snapshot",
                            db, table
                        )));
                    }
                }
            }
        }

        let mut plan = RestorePlan {
            incremental,
            ..Default::default()
        };
        for db in databases.values() {
            if !filter.map_or(true, |f| f.matches_database(&db.info.name)) {
                continue;
            }
            plan.databases.push(db.info.clone());
            for table in &db.tables {
                if filter.map_or(true, |f| f.matches(&db.info.name, &table.info.name)) {
                    plan.files.extend(table.files.iter().cloned());
                    plan.tables.push(table.clone());
                }
            }
        }
        if plan.incremental {
            plan.ddl_jobs = filter_ddl_jobs(history, &plan.tables);
        }
        Ok(plan)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            databases = self.databases.len(),
            tables = self.tables.len(),
            files = self.files.len(),
            bytes = self.total_bytes(),
            ddl_jobs = self.ddl_jobs.len(),
            incremental = self.incremental,
            "restore plan"
        );
        for table in &self.tables {
            tracing::info!(
                table = %table.qualified_name(),
                files = table.files.len(),
                total_kvs = table.total_kvs,
                total_bytes = table.total_bytes,
                "planned table"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub databases: usize,
    pub tables: usize,
    pub files: u64,
    pub ddl_jobs: usize,
    pub checksummed_tables: u64,
}

/// Reads the snapshot metadata from a local directory or an S3 location.
pub async fn read_snapshot_metadata(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
) -> Result<SnapshotMetadata> {
    let location = restore_config.backupmeta_location();
    let bytes = if restore_config.is_s3_storage() {
        let spaces = app_config.spaces_config.as_ref().ok_or_else(|| {
            RestoreError::Config("storage is an S3 URI but s3_storage is not configured".to_string())
        })?;
        s3_download::download_object_bytes(spaces, &location)
            .await
            .map_err(|cause| RestoreError::Storage {
                location: location.clone(),
                cause,
            })?
    } else {
        tokio::fs::read(Path::new(&location)).await.map_err(|e| RestoreError::Storage {
            location: location.clone(),
            cause: e.into(),
        })?
    };
    SnapshotMetadata::from_slice(&bytes)
}

/// Runs a full restore of `plan`.
///
/// Order: clock reset (full snapshots), schema creation, import mode, segment batches,
/// normal mode, schema-history replay (incremental snapshots), checksum validation.
pub async fn perform_restore_orchestration(client: &RestoreClient, plan: &RestorePlan) -> Result<RestoreSummary> {
    let started_at = Utc::now();
    let start = Instant::now();
    let config = client.config();
    let run = client.run_token();
    plan.log_summary();

    client.backup_meta()?;
    let incremental = client.is_incremental();
    if plan.incremental != incremental {
        return Err(RestoreError::InvalidInput(format!(
            "plan has incremental={} but the loaded snapshot has incremental={}",
            plan.incremental, incremental
        )));
    }

    let planned: HashSet<i64> = plan.tables.iter().map(|t| t.info.id).collect();
    if let Some(file) = plan.files.iter().find(|f| !planned.contains(&f.table_id)) {
        return Err(RestoreError::InvalidInput(format!(
            "segment {} belongs to table {} which is not part of the plan",
            file.name, file.table_id
        )));
    }

    if !incremental {
        client.reset_ts(&config.pd_endpoints).await?;
    }

    client.create_databases(&plan.databases).await?;
    let new_ts = if incremental { client.get_ts().await? } else { 0 };
    let (rewrite_rules, new_tables) = client.create_tables(&plan.tables, new_ts).await?;

    let file_progress = ProgressCounter::new("files", plan.files.len() as u64);
    let switch_mode = !client.is_online();
    if switch_mode {
        client.switch_to_import_mode().await?;
    }
    let mut restored = Ok(());
    for batch in plan.files.chunks(config.batch_size.max(1)) {
        restored = client.restore_files(batch, &rewrite_rules, &file_progress, &run).await;
        if restored.is_err() {
            break;
        }
    }
    if switch_mode {
        let normal = client.switch_to_normal_mode().await;
        if let Err(err) = &normal {
            tracing::error!(error = %err, "failed to switch cluster back to normal mode");
        }
        restored?;
        normal?;
    } else {
        restored?;
    }

    if incremental {
        client.exec_ddls(&plan.ddl_jobs).await?;
    }

    let checksum_progress = ProgressCounter::new("checksum", plan.tables.len() as u64);
    if config.checksum && !incremental {
        client
            .validate_checksums(&plan.tables, &new_tables, &checksum_progress, &run)
            .await?;
    } else {
        tracing::info!(incremental, "skipping checksum validation");
    }

    let summary = RestoreSummary {
        started_at,
        elapsed: start.elapsed(),
        databases: plan.databases.len(),
        tables: plan.tables.len(),
        files: file_progress.count(),
        ddl_jobs: plan.ddl_jobs.len(),
        checksummed_tables: checksum_progress.count(),
    };
    tracing::info!(
        started_at = %summary.started_at.to_rfc3339(),
        take = ?summary.elapsed,
        files = summary.files,
        tables = summary.tables,
        "restore finished"
    );
    Ok(summary)
}
