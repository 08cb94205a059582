// kvrestore/src/restore/client.rs
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::RestoreConfig;
use crate::errors::{RestoreError, Result};
use crate::metadata::{DataSegment, Database, SchemaChangeEvent, SnapshotMetadata};
use crate::restore::cluster::{ClockResetter, ClusterMetadata, NodeConnector};
use crate::restore::db_restore::SchemaBootstrapper;
use crate::restore::import::FileImporter;
use crate::restore::rewrite::RewriteRules;
use crate::restore::verification::ChecksumExecutor;
use crate::utils::{ProgressCounter, RetryError, WorkerPool, with_retry};

/// The external services a restore run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterMetadata>,
    pub clock: Arc<dyn ClockResetter>,
    pub connector: Arc<dyn NodeConnector>,
    pub importer: Arc<dyn FileImporter>,
    pub bootstrapper: Arc<dyn SchemaBootstrapper>,
    pub checksum: Arc<dyn ChecksumExecutor>,
}

/// Outcome reported by every segment task, including the ones that never ran.
#[derive(Debug)]
enum SegmentOutcome {
    Restored,
    Failed(RestoreError),
    Cancelled,
}

/// Drives one restore run against a target cluster.
///
/// An instance serves exactly one run: the rate limit is applied at most once per
/// instance, so concurrent or repeated runs must each build their own client.
pub struct RestoreClient {
    pub(crate) config: RestoreConfig,
    pub(crate) collaborators: Collaborators,
    lifetime: CancellationToken,
    file_pool: WorkerPool,
    pub(crate) rate_limited: OnceCell<()>,
    backup_meta: Option<SnapshotMetadata>,
    databases: BTreeMap<String, Database>,
    ddl_jobs: Vec<SchemaChangeEvent>,
}

impl RestoreClient {
    pub fn new(config: RestoreConfig, collaborators: Collaborators) -> Self {
        let file_pool = WorkerPool::new(config.concurrency, "file");
        Self {
            config,
            collaborators,
            lifetime: CancellationToken::new(),
            file_pool,
            rate_limited: OnceCell::new(),
            backup_meta: None,
            databases: BTreeMap::new(),
            ddl_jobs: Vec::new(),
        }
    }

    /// Loads schemas, segments and schema-change history from the snapshot metadata.
    pub fn init_backup_meta(&mut self, backup_meta: SnapshotMetadata) -> Result<()> {
        backup_meta.validate()?;
        self.databases = backup_meta.load_databases();
        self.ddl_jobs = backup_meta.sorted_ddls();
        tracing::info!(
            databases = self.databases.len(),
            jobs = self.ddl_jobs.len(),
            end_version = backup_meta.end_version,
            "loaded snapshot metadata"
        );
        self.backup_meta = Some(backup_meta);
        Ok(())
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.config.online
    }

    pub fn is_incremental(&self) -> bool {
        self.backup_meta.as_ref().is_some_and(|m| m.is_incremental())
    }

    pub fn backup_meta(&self) -> Result<&SnapshotMetadata> {
        self.backup_meta
            .as_ref()
            .ok_or_else(|| RestoreError::Metadata("snapshot metadata has not been loaded".to_string()))
    }

    /// Loaded databases keyed by lowercased name.
    pub fn databases(&self) -> &BTreeMap<String, Database> {
        &self.databases
    }

    pub fn ddl_jobs(&self) -> &[SchemaChangeEvent] {
        &self.ddl_jobs
    }

    /// A fresh cancellation scope for one restore run. Cancelling it leaves the client
    /// itself usable; `close` cancels every run derived from it.
    pub fn run_token(&self) -> CancellationToken {
        self.lifetime.child_token()
    }

    pub fn close(&self) {
        self.lifetime.cancel();
        tracing::info!("restore client closed");
    }

    pub async fn get_ts(&self) -> Result<u64> {
        self.collaborators
            .cluster
            .get_ts()
            .await
            .map_err(|cause| RestoreError::cluster("get timestamp", cause))
    }

    /// Advances the cluster clock to the snapshot's end version, rotating through
    /// `endpoints` on every attempt.
    pub async fn reset_ts(&self, endpoints: &[String]) -> Result<()> {
        if endpoints.is_empty() {
            return Err(RestoreError::Config("no metadata endpoints to reset the clock through".to_string()));
        }
        let restore_ts = self.backup_meta()?.end_version;
        tracing::info!(ts = restore_ts, physical = ?crate::restore::cluster::ts_to_datetime(restore_ts), "reset cluster timestamp");

        let clock = self.collaborators.clock.clone();
        let mut backoff = self.config.reset_ts.backoff();
        tracing::debug!(max_attempts = backoff.max_attempts(), endpoints = endpoints.len(), "reset ts retry budget");
        let result = with_retry(&self.lifetime, &mut backoff, |attempt| {
            let endpoint = endpoints[attempt as usize % endpoints.len()].clone();
            let clock = clock.clone();
            async move { clock.reset_ts(&endpoint, restore_ts).await }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(attempts, error = %format!("{last:#}"), "giving up on clock reset");
                Err(RestoreError::ClockAdvance { attempts, cause: last })
            }
            Err(RetryError::Cancelled { attempts }) => Err(RestoreError::Cancelled(format!(
                "clock reset interrupted after {attempts} attempt(s)"
            ))),
        }
    }

    /// Restores `files` concurrently; stops at the first failure.
    ///
    /// Every dispatched task reports exactly once. A failing task cancels `run`, so
    /// tasks not yet started and other phases of the same run stand down; the
    /// remaining reports are drained before the first error is returned.
    pub async fn restore_files(
        &self,
        files: &[DataSegment],
        rewrite_rules: &RewriteRules,
        progress: &ProgressCounter,
        run: &CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        tracing::debug!(files = files.len(), "start to restore files");

        if let Some(file) = files.iter().find(|f| !rewrite_rules.covers_table(f.table_id)) {
            return Err(RestoreError::Import {
                segment: file.name.clone(),
                cause: anyhow::anyhow!("no rewrite rule for table {}", file.table_id),
            });
        }
        self.apply_rate_limit().await?;

        let rules = Arc::new(rewrite_rules.clone());
        let (tx, mut rx) = mpsc::channel::<SegmentOutcome>(files.len().max(1));
        let mut dispatched = 0usize;

        for file in files {
            if run.is_cancelled() {
                break;
            }
            let tx = tx.clone();
            let run_task = run.clone();
            let importer = self.collaborators.importer.clone();
            let rules = rules.clone();
            let progress = progress.clone();
            let segment = file.clone();
            let task = async move {
                let outcome = tokio::select! {
                    biased;
                    _ = run_task.cancelled() => SegmentOutcome::Cancelled,
                    result = importer.import(&segment, &rules) => match result {
                        Ok(()) => {
                            progress.inc();
                            SegmentOutcome::Restored
                        }
                        Err(cause) => {
                            run_task.cancel();
                            SegmentOutcome::Failed(RestoreError::Import { segment: segment.name.clone(), cause })
                        }
                    },
                };
                let _ = tx.send(outcome).await;
            };

            let submitted = tokio::select! {
                biased;
                _ = run.cancelled() => false,
                applied = self.file_pool.apply(task) => {
                    applied.map_err(|cause| RestoreError::Import { segment: file.name.clone(), cause })?;
                    true
                }
            };
            if !submitted {
                break;
            }
            dispatched += 1;
        }
        drop(tx);

        let mut first_error: Option<RestoreError> = None;
        let mut cancelled = 0usize;
        let mut received = 0usize;
        while received < dispatched {
            let Some(outcome) = rx.recv().await else {
                first_error.get_or_insert_with(|| {
                    RestoreError::Cancelled(format!(
                        "{} segment task(s) exited without reporting",
                        dispatched - received
                    ))
                });
                break;
            };
            received += 1;
            match outcome {
                SegmentOutcome::Restored => {}
                SegmentOutcome::Cancelled => cancelled += 1,
                SegmentOutcome::Failed(err) => {
                    if first_error.is_none() {
                        tracing::error!(error = %err, "restore files failed");
                        run.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        let elapsed = start.elapsed();
        if let Some(err) = first_error {
            return Err(err);
        }
        if cancelled > 0 || dispatched < files.len() {
            return Err(RestoreError::Cancelled(format!(
                "restore of {} segment(s) cancelled before completion",
                files.len() - (dispatched - cancelled)
            )));
        }
        tracing::info!(files = files.len(), take = ?elapsed, "restore files");
        Ok(())
    }
}
