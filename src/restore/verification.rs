// kvrestore/src/restore/verification.rs
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{RestoreError, Result};
use crate::metadata::{Table, TableInfo};
use crate::restore::client::RestoreClient;
use crate::restore::cluster::ClusterMetadata;
use crate::utils::{ProgressCounter, WorkerPool};

/// Digest computed by the cluster over a restored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumResponse {
    pub checksum: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
}

impl fmt::Display for ChecksumResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "crc64xor={} kvs={} bytes={}",
            self.checksum, self.total_kvs, self.total_bytes
        )
    }
}

#[async_trait]
pub trait ChecksumExecutor: Send + Sync {
    /// Computes the digest of `new_table` as of `start_ts`. `old_table` carries the
    /// snapshot identity so keys can be mapped back.
    async fn compute(
        &self,
        new_table: &TableInfo,
        old_table: &Table,
        start_ts: u64,
        progress: &(dyn Fn() + Send + Sync),
    ) -> AnyResult<ChecksumResponse>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub table: String,
    pub expected: ChecksumResponse,
    pub actual: ChecksumResponse,
}

/// A table whose checksum could not be computed at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFailure {
    pub table: String,
    pub reason: String,
}

/// Every problem found by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumReport {
    pub checked: usize,
    pub mismatches: Vec<ChecksumMismatch>,
    pub failures: Vec<ChecksumFailure>,
}

impl ChecksumReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.failures.is_empty()
    }
}

impl fmt::Display for ChecksumReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch(es), {} failure(s) across {} table(s)",
            self.mismatches.len(),
            self.failures.len(),
            self.checked
        )?;
        for m in &self.mismatches {
            write!(f, "; {}: expected {}, got {}", m.table, m.expected, m.actual)?;
        }
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.table, failure.reason)?;
        }
        Ok(())
    }
}

enum TableCheck {
    Passed,
    Mismatch(ChecksumMismatch),
    Failed(ChecksumFailure),
    Cancelled,
}

impl RestoreClient {
    /// Checks every restored table against its snapshot-time checksum.
    ///
    /// Unlike segment restoration this never stops early: all tables are checked and a
    /// single error lists every mismatch.
    pub async fn validate_checksums(
        &self,
        tables: &[Table],
        new_tables: &[TableInfo],
        progress: &ProgressCounter,
        run: &CancellationToken,
    ) -> Result<()> {
        if tables.len() != new_tables.len() {
            return Err(RestoreError::InvalidInput(format!(
                "{} snapshot tables but {} restored tables",
                tables.len(),
                new_tables.len()
            )));
        }
        let start = Instant::now();
        tracing::info!(tables = tables.len(), "start to validate checksum");

        let workers = WorkerPool::new(self.config.checksum_concurrency, "restore-checksum");
        let (tx, mut rx) = mpsc::channel::<TableCheck>(tables.len().max(1));
        for (table, new_table) in tables.iter().zip(new_tables) {
            let tx = tx.clone();
            let cluster = self.collaborators.cluster.clone();
            let executor = self.collaborators.checksum.clone();
            let name = table.qualified_name();
            let table = table.clone();
            let new_table = new_table.clone();
            let progress = progress.clone();
            let run = run.clone();
            workers
                .apply(async move {
                    let check = tokio::select! {
                        biased;
                        _ = run.cancelled() => TableCheck::Cancelled,
                        check = check_table(cluster, executor, &table, &new_table) => check,
                    };
                    if matches!(check, TableCheck::Passed) {
                        progress.inc();
                    }
                    let _ = tx.send(check).await;
                })
                .await
                .map_err(|cause| RestoreError::Checksum { table: name, cause })?;
        }
        drop(tx);

        let mut report = ChecksumReport {
            checked: tables.len(),
            ..Default::default()
        };
        let mut received = 0usize;
        let mut cancelled = 0usize;
        while let Some(check) = rx.recv().await {
            received += 1;
            match check {
                TableCheck::Passed => {}
                TableCheck::Mismatch(m) => report.mismatches.push(m),
                TableCheck::Failed(f) => report.failures.push(f),
                TableCheck::Cancelled => cancelled += 1,
            }
        }
        if received < tables.len() {
            report.failures.push(ChecksumFailure {
                table: "*".to_string(),
                reason: format!("{} checksum task(s) exited without reporting", tables.len() - received),
            });
        }
        report.mismatches.sort_by(|a, b| a.table.cmp(&b.table));
        report.failures.sort_by(|a, b| a.table.cmp(&b.table));

        tracing::info!(take = ?start.elapsed(), "restore checksum");
        if (cancelled > 0 || run.is_cancelled()) && report.mismatches.is_empty() {
            if !report.failures.is_empty() {
                tracing::warn!(report = %report, "checksum failures in a cancelled run");
            }
            return Err(RestoreError::Cancelled(format!(
                "checksum validation cancelled with {} of {} table(s) unchecked",
                cancelled,
                tables.len()
            )));
        }
        if report.is_clean() {
            tracing::info!("validate checksum passed");
            Ok(())
        } else {
            Err(RestoreError::ChecksumMismatch(report))
        }
    }
}

async fn check_table(
    cluster: Arc<dyn ClusterMetadata>,
    executor: Arc<dyn ChecksumExecutor>,
    table: &Table,
    new_table: &TableInfo,
) -> TableCheck {
    let name = table.qualified_name();
    let failed = |reason: String| {
        tracing::error!(table = %name, %reason, "checksum could not be computed");
        TableCheck::Failed(ChecksumFailure {
            table: name.clone(),
            reason,
        })
    };

    let start_ts = match cluster.get_ts().await {
        Ok(ts) => ts,
        Err(err) => return failed(format!("get timestamp: {err:#}")),
    };
    let on_progress = || tracing::trace!(table = %table.info.name, "checksum progress");
    let actual = match executor.compute(new_table, table, start_ts, &on_progress).await {
        Ok(resp) => resp,
        Err(err) => return failed(format!("compute checksum: {err:#}")),
    };

    let expected = ChecksumResponse {
        checksum: table.crc64xor,
        total_kvs: table.total_kvs,
        total_bytes: table.total_bytes,
    };
    if actual != expected {
        tracing::error!(
            database = %table.db.name,
            table = %table.info.name,
            origin_crc64 = expected.checksum,
            calculated_crc64 = actual.checksum,
            origin_total_kvs = expected.total_kvs,
            calculated_total_kvs = actual.total_kvs,
            origin_total_bytes = expected.total_bytes,
            calculated_total_bytes = actual.total_bytes,
            "failed in validate checksum"
        );
        return TableCheck::Mismatch(ChecksumMismatch {
            table: name,
            expected,
            actual,
        });
    }
    TableCheck::Passed
}
