// kvrestore/src/restore/db_restore.rs
use anyhow::Result as AnyResult;
use async_trait::async_trait;

use crate::errors::{RestoreError, Result};
use crate::metadata::{DatabaseInfo, SchemaChangeEvent, Table, TableInfo};
use crate::restore::client::RestoreClient;
use crate::restore::history;
use crate::restore::rewrite::{RewriteRules, derive_rewrite_rules};

/// Turns schema descriptions into statements and runs them on the target cluster.
///
/// Calls come from a single logical session, one at a time.
#[async_trait]
pub trait SchemaBootstrapper: Send + Sync {
    async fn create_database(&self, db: &DatabaseInfo) -> AnyResult<()>;

    /// Creates `table` unless it exists, then restores its auto-increment base.
    async fn create_table(&self, table: &Table) -> AnyResult<()>;

    /// Reads back the schema the target assigned to a table.
    async fn table_schema(&self, db_name: &str, table_name: &str) -> AnyResult<TableInfo>;

    async fn execute_schema_change(&self, event: &SchemaChangeEvent) -> AnyResult<()>;
}

/// Rewrites a `CREATE TABLE ...` statement into `CREATE TABLE IF NOT EXISTS ...` so
/// tables that already exist are skipped.
pub fn with_if_not_exists(create_sql: &str) -> String {
    let mut words = create_sql.splitn(3, ' ');
    match (words.next(), words.next(), words.next()) {
        (Some(create), Some(table), Some(rest))
            if create.eq_ignore_ascii_case("create") && table.eq_ignore_ascii_case("table") =>
        {
            let rest_upper = rest.trim_start().to_ascii_uppercase();
            if rest_upper.starts_with("IF NOT EXISTS") {
                create_sql.to_string()
            } else {
                format!("CREATE TABLE IF NOT EXISTS {}", rest)
            }
        }
        _ => create_sql.to_string(),
    }
}

pub fn escape_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Statement restoring a table's auto-increment base after creation.
pub fn auto_increment_statement(table: &TableInfo) -> String {
    format!(
        "alter table {} auto_increment = {}",
        escape_name(&table.name),
        table.auto_inc_id
    )
}

impl RestoreClient {
    pub async fn create_database(&self, db: &DatabaseInfo) -> Result<()> {
        self.collaborators
            .bootstrapper
            .create_database(db)
            .await
            .map_err(|cause| RestoreError::Schema {
                object: escape_name(&db.name),
                cause,
            })?;
        tracing::info!(db = %db.name, "created database");
        Ok(())
    }

    pub async fn create_databases(&self, dbs: &[DatabaseInfo]) -> Result<()> {
        for db in dbs {
            self.create_database(db).await?;
        }
        Ok(())
    }

    /// Creates `tables` in order and returns the accumulated rewrite rules together with
    /// the schemas the target assigned, both in input order.
    pub async fn create_tables(
        &self,
        tables: &[Table],
        new_ts: u64,
    ) -> Result<(RewriteRules, Vec<TableInfo>)> {
        let bootstrapper = &self.collaborators.bootstrapper;
        let mut rewrite_rules = RewriteRules::default();
        let mut new_tables = Vec::with_capacity(tables.len());
        for table in tables {
            let schema_err = |cause| RestoreError::Schema {
                object: table.qualified_name(),
                cause,
            };
            bootstrapper.create_table(table).await.map_err(schema_err)?;
            let new_info = bootstrapper
                .table_schema(&table.db.name, &table.info.name)
                .await
                .map_err(schema_err)?;
            let rules = derive_rewrite_rules(&new_info, &table.info, new_ts).map_err(schema_err)?;
            tracing::info!(
                table = %table.qualified_name(),
                old_id = table.info.id,
                new_id = new_info.id,
                "created table"
            );
            rewrite_rules.append(rules);
            new_tables.push(new_info);
        }
        Ok((rewrite_rules, new_tables))
    }

    /// Replays schema changes one at a time, strictly ascending by schema version.
    pub async fn exec_ddls(&self, ddl_jobs: &[SchemaChangeEvent]) -> Result<()> {
        for job in history::replay_order(ddl_jobs) {
            self.collaborators
                .bootstrapper
                .execute_schema_change(job)
                .await
                .map_err(|cause| {
                    tracing::error!(
                        db = %job.schema_name,
                        query = %job.query,
                        history_schema_version = job.schema_version,
                        "execute ddl query failed"
                    );
                    RestoreError::Schema {
                        object: format!("schema change {} (version {})", job.id, job.schema_version),
                        cause,
                    }
                })?;
            tracing::info!(
                db = %job.schema_name,
                query = %job.query,
                history_schema_version = job.schema_version,
                "execute ddl query"
            );
        }
        Ok(())
    }
}
