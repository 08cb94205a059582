//! In-memory collaborators for restore tests.
#![allow(dead_code)]

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kvrestore::config::RestoreConfig;
use kvrestore::metadata::{
    DataSegment, DatabaseInfo, IndexInfo, SchemaChangeEvent, SnapshotMetadata, Table, TableInfo,
};
use kvrestore::restore::cluster::{
    ClockResetter, ClusterMetadata, ConnectOptions, ImportControl, IngestMode, NodeConnector, StoreInfo,
    compose_ts,
};
use kvrestore::restore::db_restore::{
    SchemaBootstrapper, auto_increment_statement, escape_name, with_if_not_exists,
};
use kvrestore::restore::import::FileImporter;
use kvrestore::restore::rewrite::RewriteRules;
use kvrestore::restore::verification::{ChecksumExecutor, ChecksumResponse};
use kvrestore::restore::{Collaborators, RestoreClient};

/// Upper bound for any single test await; hitting it means a hang.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct FakeCluster {
    pub stores: Vec<StoreInfo>,
    next_ts: AtomicU64,
    pub ts_requests: AtomicUsize,
}

impl FakeCluster {
    pub fn new(store_count: u64) -> Self {
        Self {
            stores: (1..=store_count)
                .map(|id| StoreInfo {
                    id,
                    address: format!("store-{id}:20160"),
                })
                .collect(),
            next_ts: AtomicU64::new(compose_ts(1_700_000_000_000, 0)),
            ts_requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ClusterMetadata for FakeCluster {
    async fn get_ts(&self) -> Result<u64> {
        self.ts_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_ts.fetch_add(1, Ordering::SeqCst))
    }

    async fn list_live_stores(&self) -> Result<Vec<StoreInfo>> {
        Ok(self.stores.clone())
    }
}

#[derive(Default)]
pub struct FakeClock {
    pub failures_before_success: AtomicU32,
    pub calls: Mutex<Vec<(String, u64)>>,
}

impl FakeClock {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_before_success: AtomicU32::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClockResetter for FakeClock {
    async fn reset_ts(&self, endpoint: &str, ts: u64) -> Result<()> {
        self.calls.lock().unwrap().push((endpoint.to_string(), ts));
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            bail!("endpoint {endpoint} unavailable");
        }
        Ok(())
    }
}

/// Records which store received which mode, in call order.
#[derive(Default)]
pub struct FakeConnector {
    pub unreachable: HashSet<String>,
    pub hang: HashSet<String>,
    pub failing_close: HashSet<String>,
    pub applied: Arc<Mutex<Vec<(String, IngestMode)>>>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn applied(&self) -> Vec<(String, IngestMode)> {
        self.applied.lock().unwrap().clone()
    }
}

struct FakeControl {
    address: String,
    fail_close: bool,
    applied: Arc<Mutex<Vec<(String, IngestMode)>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeConnector for FakeConnector {
    async fn connect(&self, address: &str, _options: &ConnectOptions) -> Result<Box<dyn ImportControl>> {
        if self.hang.contains(address) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.unreachable.contains(address) {
            bail!("connection refused: {address}");
        }
        Ok(Box::new(FakeControl {
            address: address.to_string(),
            fail_close: self.failing_close.contains(address),
            applied: self.applied.clone(),
            closed: self.closed.clone(),
        }))
    }
}

#[async_trait]
impl ImportControl for FakeControl {
    async fn switch_mode(&mut self, mode: IngestMode) -> Result<()> {
        self.applied.lock().unwrap().push((self.address.clone(), mode));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.fail_close {
            bail!("broken pipe closing {}", self.address);
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImporter {
    pub failing: HashSet<String>,
    pub delay: Duration,
    pub imported: Mutex<Vec<String>>,
    pub rate_limits: Mutex<Vec<(u64, u64)>>,
    pub fail_rate_limit_for: Mutex<HashSet<u64>>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl FakeImporter {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn imported(&self) -> Vec<String> {
        self.imported.lock().unwrap().clone()
    }

    pub fn rate_limits(&self) -> Vec<(u64, u64)> {
        self.rate_limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileImporter for FakeImporter {
    async fn import(&self, segment: &DataSegment, rules: &RewriteRules) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&segment.name) {
            bail!("ingest rejected for {}", segment.name);
        }
        if !rules.covers_table(segment.table_id) {
            bail!("no rule for table {}", segment.table_id);
        }
        self.imported.lock().unwrap().push(segment.name.clone());
        Ok(())
    }

    async fn set_download_speed_limit(&self, store_id: u64, rate: u64) -> Result<()> {
        if self.fail_rate_limit_for.lock().unwrap().remove(&store_id) {
            bail!("store {store_id} rejected rate limit");
        }
        self.rate_limits.lock().unwrap().push((store_id, rate));
        Ok(())
    }
}

/// Assigns fresh ids to created tables (old id + 1000, index ids + 100).
#[derive(Default)]
pub struct FakeBootstrapper {
    pub databases: Mutex<Vec<String>>,
    pub tables: Mutex<HashMap<(String, String), TableInfo>>,
    pub created_order: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<i64>>,
    pub statements: Mutex<Vec<String>>,
    pub fail_table: Option<String>,
    pub next_offset: AtomicI64,
}

impl FakeBootstrapper {
    pub fn executed(&self) -> Vec<i64> {
        self.executed.lock().unwrap().clone()
    }

    pub fn created_order(&self) -> Vec<String> {
        self.created_order.lock().unwrap().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaBootstrapper for FakeBootstrapper {
    async fn create_database(&self, db: &DatabaseInfo) -> Result<()> {
        self.databases.lock().unwrap().push(db.name.clone());
        Ok(())
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        if self.fail_table.as_deref() == Some(table.info.name.as_str()) {
            bail!("table {} already exists with a different definition", table.info.name);
        }
        let offset = 1000 + self.next_offset.fetch_add(1, Ordering::SeqCst);
        let mut info = table.info.clone();
        info.id = table.info.id + offset;
        for index in &mut info.indices {
            index.id += 100;
        }
        self.tables
            .lock()
            .unwrap()
            .insert((table.db.name.clone(), table.info.name.clone()), info);
        self.created_order.lock().unwrap().push(table.info.name.clone());
        let create = format!(
            "CREATE TABLE {}.{} (id bigint)",
            escape_name(&table.db.name),
            escape_name(&table.info.name)
        );
        let mut statements = self.statements.lock().unwrap();
        statements.push(with_if_not_exists(&create));
        if table.info.auto_inc_id > 0 {
            statements.push(auto_increment_statement(&table.info));
        }
        Ok(())
    }

    async fn table_schema(&self, db_name: &str, table_name: &str) -> Result<TableInfo> {
        self.tables
            .lock()
            .unwrap()
            .get(&(db_name.to_string(), table_name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("table {db_name}.{table_name} not found"))
    }

    async fn execute_schema_change(&self, event: &SchemaChangeEvent) -> Result<()> {
        self.executed.lock().unwrap().push(event.id);
        Ok(())
    }
}

/// Answers with the snapshot statistics unless an override is registered.
#[derive(Default)]
pub struct FakeChecksum {
    pub overrides: HashMap<String, ChecksumResponse>,
    pub failing: HashSet<String>,
    pub computed: Mutex<Vec<String>>,
}

#[async_trait]
impl ChecksumExecutor for FakeChecksum {
    async fn compute(
        &self,
        _new_table: &TableInfo,
        old_table: &Table,
        _start_ts: u64,
        progress: &(dyn Fn() + Send + Sync),
    ) -> Result<ChecksumResponse> {
        progress();
        self.computed.lock().unwrap().push(old_table.info.name.clone());
        if self.failing.contains(&old_table.info.name) {
            bail!("coprocessor timeout on {}", old_table.info.name);
        }
        Ok(self
            .overrides
            .get(&old_table.info.name)
            .copied()
            .unwrap_or(ChecksumResponse {
                checksum: old_table.crc64xor,
                total_kvs: old_table.total_kvs,
                total_bytes: old_table.total_bytes,
            }))
    }
}

/// Concrete handles kept next to the type-erased collaborators so tests can inspect them.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub clock: Arc<FakeClock>,
    pub connector: Arc<FakeConnector>,
    pub importer: Arc<FakeImporter>,
    pub bootstrapper: Arc<FakeBootstrapper>,
    pub checksum: Arc<FakeChecksum>,
}

impl Harness {
    pub fn new(importer: FakeImporter) -> Self {
        Self {
            cluster: Arc::new(FakeCluster::new(3)),
            clock: Arc::new(FakeClock::default()),
            connector: Arc::new(FakeConnector::default()),
            importer: Arc::new(importer),
            bootstrapper: Arc::new(FakeBootstrapper::default()),
            checksum: Arc::new(FakeChecksum::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cluster: self.cluster.clone(),
            clock: self.clock.clone(),
            connector: self.connector.clone(),
            importer: self.importer.clone(),
            bootstrapper: self.bootstrapper.clone(),
            checksum: self.checksum.clone(),
        }
    }

    pub fn client(&self, config: RestoreConfig) -> RestoreClient {
        RestoreClient::new(config, self.collaborators())
    }
}

pub fn test_config() -> RestoreConfig {
    RestoreConfig {
        pd_endpoints: vec!["pd-0:2379".to_string(), "pd-1:2379".to_string(), "pd-2:2379".to_string()],
        storage: "/snapshots/test".to_string(),
        concurrency: 4,
        reset_ts: kvrestore::config::ResetTsPolicy {
            max_attempts: 4,
            wait_interval: Duration::from_millis(1),
            max_wait_interval: Duration::from_millis(2),
        },
        ..Default::default()
    }
}

pub fn db(id: i64, name: &str) -> DatabaseInfo {
    DatabaseInfo {
        id,
        name: name.to_string(),
        charset: None,
        collate: None,
    }
}

pub fn table_info(id: i64, name: &str) -> TableInfo {
    TableInfo {
        id,
        name: name.to_string(),
        columns: Vec::new(),
        indices: vec![IndexInfo {
            id: 1,
            name: "idx_a".to_string(),
            columns: vec!["a".to_string()],
            unique: false,
            primary: false,
        }],
        auto_inc_id: 0,
    }
}

pub fn segments(table_id: i64, prefix: &str, count: usize) -> Vec<DataSegment> {
    (0..count)
        .map(|i| DataSegment {
            name: format!("{prefix}_{i}.sst"),
            table_id,
            start_key: Vec::new(),
            end_key: Vec::new(),
            cf: "default".to_string(),
            crc64xor: 0,
            total_kvs: 0,
            total_bytes: 0,
            size: 1,
        })
        .collect()
}

pub fn table(db_info: DatabaseInfo, id: i64, name: &str, stats: (u64, u64, u64), files: usize) -> Table {
    Table {
        db: db_info,
        info: table_info(id, name),
        crc64xor: stats.0,
        total_kvs: stats.1,
        total_bytes: stats.2,
        files: segments(id, name, files),
    }
}

/// Builds snapshot metadata holding `tables` and `ddls`.
pub fn snapshot(start_version: u64, end_version: u64, tables: &[Table], ddls: Vec<SchemaChangeEvent>) -> SnapshotMetadata {
    SnapshotMetadata {
        cluster_id: 1,
        start_version,
        end_version,
        files: tables.iter().flat_map(|t| t.files.clone()).collect(),
        schemas: tables
            .iter()
            .map(|t| kvrestore::metadata::SchemaEntry {
                db: t.db.clone(),
                table: Some(t.info.clone()),
                crc64xor: t.crc64xor,
                total_kvs: t.total_kvs,
                total_bytes: t.total_bytes,
            })
            .collect(),
        ddls,
    }
}

/// Rules covering `tables`, as produced by schema creation.
pub fn rules_for(tables: &[Table]) -> RewriteRules {
    let mut rules = RewriteRules::default();
    for t in tables {
        let mut new_info = t.info.clone();
        new_info.id += 1000;
        rules.append(
            kvrestore::restore::rewrite::derive_rewrite_rules(&new_info, &t.info, 0).expect("derivable rules"),
        );
    }
    rules
}
