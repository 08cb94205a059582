// kvrestore/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::restore::cluster::ConnectOptions;
use crate::utils::ExponentialBackoff;

pub const DEFAULT_CONCURRENCY: usize = 128;
pub const DEFAULT_CHECKSUM_CONCURRENCY: usize = 64;
pub const DEFAULT_BATCH_SIZE: usize = 128;
pub const DEFAULT_BACKUPMETA_NAME: &str = "backupmeta";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSwitchModeOptions {
    pub connect_timeout_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_timeout_ms: Option<u64>,
    pub max_backoff_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonResetTsOptions {
    pub max_attempts: Option<u32>,
    pub wait_interval_ms: Option<u64>,
    pub max_wait_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub pd_endpoints: Option<Vec<String>>,
    pub storage: Option<String>,
    pub backupmeta_name: Option<String>,
    pub database_list: Option<serde_json::Value>,
    pub concurrency: Option<usize>,
    pub checksum_concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub online: Option<bool>,
    pub checksum: Option<bool>,
    pub switch_mode: Option<JsonSwitchModeOptions>,
    pub reset_ts: Option<JsonResetTsOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Selects which databases/tables of the snapshot are restored. A database mapped to
/// `None` is restored whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub databases: BTreeMap<String, Option<Vec<String>>>,
}

impl TableFilter {
    pub fn matches_database(&self, db: &str) -> bool {
        self.databases.keys().any(|name| name.eq_ignore_ascii_case(db))
    }

    pub fn matches(&self, db: &str, table: &str) -> bool {
        self.databases.iter().any(|(name, tables)| {
            name.eq_ignore_ascii_case(db)
                && tables
                    .as_ref()
                    .map_or(true, |ts| ts.iter().any(|t| t.eq_ignore_ascii_case(table)))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTsPolicy {
    pub max_attempts: u32,
    pub wait_interval: Duration,
    pub max_wait_interval: Duration,
}

impl Default for ResetTsPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            wait_interval: Duration::from_millis(50),
            max_wait_interval: Duration::from_millis(500),
        }
    }
}

impl ResetTsPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.max_attempts, self.wait_interval, self.max_wait_interval)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub pd_endpoints: Vec<String>,
    pub storage: String,
    pub backupmeta_name: String,
    pub filter: Option<TableFilter>,
    pub concurrency: usize,
    pub checksum_concurrency: usize,
    pub batch_size: usize,
    /// Per-store download cap in bytes per second; 0 disables it.
    pub rate_limit: u64,
    pub online: bool,
    pub checksum: bool,
    pub switch_mode: ConnectOptions,
    pub reset_ts: ResetTsPolicy,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            pd_endpoints: Vec::new(),
            storage: String::new(),
            backupmeta_name: DEFAULT_BACKUPMETA_NAME.to_string(),
            filter: None,
            concurrency: DEFAULT_CONCURRENCY,
            checksum_concurrency: DEFAULT_CHECKSUM_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            rate_limit: 0,
            online: false,
            checksum: true,
            switch_mode: ConnectOptions::default(),
            reset_ts: ResetTsPolicy::default(),
        }
    }
}

impl RestoreConfig {
    pub fn is_s3_storage(&self) -> bool {
        self.storage.starts_with("s3://")
    }

    /// Location of the snapshot metadata file under the storage target.
    pub fn backupmeta_location(&self) -> String {
        format!("{}/{}", self.storage.trim_end_matches('/'), self.backupmeta_name)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spaces_config: Option<SpacesConfig>,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(config_content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig = serde_json::from_str(config_content)?;

        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(|s3_raw| {
            if let (Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                })
            } else {
                tracing::warn!("s3_storage is present but incomplete (region, access_key_id, secret_access_key, endpoint_url); S3 access disabled");
                None
            }
        });

        Ok(AppConfig {
            spaces_config,
            raw_json_config,
        })
    }
}

pub fn load_restore_config_from_json(
    raw_config: &RawJsonConfig,
    spaces_is_configured: bool,
) -> Result<RestoreConfig> {
    let defaults = RestoreConfig::default();

    let pd_endpoints = raw_config
        .pd_endpoints
        .clone()
        .context("pd_endpoints must be set in config.json for restore")?;
    if pd_endpoints.iter().all(|e| e.trim().is_empty()) {
        anyhow::bail!("pd_endpoints cannot be empty in config.json.");
    }
    for endpoint in &pd_endpoints {
        validate_endpoint(endpoint)?;
    }

    let storage = raw_config
        .storage
        .as_ref()
        .context("storage must be set in config.json for restore")?
        .trim()
        .to_string();
    if storage.is_empty() {
        anyhow::bail!("storage cannot be empty in config.json.");
    }
    if storage.starts_with("s3://") && !spaces_is_configured {
        anyhow::bail!(
            "storage in config.json is an S3 URI, but s3_storage is not fully configured or is missing required fields."
        );
    }

    let positive = |value: Option<usize>, default: usize, field: &str| -> Result<usize> {
        match value {
            Some(0) => Err(anyhow::anyhow!("{} must be greater than zero", field)),
            Some(v) => Ok(v),
            None => Ok(default),
        }
    };

    let switch_mode = raw_config.switch_mode.clone().unwrap_or_default();
    let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);
    let reset_ts = raw_config.reset_ts.clone().unwrap_or_default();

    Ok(RestoreConfig {
        pd_endpoints,
        storage,
        backupmeta_name: raw_config
            .backupmeta_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.backupmeta_name),
        filter: parse_database_list_for_restore(&raw_config.database_list)?,
        concurrency: positive(raw_config.concurrency, defaults.concurrency, "concurrency")?,
        checksum_concurrency: positive(
            raw_config.checksum_concurrency,
            defaults.checksum_concurrency,
            "checksum_concurrency",
        )?,
        batch_size: positive(raw_config.batch_size, defaults.batch_size, "batch_size")?,
        rate_limit: raw_config.rate_limit_bytes_per_sec.unwrap_or(0),
        online: raw_config.online.unwrap_or(defaults.online),
        checksum: raw_config.checksum.unwrap_or(defaults.checksum),
        switch_mode: ConnectOptions {
            connect_timeout: ms(switch_mode.connect_timeout_ms, defaults.switch_mode.connect_timeout),
            keepalive_interval: ms(switch_mode.keepalive_interval_ms, defaults.switch_mode.keepalive_interval),
            keepalive_timeout: ms(switch_mode.keepalive_timeout_ms, defaults.switch_mode.keepalive_timeout),
            max_backoff_delay: ms(switch_mode.max_backoff_delay_ms, defaults.switch_mode.max_backoff_delay),
        },
        reset_ts: ResetTsPolicy {
            max_attempts: reset_ts.max_attempts.unwrap_or(defaults.reset_ts.max_attempts),
            wait_interval: ms(reset_ts.wait_interval_ms, defaults.reset_ts.wait_interval),
            max_wait_interval: ms(reset_ts.max_wait_interval_ms, defaults.reset_ts.max_wait_interval),
        },
    })
}

/// Accepts `host:port` or a full `http(s)://host:port` URL.
fn validate_endpoint(endpoint: &str) -> Result<()> {
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let url = url::Url::parse(&candidate)
        .with_context(|| format!("Invalid pd endpoint '{}'", endpoint))?;
    if url.host_str().is_none() {
        anyhow::bail!("pd endpoint '{}' has no host", endpoint);
    }
    Ok(())
}

/// Parses the database_list configuration for restore operations.
///
/// Accepts `["db", "db.table"]` or `{"db": ["table", ...]}`; an empty table list
/// selects the whole database.
fn parse_database_list_for_restore(database_list: &Option<serde_json::Value>) -> Result<Option<TableFilter>> {
    let Some(value) = database_list else {
        return Ok(None);
    };
    let mut filter = TableFilter::default();
    if value.is_array() {
        let entries: Vec<String> = serde_json::from_value(value.clone())
            .context("Failed to parse database_list as array")?;
        for entry in entries {
            match entry.split_once('.') {
                Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                    let tables = filter.databases.entry(db.to_string()).or_insert_with(|| Some(Vec::new()));
                    if let Some(tables) = tables {
                        tables.push(table.to_string());
                    }
                }
                None if !entry.trim().is_empty() => {
                    filter.databases.insert(entry.trim().to_string(), None);
                }
                _ => anyhow::bail!("Invalid database_list entry '{}'", entry),
            }
        }
    } else if value.is_object() {
        let mapping: BTreeMap<String, Vec<String>> = serde_json::from_value(value.clone())
            .context("Failed to parse database_list as mapping object")?;
        for (db, tables) in mapping {
            let tables = if tables.is_empty() { None } else { Some(tables) };
            filter.databases.insert(db, tables);
        }
    } else {
        anyhow::bail!("database_list must be either an array of names or a mapping object");
    }
    Ok(Some(filter))
}
