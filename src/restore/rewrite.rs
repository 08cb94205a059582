// kvrestore/src/restore/rewrite.rs
use anyhow::Result;

use crate::metadata::TableInfo;

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;

/// Maps keys written under an old table (or index) id onto the id assigned by the target
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub old_table_id: i64,
    pub new_table_id: i64,
    pub old_key_prefix: Vec<u8>,
    pub new_key_prefix: Vec<u8>,
    pub new_timestamp: u64,
}

/// Table-level and data-level rules for a set of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteRules {
    pub table: Vec<RewriteRule>,
    pub data: Vec<RewriteRule>,
}

impl RewriteRules {
    pub fn append(&mut self, other: RewriteRules) {
        self.table.extend(other.table);
        self.data.extend(other.data);
    }

    /// Whether keys of the snapshot table `old_table_id` can be rewritten.
    pub fn covers_table(&self, old_table_id: i64) -> bool {
        self.data.iter().any(|r| r.old_table_id == old_table_id)
    }

    /// Rewrites `key` with the longest matching data rule.
    pub fn rewrite_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let rule = self
            .data
            .iter()
            .filter(|r| key.starts_with(&r.old_key_prefix))
            .max_by_key(|r| r.old_key_prefix.len())?;
        let mut out = rule.new_key_prefix.clone();
        out.extend_from_slice(&key[rule.old_key_prefix.len()..]);
        Some(out)
    }
}

/// Encodes `id` so byte order matches numeric order.
pub fn encode_int(id: i64) -> [u8; 8] {
    ((id as u64) ^ SIGN_MASK).to_be_bytes()
}

pub fn table_prefix(table_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&encode_int(table_id));
    key
}

pub fn record_prefix(table_id: i64) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(RECORD_SEP);
    key
}

pub fn index_prefix(table_id: i64, index_id: i64) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(INDEX_SEP);
    key.extend_from_slice(&encode_int(index_id));
    key
}

/// Derives the rules that move `old` (snapshot schema) onto `new` (schema created in the
/// target cluster). Indices are paired by name.
pub fn derive_rewrite_rules(new: &TableInfo, old: &TableInfo, new_ts: u64) -> Result<RewriteRules> {
    let rule = |old_prefix: Vec<u8>, new_prefix: Vec<u8>| RewriteRule {
        old_table_id: old.id,
        new_table_id: new.id,
        old_key_prefix: old_prefix,
        new_key_prefix: new_prefix,
        new_timestamp: new_ts,
    };

    let mut rules = RewriteRules::default();
    rules.table.push(rule(table_prefix(old.id), table_prefix(new.id)));
    rules.data.push(rule(record_prefix(old.id), record_prefix(new.id)));
    for old_index in &old.indices {
        let Some(new_index) = new.find_index(&old_index.name) else {
            anyhow::bail!(
                "index '{}' of table '{}' is missing from the restored schema",
                old_index.name,
                old.name
            );
        };
        rules.data.push(rule(
            index_prefix(old.id, old_index.id),
            index_prefix(new.id, new_index.id),
        ));
    }
    tracing::debug!(
        table = %old.name,
        old_prefix = %hex::encode(table_prefix(old.id)),
        new_prefix = %hex::encode(table_prefix(new.id)),
        data_rules = rules.data.len(),
        "derived rewrite rules"
    );
    Ok(rules)
}
