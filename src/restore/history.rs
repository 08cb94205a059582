// kvrestore/src/restore/history.rs
//! Selects the schema changes that concern the objects being restored.
//!
//! Databases and tables change identity over time: renames change the name, truncate
//! changes the id, drop + recreate reuses a name under a new id. Each traced object keeps
//! every id and every name it has been seen under, seeded from its identity in the
//! restore target, and an event belongs to the object when its source id or resulting
//! name is already known. Absorbing an event can make earlier events match, so the
//! scan repeats in ascending version order until nothing new is selected.
//!
//! Example: with `a=1` meaning database `a` has id 1, the history
//! `rename a->b (b=1)`, `drop b (b=1)`, `create b (b=2)`, `rename b->a (a=2)` is fully
//! attributed to the target `a=2`, although its first two events carry neither id 2 nor
//! the name `a`.

use std::collections::{BTreeMap, HashSet};

use crate::metadata::{DatabaseInfo, SchemaChangeEvent, Table};

#[derive(Debug, Default, Clone)]
struct AliasSet {
    ids: HashSet<i64>,
    names: HashSet<String>,
}

impl AliasSet {
    fn seeded(id: i64, name: &str) -> Self {
        let mut set = Self::default();
        set.absorb(&[id], name);
        set
    }

    fn absorb(&mut self, ids: &[i64], name: &str) {
        self.ids.extend(ids.iter().copied());
        self.names.insert(name.to_lowercase());
    }

    fn knows_name(&self, name: &str) -> bool {
        self.names.contains(&name.to_lowercase())
    }
}

/// What an event says about one traced object kind.
struct Identity<'a> {
    source_id: i64,
    result_id: i64,
    result_name: &'a str,
}

fn db_identity(event: &SchemaChangeEvent) -> Option<Identity<'_>> {
    event.db_info.as_ref().map(|db| Identity {
        source_id: event.schema_id,
        result_id: db.id,
        result_name: &db.name,
    })
}

fn table_identity(event: &SchemaChangeEvent) -> Option<Identity<'_>> {
    event.table_info.as_ref().map(|t| Identity {
        source_id: event.table_id,
        result_id: t.id,
        result_name: &t.name,
    })
}

/// Walks `history` (ascending by version) to a fixpoint, marking in `selected` the events
/// attributed to the object described by `aliases`.
fn trace_lineage<'a>(
    history: &[&'a SchemaChangeEvent],
    aliases: &mut AliasSet,
    identity: impl Fn(&'a SchemaChangeEvent) -> Option<Identity<'a>>,
    name_in_scope: impl Fn(&SchemaChangeEvent) -> bool,
) -> Vec<&'a SchemaChangeEvent> {
    let mut picked = vec![false; history.len()];
    loop {
        let mut grew = false;
        for (i, &event) in history.iter().enumerate() {
            if picked[i] {
                continue;
            }
            let Some(id) = identity(event) else {
                continue;
            };
            let by_id = aliases.ids.contains(&id.source_id);
            let by_name = name_in_scope(event) && aliases.knows_name(id.result_name);
            if by_id || by_name {
                picked[i] = true;
                aliases.absorb(&[id.source_id, id.result_id], id.result_name);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    history
        .iter()
        .zip(picked)
        .filter_map(|(event, keep)| keep.then_some(*event))
        .collect()
}

/// Distinct databases owning `tables`, in first-seen order.
fn databases_of(tables: &[Table]) -> Vec<&DatabaseInfo> {
    let mut seen = HashSet::new();
    tables
        .iter()
        .filter(|t| seen.insert(t.db.id))
        .map(|t| &t.db)
        .collect()
}

/// Returns the events of `all_ddl_jobs` relevant to `tables` or their databases.
///
/// An event relevant to several traced objects appears once per object; `replay_order`
/// removes the duplicates.
pub fn filter_ddl_jobs(all_ddl_jobs: &[SchemaChangeEvent], tables: &[Table]) -> Vec<SchemaChangeEvent> {
    let mut history: Vec<&SchemaChangeEvent> = all_ddl_jobs.iter().collect();
    history.sort_by_key(|e| (e.schema_version, e.id));

    let mut ddl_jobs = Vec::new();
    let mut db_aliases: BTreeMap<i64, AliasSet> = BTreeMap::new();
    for db in databases_of(tables) {
        let mut aliases = AliasSet::seeded(db.id, &db.name);
        ddl_jobs.extend(trace_lineage(&history, &mut aliases, db_identity, |_| true));
        db_aliases.insert(db.id, aliases);
    }

    for table in tables {
        let mut aliases = AliasSet::seeded(table.info.id, &table.info.name);
        let owner_ids = db_aliases
            .get(&table.db.id)
            .map(|set| set.ids.clone())
            .unwrap_or_default();
        // Table names are only unique within a database.
        let in_owner = |event: &SchemaChangeEvent| owner_ids.contains(&event.schema_id);
        ddl_jobs.extend(trace_lineage(&history, &mut aliases, table_identity, in_owner));
    }

    tracing::info!(total = all_ddl_jobs.len(), selected = ddl_jobs.len(), "filtered schema history");
    ddl_jobs.into_iter().cloned().collect()
}

/// Sorts events ascending by schema version and drops repeats of the same job.
pub fn replay_order(ddl_jobs: &[SchemaChangeEvent]) -> Vec<&SchemaChangeEvent> {
    let mut ordered: Vec<&SchemaChangeEvent> = ddl_jobs.iter().collect();
    ordered.sort_by_key(|e| (e.schema_version, e.id));
    ordered.dedup_by_key(|e| (e.schema_version, e.id));
    ordered
}
