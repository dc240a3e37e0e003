//! Index coordinator: one field keeper per indexed field
//!
//! Row mutations are projected into every keeper. Searches walk the
//! condition tree: simple conditions go to their field's keeper, AND
//! intersects left to right and stops at the first empty intersection, OR
//! unions.
//!
//! A condition touching a field without an active keeper cannot be answered
//! here; the result then reports `found = false` and the caller scans rows.
//!
//! When the indexed set grows, new keepers start out pending. They already
//! receive live mutations, subscribers backfill them from existing rows, and
//! only then do they become active.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

use crate::codec::ObjectConverter;
use crate::condition::{ComplexKind, Condition, ConditionEvaluator, StandardEvaluator};
use crate::config::KeeperKind;
use crate::destroy::Destroyable;
use crate::error::StoreResult;
use crate::keeper::{keeper_path, open_index, FieldIndex};
use crate::value::{Row, RowId, Value};

const INDEX_BASE: &str = "index";

/// Ids matching a condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    /// Whether the indexes could answer the condition
    pub found: bool,
    pub ids: HashSet<RowId>,
}

impl SearchResult {
    fn not_found() -> Self {
        Self::default()
    }
}

/// Backfills newly indexed fields: receives the coordinator and the fields
/// whose keepers are pending.
pub type BackfillSubscriber = Arc<dyn Fn(&IndexService, &HashSet<String>) -> StoreResult<()> + Send + Sync>;

#[derive(Default)]
struct Keepers {
    active: BTreeMap<String, Arc<dyn FieldIndex>>,
    pending: BTreeMap<String, Arc<dyn FieldIndex>>,
}

impl Keepers {
    fn all(&self) -> impl Iterator<Item = &Arc<dyn FieldIndex>> {
        self.active.values().chain(self.pending.values())
    }
}

/// Field keepers of one table.
pub struct IndexService {
    base: PathBuf,
    kind: KeeperKind,
    converter: ObjectConverter,
    evaluator: Arc<dyn ConditionEvaluator<Value>>,
    keepers: RwLock<Keepers>,
    subscribers: Mutex<Vec<BackfillSubscriber>>,
    reconcile: Mutex<()>,
}

impl IndexService {
    /// Open the keepers of `indexed` stored under `dir`.
    ///
    /// Keepers with a file are active at once. Those without one are
    /// pending until the next `reconcile` backfills them.
    pub fn open(dir: &Path, indexed: &HashSet<String>, kind: KeeperKind, converter: ObjectConverter) -> StoreResult<Self> {
        Self::with_evaluator(dir, indexed, kind, converter, Arc::new(StandardEvaluator))
    }

    pub fn with_evaluator(
        dir: &Path,
        indexed: &HashSet<String>,
        kind: KeeperKind,
        converter: ObjectConverter,
        evaluator: Arc<dyn ConditionEvaluator<Value>>,
    ) -> StoreResult<Self> {
        let base = dir.join(INDEX_BASE);
        let mut keepers = Keepers::default();
        for field in indexed {
            let keeper = open_index(kind, field, &base, converter.clone())?;
            if keeper_path(&base, field).exists() {
                keepers.active.insert(field.clone(), keeper);
            } else {
                keepers.pending.insert(field.clone(), keeper);
            }
        }
        tracing::debug!(
            dir = %dir.display(),
            active = keepers.active.len(),
            pending = keepers.pending.len(),
            "indexes opened"
        );
        Ok(Self {
            base,
            kind,
            converter,
            evaluator,
            keepers: RwLock::new(keepers),
            subscribers: Mutex::new(Vec::new()),
            reconcile: Mutex::new(()),
        })
    }

    /// Fields whose keepers answer searches.
    pub fn indexed_fields(&self) -> Vec<String> {
        self.keepers.read().active.keys().cloned().collect()
    }

    /// Fields waiting for a backfill.
    pub fn pending_fields(&self) -> Vec<String> {
        self.keepers.read().pending.keys().cloned().collect()
    }

    /// Register a backfill for newly indexed fields.
    pub fn subscribe_new_indexes(&self, subscriber: impl Fn(&IndexService, &HashSet<String>) -> StoreResult<()> + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    /// Bring the keeper set in line with `indexed`.
    ///
    /// Keepers of fields no longer indexed are dropped and their files
    /// removed. New ones are created empty, backfilled by the subscribers and
    /// then activated. If a backfill fails its keepers stay pending.
    pub fn reconcile(&self, indexed: &HashSet<String>) -> StoreResult<()> {
        let _reconcile = self.reconcile.lock();
        let pending: HashSet<String> = {
            let mut keepers = self.keepers.write();
            let stale: Vec<String> = keepers
                .active
                .keys()
                .chain(keepers.pending.keys())
                .filter(|field| !indexed.contains(*field))
                .cloned()
                .collect();
            for field in &stale {
                let removed = keepers.active.remove(field).or_else(|| keepers.pending.remove(field));
                if let Some(keeper) = removed {
                    keeper.clear();
                    tracing::info!(field = %field, "index dropped");
                }
            }
            for field in indexed {
                if keepers.active.contains_key(field) || keepers.pending.contains_key(field) {
                    continue;
                }
                let keeper = open_index(self.kind, field, &self.base, self.converter.clone())?;
                keeper.clear();
                keepers.pending.insert(field.clone(), keeper);
            }
            keepers.pending.keys().cloned().collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(self, &pending)?;
        }

        let mut keepers = self.keepers.write();
        for field in &pending {
            if let Some(keeper) = keepers.pending.remove(field) {
                keepers.active.insert(field.clone(), keeper);
            }
        }
        tracing::info!(fields = ?pending, "indexes activated");
        Ok(())
    }

    /// Index every field of `row`.
    pub fn insert(&self, row: &Row) {
        for keeper in self.keepers.read().all() {
            keeper.insert(row.get(keeper.field()), row.id);
        }
    }

    /// Index `row` into the keepers of `fields` only.
    pub fn insert_fields(&self, row: &Row, fields: &HashSet<String>) {
        for keeper in self.keepers.read().all().filter(|k| fields.contains(k.field())) {
            keeper.insert(row.get(keeper.field()), row.id);
        }
    }

    pub fn delete(&self, row: &Row) {
        for keeper in self.keepers.read().all() {
            keeper.delete(row.get(keeper.field()), row.id);
        }
    }

    /// Move `row` from the keys of `old` to its own, field by field.
    pub fn transform(&self, old: &Row, row: &Row) {
        for keeper in self.keepers.read().all() {
            let field = keeper.field();
            keeper.transform(old.get(field), row.get(field), row.id);
        }
    }

    /// Ids matching `condition`, at most `limit` of them.
    pub fn search(&self, condition: &Condition, limit: Option<usize>) -> SearchResult {
        let keepers = self.keepers.read();
        if condition.fields().iter().any(|field| !keepers.active.contains_key(*field)) {
            return SearchResult::not_found();
        }
        let ids = match condition {
            Condition::Simple(simple) => match keepers.active.get(simple.field()) {
                Some(keeper) => keeper.condition_search(self.evaluator.as_ref(), simple, limit),
                None => return SearchResult::not_found(),
            },
            Condition::Complex(_) => {
                let ids = self.search_ids(&keepers, condition);
                match limit {
                    Some(limit) if ids.len() > limit => {
                        let mut sorted: Vec<RowId> = ids.into_iter().collect();
                        sorted.sort_unstable();
                        sorted.into_iter().take(limit).collect()
                    }
                    _ => ids,
                }
            }
        };
        SearchResult { found: true, ids }
    }

    fn search_ids(&self, keepers: &Keepers, condition: &Condition) -> HashSet<RowId> {
        match condition {
            Condition::Simple(simple) => keepers
                .active
                .get(simple.field())
                .map(|keeper| keeper.condition_search(self.evaluator.as_ref(), simple, None))
                .unwrap_or_default(),
            Condition::Complex(complex) => {
                let mut result: Option<HashSet<RowId>> = None;
                for inner in complex.conditions() {
                    let ids = self.search_ids(keepers, inner);
                    result = Some(match (result, complex.kind()) {
                        (None, _) => ids,
                        (Some(mut acc), ComplexKind::And) => {
                            acc.retain(|id| ids.contains(id));
                            acc
                        }
                        (Some(mut acc), ComplexKind::Or) => {
                            acc.extend(ids);
                            acc
                        }
                    });
                    if complex.kind() == ComplexKind::And && result.as_ref().map_or(false, HashSet::is_empty) {
                        break;
                    }
                }
                result.unwrap_or_default()
            }
        }
    }

    /// Write every active keeper that changed.
    pub fn persist(&self) -> StoreResult<usize> {
        let keepers: Vec<Arc<dyn FieldIndex>> = self.keepers.read().active.values().cloned().collect();
        let mut written = 0;
        for keeper in keepers {
            if keeper.persist()? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Drop every keeper and its file.
    pub fn clear(&self) {
        let mut keepers = self.keepers.write();
        for keeper in keepers.all() {
            keeper.clear();
        }
        *keepers = Keepers::default();
    }
}

impl Destroyable for IndexService {
    fn name(&self) -> String {
        format!("indexes {}", self.base.display())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.persist().map(|_| ())
    }
}
