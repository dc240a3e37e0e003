//! Field keepers: per-field value → row id indexes
//!
//! A keeper holds an ordered backing store for non-null keys plus a separate
//! null set for rows whose field is absent. A value lives in exactly one of
//! the two, once per key. The backing store is pluggable (`OrderedStore`):
//! `tree::BinaryTree` prunes subtrees during condition search, `map::SortedMap`
//! answers comparisons with bounded range scans.
//!
//! State is persisted as one file per field, `<base>.<field>`, when the keeper
//! is destroyed after a change.

pub mod map;
pub mod tree;

use std::fmt::Debug;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::ObjectConverter;
use crate::condition::{ConditionEvaluator, SimpleCondition};
use crate::config::KeeperKind;
use crate::destroy::Destroyable;
use crate::error::StoreResult;
use crate::value::{IndexKey, RowId, Value};

pub use map::SortedMap;
pub use tree::BinaryTree;

/// Outcome of removing one value from one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    /// The value was present and has been removed
    pub deleted: bool,
    /// The key has no values left
    pub fully: bool,
}

impl DeleteResult {
    pub const NOT: DeleteResult = DeleteResult { deleted: false, fully: false };
    pub const NOT_FULLY: DeleteResult = DeleteResult { deleted: true, fully: false };
    pub const FULLY: DeleteResult = DeleteResult { deleted: true, fully: true };
}

/// Value type stored under keeper keys.
pub trait KeeperValue: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static> KeeperValue for T {}

/// Add values from `from` until `out` holds `limit` values.
///
/// Returns true once `out` is full.
pub fn fill_to_full<'a, V: KeeperValue>(out: &mut HashSet<V>, limit: Option<usize>, from: impl IntoIterator<Item = &'a V>) -> bool {
    for value in from {
        if is_full(out, limit) {
            return true;
        }
        out.insert(value.clone());
    }
    is_full(out, limit)
}

pub fn is_full<V>(out: &HashSet<V>, limit: Option<usize>) -> bool {
    limit.map_or(false, |limit| out.len() >= limit)
}

/// Ordered structure holding non-null keys.
pub trait OrderedStore<U: IndexKey, V: KeeperValue>: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Add `value` under `key`. Returns whether anything changed.
    fn insert(&mut self, key: U, value: V) -> bool;

    fn delete(&mut self, key: &U, value: &V) -> DeleteResult;

    /// Values stored under exactly `key`.
    fn get(&self, key: &U) -> HashSet<V>;

    /// Add the values of every key matching `condition` to `out`, stopping
    /// once `out` holds `limit` values.
    fn search(&self, evaluator: &dyn ConditionEvaluator<U>, condition: &SimpleCondition<U>, out: &mut HashSet<V>, limit: Option<usize>);

    /// Number of distinct keys.
    fn key_count(&self) -> usize;

    /// Every key with its values, ascending.
    fn entries(&self) -> Vec<(U, HashSet<V>)>;
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize, V: Serialize", deserialize = "S: DeserializeOwned, V: DeserializeOwned"))]
struct KeeperState<V: KeeperValue, S> {
    null_set: HashSet<V>,
    store: S,
}

impl<V: KeeperValue, S: Default> Default for KeeperState<V, S> {
    fn default() -> Self {
        Self { null_set: HashSet::new(), store: S::default() }
    }
}

/// Index of one field.
pub struct FieldKeeper<U, V, S>
where
    U: IndexKey,
    V: KeeperValue,
    S: OrderedStore<U, V>,
{
    field: String,
    path: PathBuf,
    converter: ObjectConverter,
    state: RwLock<KeeperState<V, S>>,
    changed: AtomicBool,
    _key: std::marker::PhantomData<fn() -> U>,
}

/// `<base>.<field>`
pub fn keeper_path(base: &Path, field: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(field);
    PathBuf::from(name)
}

impl<U, V, S> FieldKeeper<U, V, S>
where
    U: IndexKey,
    V: KeeperValue,
    S: OrderedStore<U, V>,
{
    /// Load the keeper of `field` from `<base>.<field>`, or start empty.
    pub fn open(field: &str, base: &Path, converter: ObjectConverter) -> StoreResult<Self> {
        let path = keeper_path(base, field);
        let state = match converter.from_file::<KeeperState<V, S>>(&path)? {
            Some(state) => {
                tracing::debug!(field, keys = state.store.key_count(), "field keeper loaded");
                state
            }
            None => KeeperState::default(),
        };
        Ok(Self {
            field: field.to_string(),
            path,
            converter,
            state: RwLock::new(state),
            changed: AtomicBool::new(false),
            _key: std::marker::PhantomData,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index `value` under `key`; a `None` key goes to the null set.
    pub fn insert(&self, key: Option<U>, value: V) {
        let mut state = self.state.write();
        let changed = match key {
            None => state.null_set.insert(value),
            Some(key) => state.store.insert(key, value),
        };
        if changed {
            self.changed.store(true, Ordering::Release);
        }
    }

    pub fn delete(&self, key: Option<&U>, value: &V) -> DeleteResult {
        let mut state = self.state.write();
        let result = match key {
            None => {
                let deleted = state.null_set.remove(value);
                DeleteResult { deleted, fully: state.null_set.is_empty() }
            }
            Some(key) => state.store.delete(key, value),
        };
        if result.deleted {
            self.changed.store(true, Ordering::Release);
        }
        result
    }

    /// Move `value` from `old_key` to `key`.
    ///
    /// Nothing happens when the keys are equal, and the insert is skipped when
    /// `value` was not indexed under `old_key`.
    pub fn transform(&self, old_key: Option<&U>, key: Option<U>, value: V) {
        if old_key == key.as_ref() {
            return;
        }
        if self.delete(old_key, &value).deleted {
            self.insert(key, value);
        }
    }

    /// Exact lookup; `None` returns a copy of the null set.
    pub fn search(&self, key: Option<&U>) -> HashSet<V> {
        let state = self.state.read();
        match key {
            None => state.null_set.clone(),
            Some(key) => state.store.get(key),
        }
    }

    /// Values whose key satisfies `condition`, null set included.
    pub fn condition_search(
        &self,
        evaluator: &dyn ConditionEvaluator<U>,
        condition: &SimpleCondition<U>,
        limit: Option<usize>,
    ) -> HashSet<V> {
        let state = self.state.read();
        let mut out = HashSet::new();
        state.store.search(evaluator, condition, &mut out, limit);
        if !is_full(&out, limit) && evaluator.check(None, condition) {
            fill_to_full(&mut out, limit, state.null_set.iter());
        }
        out
    }

    pub fn key_count(&self) -> usize {
        self.state.read().store.key_count()
    }

    pub fn null_count(&self) -> usize {
        self.state.read().null_set.len()
    }

    /// Snapshot of every non-null key and its values, ascending.
    pub fn entries(&self) -> Vec<(U, HashSet<V>)> {
        self.state.read().store.entries()
    }

    /// Write state to `<base>.<field>` if it changed.
    pub fn persist(&self) -> StoreResult<bool> {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let state = self.state.read();
        if let Err(e) = self.converter.to_file(&self.path, &*state) {
            self.changed.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop all entries and delete the backing file.
    pub fn clear(&self) -> bool {
        *self.state.write() = KeeperState::default();
        self.changed.store(false, Ordering::Release);
        self.converter.files().delete(&self.path)
    }
}

/// Object-safe view of a keeper over row values and row ids.
pub trait FieldIndex: Send + Sync {
    fn field(&self) -> &str;
    fn insert(&self, key: Option<&Value>, id: RowId);
    fn delete(&self, key: Option<&Value>, id: RowId) -> DeleteResult;
    fn transform(&self, old_key: Option<&Value>, key: Option<&Value>, id: RowId);
    fn search(&self, key: Option<&Value>) -> HashSet<RowId>;
    fn condition_search(
        &self,
        evaluator: &dyn ConditionEvaluator<Value>,
        condition: &SimpleCondition,
        limit: Option<usize>,
    ) -> HashSet<RowId>;
    fn persist(&self) -> StoreResult<bool>;
    fn clear(&self) -> bool;
}

impl<S: OrderedStore<Value, RowId>> FieldIndex for FieldKeeper<Value, RowId, S> {
    fn field(&self) -> &str {
        FieldKeeper::field(self)
    }

    fn insert(&self, key: Option<&Value>, id: RowId) {
        FieldKeeper::insert(self, key.cloned(), id)
    }

    fn delete(&self, key: Option<&Value>, id: RowId) -> DeleteResult {
        FieldKeeper::delete(self, key, &id)
    }

    fn transform(&self, old_key: Option<&Value>, key: Option<&Value>, id: RowId) {
        FieldKeeper::transform(self, old_key, key.cloned(), id)
    }

    fn search(&self, key: Option<&Value>) -> HashSet<RowId> {
        FieldKeeper::search(self, key)
    }

    fn condition_search(
        &self,
        evaluator: &dyn ConditionEvaluator<Value>,
        condition: &SimpleCondition,
        limit: Option<usize>,
    ) -> HashSet<RowId> {
        FieldKeeper::condition_search(self, evaluator, condition, limit)
    }

    fn persist(&self) -> StoreResult<bool> {
        FieldKeeper::persist(self)
    }

    fn clear(&self) -> bool {
        FieldKeeper::clear(self)
    }
}

/// Open the keeper of `field` backed by the structure `kind` names.
pub fn open_index(kind: KeeperKind, field: &str, base: &Path, converter: ObjectConverter) -> StoreResult<Arc<dyn FieldIndex>> {
    let index: Arc<dyn FieldIndex> = match kind {
        KeeperKind::Tree => Arc::new(FieldKeeper::<Value, RowId, BinaryTree<Value, RowId>>::open(field, base, converter)?),
        KeeperKind::Map => Arc::new(FieldKeeper::<Value, RowId, SortedMap<Value, RowId>>::open(field, base, converter)?),
    };
    Ok(index)
}

/// Persists a keeper on shutdown.
pub struct KeeperDestroyer(pub Arc<dyn FieldIndex>);

impl Destroyable for KeeperDestroyer {
    fn name(&self) -> String {
        format!("field keeper {}", self.0.field())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.0.persist().map(|_| ())
    }
}
