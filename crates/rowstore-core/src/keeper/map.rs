//! Sorted map keeper store
//!
//! Comparisons become range scans over a `BTreeMap`; NOT and LIKE have no
//! usable bound and scan every key.

use std::collections::BTreeMap;
use std::ops::Bound;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use super::{fill_to_full, is_full, DeleteResult, KeeperValue, OrderedStore};
use crate::condition::{ConditionEvaluator, SimpleCondition, SimpleKind};
use crate::value::IndexKey;

/// Sorted map from key to value set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "U: Serialize, V: Serialize", deserialize = "U: IndexKey, V: KeeperValue"))]
pub struct SortedMap<U, V: KeeperValue> {
    map: BTreeMap<U, HashSet<V>>,
}

impl<U, V: KeeperValue> Default for SortedMap<U, V> {
    fn default() -> Self {
        Self { map: BTreeMap::new() }
    }
}

fn fill<'a, U: IndexKey, V: KeeperValue>(
    entries: impl Iterator<Item = (&'a U, &'a HashSet<V>)>,
    evaluator: &dyn ConditionEvaluator<U>,
    condition: &SimpleCondition<U>,
    out: &mut HashSet<V>,
    limit: Option<usize>,
) {
    for (key, values) in entries {
        if is_full(out, limit) {
            return;
        }
        if evaluator.check(Some(key), condition) && fill_to_full(out, limit, values.iter()) {
            return;
        }
    }
}

impl<U: IndexKey, V: KeeperValue> OrderedStore<U, V> for SortedMap<U, V> {
    fn insert(&mut self, key: U, value: V) -> bool {
        self.map.entry(key).or_default().insert(value)
    }

    fn delete(&mut self, key: &U, value: &V) -> DeleteResult {
        let Some(values) = self.map.get_mut(key) else {
            return DeleteResult::NOT;
        };
        if !values.remove(value) {
            return DeleteResult::NOT;
        }
        if !values.is_empty() {
            return DeleteResult::NOT_FULLY;
        }
        self.map.remove(key);
        DeleteResult::FULLY
    }

    fn get(&self, key: &U) -> HashSet<V> {
        self.map.get(key).cloned().unwrap_or_default()
    }

    fn search(&self, evaluator: &dyn ConditionEvaluator<U>, condition: &SimpleCondition<U>, out: &mut HashSet<V>, limit: Option<usize>) {
        let Some(bound) = condition.value() else {
            if condition.kind() == SimpleKind::Not {
                fill(self.map.iter(), evaluator, condition, out, limit);
            }
            return;
        };
        match condition.kind() {
            SimpleKind::Eq => fill(self.map.get_key_value(bound).into_iter(), evaluator, condition, out, limit),
            SimpleKind::Gt => {
                let range = self.map.range::<U, _>((Bound::Excluded(bound), Bound::Unbounded));
                fill(range, evaluator, condition, out, limit)
            }
            SimpleKind::Gte => fill(self.map.range::<U, _>(bound..), evaluator, condition, out, limit),
            SimpleKind::Lt => fill(self.map.range::<U, _>(..bound), evaluator, condition, out, limit),
            SimpleKind::Lte => fill(self.map.range::<U, _>(..=bound), evaluator, condition, out, limit),
            SimpleKind::Like | SimpleKind::Not => fill(self.map.iter(), evaluator, condition, out, limit),
        }
    }

    fn key_count(&self) -> usize {
        self.map.len()
    }

    fn entries(&self) -> Vec<(U, HashSet<V>)> {
        self.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
