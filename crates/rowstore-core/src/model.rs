//! Model service: the field schema of one table
//!
//! Tracks declared fields, their types and which of them are indexed. Field
//! names are matched ignoring ASCII case everywhere; the spelling given when a
//! field was declared is the one stored in rows and indexes. Subscribers hear about every effective change of the field set or of the
//! indexed set, with the complete new set. State is persisted to
//! `<table>/model` when destroyed after a change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::codec::ObjectConverter;
use crate::destroy::Destroyable;
use crate::error::{StoreError, StoreResult};
use crate::value::{FieldType, Row, Value};

const MODEL_FILE: &str = "model";

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub is_index: bool,
}

/// Callback receiving the complete field set (or indexed set) after a change.
pub type ModelSubscriber = Arc<dyn Fn(&HashSet<String>) -> StoreResult<()> + Send + Sync>;

/// Field schema of one table.
pub struct ModelService {
    path: PathBuf,
    converter: ObjectConverter,
    fields: RwLock<BTreeMap<String, FieldInfo>>,
    changed: AtomicBool,
    field_subscribers: Mutex<Vec<ModelSubscriber>>,
    index_subscribers: Mutex<Vec<ModelSubscriber>>,
}

impl ModelService {
    /// Open the model stored in `dir`, or start with no fields.
    pub fn open(dir: &Path, converter: ObjectConverter) -> StoreResult<Self> {
        let path = dir.join(MODEL_FILE);
        let fields = match converter.from_file::<Vec<FieldInfo>>(&path)? {
            Some(list) => list.into_iter().map(|info| (info.name.clone(), info)).collect(),
            None => BTreeMap::new(),
        };
        Ok(Self {
            path,
            converter,
            fields: RwLock::new(fields),
            changed: AtomicBool::new(false),
            field_subscribers: Mutex::new(Vec::new()),
            index_subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn contains(&self, field: &str) -> bool {
        lookup(&self.fields.read(), field).is_some()
    }

    /// Declare `field`. Returns false if a field of that name (ignoring case)
    /// already exists.
    pub fn add(&self, field: &str, field_type: FieldType) -> StoreResult<bool> {
        let field = field.trim();
        if field.is_empty() {
            return Err(StoreError::field(field, "field name must not be blank"));
        }
        {
            let mut fields = self.fields.write();
            if lookup(&fields, field).is_some() {
                return Ok(false);
            }
            fields.insert(field.to_string(), FieldInfo { name: field.to_string(), field_type, is_index: false });
        }
        self.changed.store(true, Ordering::Release);
        tracing::info!(field, %field_type, "field added");
        self.notify(&self.field_subscribers, self.field_names())?;
        Ok(true)
    }

    /// Remove `fields` (and their indexes). Returns whether any existed.
    pub fn delete(&self, fields: &[&str]) -> StoreResult<bool> {
        let (deleted, deleted_index) = {
            let mut map = self.fields.write();
            let mut deleted = false;
            let mut deleted_index = false;
            for field in fields {
                let Some(name) = lookup(&map, field).map(|info| info.name.clone()) else {
                    continue;
                };
                if let Some(info) = map.remove(&name) {
                    deleted = true;
                    deleted_index |= info.is_index;
                }
            }
            (deleted, deleted_index)
        };
        if deleted {
            self.changed.store(true, Ordering::Release);
            tracing::info!(fields = ?fields, "fields deleted");
            self.notify(&self.field_subscribers, self.field_names())?;
        }
        if deleted_index {
            self.notify(&self.index_subscribers, self.indexed_fields())?;
        }
        Ok(deleted)
    }

    /// Mark `fields` as indexed. Unknown fields are an error and nothing is
    /// changed.
    pub fn add_index(&self, fields: &[&str]) -> StoreResult<bool> {
        self.set_index(fields, true)
    }

    pub fn delete_index(&self, fields: &[&str]) -> StoreResult<bool> {
        self.set_index(fields, false)
    }

    fn set_index(&self, fields: &[&str], index: bool) -> StoreResult<bool> {
        let changed = {
            let mut map = self.fields.write();
            let mut names = Vec::with_capacity(fields.len());
            for field in fields {
                match lookup(&map, field) {
                    Some(info) => names.push(info.name.clone()),
                    None => return Err(StoreError::field(*field, "unknown field")),
                }
            }
            let mut changed = false;
            for name in names {
                if let Some(info) = map.get_mut(&name) {
                    changed |= info.is_index != index;
                    info.is_index = index;
                }
            }
            changed
        };
        if changed {
            self.changed.store(true, Ordering::Release);
            tracing::info!(fields = ?fields, index, "indexes changed");
            self.notify(&self.index_subscribers, self.indexed_fields())?;
        }
        Ok(changed)
    }

    /// Every declared field, by name.
    pub fn fields(&self) -> Vec<FieldInfo> {
        self.fields.read().values().cloned().collect()
    }

    pub fn field(&self, name: &str) -> Option<FieldInfo> {
        lookup(&self.fields.read(), name).cloned()
    }

    pub fn field_names(&self) -> HashSet<String> {
        self.fields.read().keys().cloned().collect()
    }

    pub fn indexed_fields(&self) -> HashSet<String> {
        self.fields.read().values().filter(|info| info.is_index).map(|info| info.name.clone()).collect()
    }

    /// Convert `text` to a value of the declared type of `field`.
    pub fn parse_value(&self, field: &str, text: &str) -> StoreResult<Value> {
        let info = self.field(field).ok_or_else(|| StoreError::field(field, "unknown field"))?;
        info.field_type.parse(text).map_err(|reason| StoreError::field(field, reason))
    }

    /// Check that every value of `values` belongs to a declared field of a
    /// matching type.
    pub fn check<'a>(&self, values: impl IntoIterator<Item = (&'a String, &'a Value)>) -> StoreResult<()> {
        let fields = self.fields.read();
        for (name, value) in values {
            declared(&fields, name, value)?;
        }
        Ok(())
    }

    /// Check `row` like `check` and rename its fields to their declared
    /// spelling.
    pub fn normalize(&self, row: &mut Row) -> StoreResult<()> {
        let fields = self.fields.read();
        let mut normalized = BTreeMap::new();
        for (name, value) in std::mem::take(&mut row.fields) {
            let info = declared(&fields, &name, &value)?;
            normalized.insert(info.name.clone(), value);
        }
        row.fields = normalized;
        Ok(())
    }

    /// Called with the field set after each change of it.
    pub fn subscribe_fields(&self, subscriber: impl Fn(&HashSet<String>) -> StoreResult<()> + Send + Sync + 'static) {
        self.field_subscribers.lock().push(Arc::new(subscriber));
    }

    /// Called with the indexed set after each change of it.
    pub fn subscribe_indexes(&self, subscriber: impl Fn(&HashSet<String>) -> StoreResult<()> + Send + Sync + 'static) {
        self.index_subscribers.lock().push(Arc::new(subscriber));
    }

    fn notify(&self, subscribers: &Mutex<Vec<ModelSubscriber>>, set: HashSet<String>) -> StoreResult<()> {
        let subscribers = subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(&set)?;
        }
        Ok(())
    }

    /// Write the schema if it changed.
    pub fn persist(&self) -> StoreResult<bool> {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let list = self.fields();
        if let Err(e) = self.converter.to_file(&self.path, &list) {
            self.changed.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }
}

fn lookup<'a>(fields: &'a BTreeMap<String, FieldInfo>, name: &str) -> Option<&'a FieldInfo> {
    fields.get(name).or_else(|| fields.values().find(|info| info.name.eq_ignore_ascii_case(name)))
}

fn declared<'a>(fields: &'a BTreeMap<String, FieldInfo>, name: &str, value: &Value) -> StoreResult<&'a FieldInfo> {
    let info = lookup(fields, name).ok_or_else(|| StoreError::field(name, "unknown field"))?;
    if !info.field_type.accepts(value) {
        return Err(StoreError::field(name, format!("value {} does not fit type {}", value, info.field_type)));
    }
    Ok(info)
}

impl Destroyable for ModelService {
    fn name(&self) -> String {
        format!("model {}", self.path.display())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.persist().map(|_| ())
    }
}
