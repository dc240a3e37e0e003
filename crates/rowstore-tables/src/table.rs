//! One table: model, ledger, indexes and rows behind a narrow interface.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use rowstore_core::{
    Condition, Config, DestroyService, Destroyable, FieldInfo, FieldType, IndexService, ModelService, ObjectConverter,
    Registration, Row, RowId, RowLedger, RowRepository, StoreError, Value,
};

use crate::error::{TableError, TableResult};

/// A named table stored in its own directory.
pub struct Table {
    name: String,
    dir: PathBuf,
    model: Arc<ModelService>,
    index: Arc<IndexService>,
    ledger: Arc<RowLedger>,
    repository: Arc<RowRepository>,
    destroy: DestroyService,
    registrations: Mutex<Vec<Registration>>,
}

impl Table {
    /// Open (or create) the table stored in `dir`.
    ///
    /// Indexed fields without a keeper file are backfilled before this
    /// returns.
    pub fn open(name: &str, dir: PathBuf, config: &Config, destroy: DestroyService) -> TableResult<Self> {
        fs::create_dir_all(&dir).map_err(|e| StoreError::io_at(&dir, &e, "Failed to create table directory"))?;
        let converter = ObjectConverter::new(config);
        let model = Arc::new(ModelService::open(&dir, converter.clone())?);
        let ledger = Arc::new(RowLedger::open(&dir, config, converter.clone())?);
        let index = Arc::new(IndexService::open(&dir, &model.indexed_fields(), config.keeper_kind, converter.clone())?);
        let repository = RowRepository::open(config, Arc::clone(&ledger), Arc::clone(&index), Arc::clone(&model), converter);

        let weak = Arc::downgrade(&index);
        model.subscribe_indexes(move |indexed| match weak.upgrade() {
            Some(index) => index.reconcile(indexed),
            None => Ok(()),
        });
        index.reconcile(&model.indexed_fields())?;

        // repository first: its flush moves ledger addresses
        let registrations = vec![
            destroy.register(Arc::clone(&repository) as Arc<dyn Destroyable>),
            destroy.register(Arc::clone(&ledger) as Arc<dyn Destroyable>),
            destroy.register(Arc::clone(&index) as Arc<dyn Destroyable>),
            destroy.register(Arc::clone(&model) as Arc<dyn Destroyable>),
        ];
        tracing::info!(table = name, dir = %dir.display(), rows = ledger.count(), "table opened");
        Ok(Self {
            name: name.to_string(),
            dir,
            model,
            index,
            ledger,
            repository,
            destroy,
            registrations: Mutex::new(registrations),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Declare a field. Returns false if it already exists (ignoring case).
    pub fn add_field(&self, field: &str, field_type: FieldType) -> TableResult<bool> {
        self.destroy.wake_up();
        Ok(self.model.add(field, field_type)?)
    }

    /// Declare a field by type name (`"int"`, `"string"`, ...).
    pub fn add_field_named(&self, field: &str, type_name: &str) -> TableResult<bool> {
        let field_type = FieldType::from_name(type_name).ok_or_else(|| TableError::UnknownType(type_name.to_string()))?;
        self.add_field(field, field_type)
    }

    /// Remove fields from the model and from every row.
    pub fn delete_fields(&self, fields: &[&str]) -> TableResult<bool> {
        self.destroy.wake_up();
        Ok(self.model.delete(fields)?)
    }

    /// Index `fields`, backfilling them from existing rows.
    pub fn add_index(&self, fields: &[&str]) -> TableResult<bool> {
        self.destroy.wake_up();
        Ok(self.model.add_index(fields)?)
    }

    pub fn delete_index(&self, fields: &[&str]) -> TableResult<bool> {
        self.destroy.wake_up();
        Ok(self.model.delete_index(fields)?)
    }

    pub fn fields(&self) -> Vec<FieldInfo> {
        self.model.fields()
    }

    /// Fields whose indexes currently answer searches.
    pub fn indexed_fields(&self) -> Vec<String> {
        self.index.indexed_fields()
    }

    /// Insert (id 0) or update a row, returning its id.
    pub fn save_row(&self, row: Row) -> TableResult<RowId> {
        self.destroy.wake_up();
        Ok(self.repository.add(row)?)
    }

    pub fn delete_row(&self, id: RowId) -> TableResult<bool> {
        self.destroy.wake_up();
        Ok(self.repository.delete(id)?)
    }

    pub fn get_row(&self, id: RowId) -> TableResult<Option<Row>> {
        self.destroy.wake_up();
        Ok(self.repository.get(id)?)
    }

    /// Rows matching `condition`, ascending by id, paged by `from`/`size`.
    pub fn search(&self, condition: Option<&Condition>, from: usize, size: usize) -> TableResult<Vec<Row>> {
        self.destroy.wake_up();
        Ok(self.repository.list(condition, from, size)?)
    }

    /// Number of rows matching `condition`, capped at `max`.
    pub fn count(&self, condition: Option<&Condition>, max: Option<usize>) -> TableResult<usize> {
        self.destroy.wake_up();
        Ok(self.repository.count(condition, max)?)
    }

    /// Parse a text condition, typing each bound by its field's declared type.
    pub fn parse_condition(&self, text: &str) -> TableResult<Option<Condition>> {
        let resolve = |field: &str, value: &str| -> Result<Value, StoreError> { self.model.parse_value(field, value) };
        Ok(Condition::parse(text, &resolve)?)
    }

    /// Write staged rows to disk.
    pub fn flush(&self) -> TableResult<usize> {
        Ok(self.repository.flush()?)
    }

    /// Number of rows with a stored or staged address.
    pub fn row_count(&self) -> usize {
        self.ledger.count()
    }

    /// Detach from the destroy service without persisting anything.
    pub(crate) fn stop(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for registration in registrations {
            registration.stop();
        }
        tracing::debug!(table = %self.name, "table stopped");
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("rows", &self.ledger.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowstore_core::SimpleKind;
    use tempfile::TempDir;

    fn table(dir: &Path) -> Table {
        Table::open("people", dir.join("people"), &Config::budget(), DestroyService::new()).unwrap()
    }

    #[test]
    fn test_open_and_debug() {
        let dir = TempDir::new().unwrap();
        let table = table(dir.path());
        let debug_str = format!("{:?}", table);
        assert!(debug_str.contains("people"));
        assert!(table.dir().exists());
    }

    #[test]
    fn test_field_type_by_name() {
        let dir = TempDir::new().unwrap();
        let table = table(dir.path());
        assert!(table.add_field_named("age", "int").unwrap());
        assert!(matches!(table.add_field_named("x", "decimal"), Err(TableError::UnknownType(_))));
        assert_eq!(table.fields()[0].field_type, FieldType::Int);
    }

    #[test]
    fn test_parse_condition_types_bounds() {
        let dir = TempDir::new().unwrap();
        let table = table(dir.path());
        table.add_field("age", FieldType::Int).unwrap();
        for age in [10, 20, 30] {
            table.save_row(Row::new().set("age", age)).unwrap();
        }
        let condition = table.parse_condition("age GTE 20").unwrap().unwrap();
        assert_eq!(table.count(Some(&condition), None).unwrap(), 2);
        assert!(table.parse_condition("  ").unwrap().is_none());
        assert!(table.parse_condition("height EQ 3").is_err());

        let manual = Condition::simple(SimpleKind::Lt, "age", 20).unwrap();
        assert_eq!(table.search(Some(&manual), 0, 10).unwrap().len(), 1);
    }
}
