//! Table manager: the set of tables under one root directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use rowstore_core::{Config, DestroyService, ObjectConverter, StoreError};

use crate::error::{TableError, TableResult};
use crate::table::Table;

const TABLES_FILE: &str = "tables";

/// Owns every table of a store and the destroy service they share.
pub struct TableManager {
    dir: PathBuf,
    config: Config,
    converter: ObjectConverter,
    destroy: DestroyService,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
}

impl TableManager {
    /// Open the store rooted at `dir`, reopening every listed table and
    /// starting the idle destroyer.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> TableResult<Self> {
        config.validate().map_err(StoreError::Config)?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io_at(&dir, &e, "Failed to create store directory"))?;
        let converter = ObjectConverter::new(&config);
        let destroy = DestroyService::new();

        let names = converter.from_file::<Vec<String>>(&dir.join(TABLES_FILE))?.unwrap_or_default();
        let mut tables = BTreeMap::new();
        for name in names {
            let table = Table::open(&name, dir.join(&name), &config, destroy.clone())?;
            tables.insert(name, Arc::new(table));
        }
        destroy.start_idle(config.idle_destroy)?;
        tracing::info!(dir = %dir.display(), tables = tables.len(), "table manager opened");

        Ok(Self { dir, config, converter, destroy, tables: RwLock::new(tables) })
    }

    /// Create table `name`, or return the existing one.
    pub fn create(&self, name: &str) -> TableResult<Arc<Table>> {
        check_name(name)?;
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(Table::open(name, self.dir.join(name), &self.config, self.destroy.clone())?);
        tables.insert(name.to_string(), Arc::clone(&table));
        if let Err(e) = self.persist(&tables) {
            tables.remove(name);
            table.stop();
            return Err(e);
        }
        tracing::info!(table = name, "table created");
        Ok(table)
    }

    /// Stop table `name` and remove its directory. Returns false if no such
    /// table exists.
    pub fn delete(&self, name: &str) -> TableResult<bool> {
        let mut tables = self.tables.write();
        let Some(table) = tables.remove(name) else {
            return Ok(false);
        };
        table.stop();
        self.persist(&tables)?;
        if let Err(e) = fs::remove_dir_all(table.dir()) {
            tracing::warn!(table = name, error = %e, "failed to remove table directory");
        }
        tracing::info!(table = name, "table deleted");
        Ok(true)
    }

    pub fn table(&self, name: &str) -> TableResult<Arc<Table>> {
        self.tables.read().get(name).cloned().ok_or_else(|| TableError::NotFound(name.to_string()))
    }

    /// Table names in ascending order.
    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist every table now.
    pub fn sync(&self) -> TableResult<usize> {
        Ok(self.destroy.destroy_all()?)
    }

    /// Stop the idle destroyer and persist every table.
    pub fn close(self) -> TableResult<()> {
        self.destroy.shutdown()?;
        Ok(())
    }

    fn persist(&self, tables: &BTreeMap<String, Arc<Table>>) -> TableResult<()> {
        let names: Vec<&String> = tables.keys().collect();
        Ok(self.converter.to_file(&self.dir.join(TABLES_FILE), &names)?)
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        if let Err(e) = self.destroy.shutdown() {
            tracing::error!(dir = %self.dir.display(), error = %e, "failed to persist tables on drop");
        }
    }
}

impl std::fmt::Debug for TableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableManager")
            .field("dir", &self.dir)
            .field("tables", &self.tables())
            .finish()
    }
}

fn check_name(name: &str) -> TableResult<()> {
    let invalid = |reason| Err(TableError::InvalidName { name: name.to_string(), reason });
    if name.trim().is_empty() {
        return invalid("name must not be blank");
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return invalid("name must not contain path separators");
    }
    if name == TABLES_FILE {
        return invalid("name is reserved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = TableManager::open(dir.path(), Config::budget()).unwrap();
        let first = manager.create("people").unwrap();
        let second = manager.create("people").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.tables(), vec!["people".to_string()]);
    }

    #[test]
    fn test_invalid_names() {
        let dir = TempDir::new().unwrap();
        let manager = TableManager::open(dir.path(), Config::budget()).unwrap();
        for name in ["", "  ", "a/b", "a\\b", "..", "tables"] {
            assert!(matches!(manager.create(name), Err(TableError::InvalidName { .. })), "{:?}", name);
        }
        assert!(matches!(manager.table("nope"), Err(TableError::NotFound(_))));
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = TempDir::new().unwrap();
        let manager = TableManager::open(dir.path(), Config::budget()).unwrap();
        let table = manager.create("gone").unwrap();
        let table_dir = table.dir().to_path_buf();
        assert!(table_dir.exists());
        assert!(manager.delete("gone").unwrap());
        assert!(!manager.delete("gone").unwrap());
        assert!(!table_dir.exists());
        assert!(manager.tables().is_empty());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::budget();
        config.rows_per_file = 0;
        assert!(matches!(TableManager::open(dir.path(), config), Err(TableError::Store(StoreError::Config(_)))));
    }
}
