//! Row address ledger
//!
//! Maps row ids to where their bytes live. Rows are spread over row files by
//! id range: file `1 + (id - 1) / rows_per_file`, stored as
//! `<table>/row/row<N>`. Inside a file rows sit in ascending id order, so a
//! change in the size of one row shifts the position of every later row of the
//! same file by the same amount.
//!
//! Each id owns an append-only log of addresses; the tail is current. A new
//! version is appended whenever a row's position or size changes, and only the
//! last `MAX_VERSIONS` are kept.
//!
//! An address is "saved" once its bytes are in the row file. Unsaved rows
//! occupy no bytes: their position is only fixed when they are saved, at the
//! end of the nearest saved row before them.
//!
//! Saved addresses are persisted per row file as `<table>/rowId/row<N>`,
//! written under the row file's write lock so a flush can store them right
//! before its rewritten file is swapped in. The id counter lives in
//! `<table>/rowId/lastId`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec::ObjectConverter;
use crate::config::Config;
use crate::destroy::Destroyable;
use crate::error::{StoreError, StoreResult};
use crate::files::{ByteRange, TMP_SUFFIX};
use crate::lock::{KeyedLock, KeyedRwLock, LockMode};
use crate::stream::BatchStream;
use crate::value::RowId;

/// Address versions kept per row.
pub const MAX_VERSIONS: usize = 8;

const ROW_DIR: &str = "row";
const ROW_PREFIX: &str = "row";
const LEDGER_DIR: &str = "rowId";
const COUNTER_FILE: &str = "lastId";

/// Location of one row's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowAddress {
    pub file: u64,
    pub id: RowId,
    pub position: u64,
    pub size: u64,
}

impl RowAddress {
    pub fn end(&self) -> u64 {
        self.position + self.size
    }
}

#[derive(Debug, Clone)]
struct AddressLog {
    versions: Vec<RowAddress>,
    saved: bool,
}

impl AddressLog {
    fn current(&self) -> &RowAddress {
        // never empty: created with one version, only ever appended to
        &self.versions[self.versions.len() - 1]
    }

    fn push(&mut self, address: RowAddress) {
        if *self.current() == address {
            return;
        }
        if self.versions.len() == MAX_VERSIONS {
            self.versions.remove(0);
        }
        self.versions.push(address);
    }

    fn shift(&mut self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut next = self.current().clone();
        next.position = next.position.saturating_add_signed(delta);
        self.push(next);
    }
}

#[derive(Default)]
struct LedgerState {
    last_id: RowId,
    files: BTreeMap<u64, BTreeMap<RowId, AddressLog>>,
    /// Row files whose saved addresses differ from their persisted copy
    dirty: BTreeSet<u64>,
    counter_changed: bool,
}

impl LedgerState {
    fn log(&self, id: RowId, file: u64) -> Option<&AddressLog> {
        self.files.get(&file).and_then(|rows| rows.get(&id))
    }

    /// Where the bytes of `id` go in `file`: the end of the closest saved row
    /// with a smaller id.
    fn insertion_point(&self, file: u64, id: RowId) -> u64 {
        self.files
            .get(&file)
            .and_then(|rows| rows.range(..id).rev().find(|(_, log)| log.saved))
            .map_or(0, |(_, log)| log.current().end())
    }

    fn shift_after(&mut self, file: u64, id: RowId, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(rows) = self.files.get_mut(&file) {
            for (_, log) in rows.range_mut(id + 1..).filter(|(_, log)| log.saved) {
                log.shift(delta);
            }
        }
    }

    fn register(&mut self, file: u64, id: RowId, size: u64) -> StoreResult<RowAddress> {
        if self.log(id, file).is_some() {
            return Err(StoreError::RowExists(id));
        }
        let position = self.insertion_point(file, id);
        let address = RowAddress { file, id, position, size };
        self.files
            .entry(file)
            .or_default()
            .insert(id, AddressLog { versions: vec![address.clone()], saved: false });
        if id > self.last_id {
            self.last_id = id;
            self.counter_changed = true;
        }
        Ok(address)
    }

    fn saved_addresses(&self, file: u64) -> Vec<RowAddress> {
        self.files
            .get(&file)
            .map(|rows| rows.values().filter(|log| log.saved).map(|log| log.current().clone()).collect())
            .unwrap_or_default()
    }
}

/// Row id allocation and address bookkeeping for one table.
pub struct RowLedger {
    dir: PathBuf,
    rows_per_file: u64,
    converter: ObjectConverter,
    state: RwLock<LedgerState>,
    id_locks: KeyedLock<RowId>,
}

impl RowLedger {
    /// Open the ledger of the table stored in `dir`, loading saved state.
    pub fn open(dir: &Path, config: &Config, converter: ObjectConverter) -> StoreResult<Self> {
        let ledger = Self {
            dir: dir.to_path_buf(),
            rows_per_file: config.rows_per_file.max(1),
            converter,
            state: RwLock::new(LedgerState::default()),
            id_locks: KeyedLock::new(),
        };
        ledger.load()?;
        Ok(ledger)
    }

    fn load(&self) -> StoreResult<()> {
        let ledger_dir = self.dir.join(LEDGER_DIR);
        let entries = match fs::read_dir(&ledger_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io_at(&ledger_dir, &e, "Failed to list ledger directory")),
        };
        let mut state = self.state.write();
        state.last_id = self.converter.from_file::<RowId>(&self.counter_path())?.unwrap_or(0);
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io_at(&ledger_dir, &e, "Failed to list ledger directory"))?;
            let name = entry.file_name();
            let Some(file) = name.to_str().filter(|n| !n.ends_with(TMP_SUFFIX)).and_then(parse_file_number) else {
                continue;
            };
            let addresses = self.converter.from_file::<Vec<RowAddress>>(&entry.path())?.unwrap_or_default();
            let rows = state.files.entry(file).or_default();
            for address in addresses {
                rows.insert(address.id, AddressLog { versions: vec![address], saved: true });
            }
            if rows.is_empty() {
                state.files.remove(&file);
            }
        }
        let max_id = state.files.values().filter_map(|rows| rows.keys().next_back()).max().copied().unwrap_or(0);
        state.last_id = state.last_id.max(max_id);
        tracing::debug!(dir = %self.dir.display(), last_id = state.last_id, files = state.files.len(), "ledger loaded");
        Ok(())
    }

    fn counter_path(&self) -> PathBuf {
        self.dir.join(LEDGER_DIR).join(COUNTER_FILE)
    }

    /// Persisted saved addresses of row file `file`.
    pub fn ledger_path(&self, file: u64) -> PathBuf {
        self.dir.join(LEDGER_DIR).join(format!("{}{}", ROW_PREFIX, file))
    }

    /// Row file number holding `id`.
    pub fn file_of(&self, id: RowId) -> u64 {
        1 + id.saturating_sub(1) / self.rows_per_file
    }

    /// Path of row file `file`.
    pub fn row_path(&self, file: u64) -> PathBuf {
        self.dir.join(ROW_DIR).join(format!("{}{}", ROW_PREFIX, file))
    }

    /// Path of the row file holding `id`.
    pub fn path_of(&self, id: RowId) -> PathBuf {
        self.row_path(self.file_of(id))
    }

    pub fn range_of(&self, address: &RowAddress) -> ByteRange {
        ByteRange { path: self.row_path(address.file), position: address.position, size: address.size }
    }

    /// Allocate the next row id.
    pub fn new_id(&self) -> RowId {
        let mut state = self.state.write();
        state.last_id += 1;
        state.counter_changed = true;
        state.last_id
    }

    pub fn last_id(&self) -> RowId {
        self.state.read().last_id
    }

    /// Allocate the next id and register an unsaved address of `size` bytes
    /// for it in one step.
    pub fn add_new(&self, size: u64) -> StoreResult<RowAddress> {
        let mut state = self.state.write();
        let id = state.last_id + 1;
        let file = self.file_of(id);
        state.register(file, id, size)
    }

    /// Register an unsaved address of `size` bytes for `id`.
    pub fn add(&self, id: RowId, size: u64) -> StoreResult<RowAddress> {
        if id == 0 {
            return Err(StoreError::RowNotFound(id));
        }
        self.id_locks.with_lock(&id, || {
            let file = self.file_of(id);
            self.state.write().register(file, id, size)
        })
    }

    /// Offset in the current row file where the bytes of unsaved `id` belong.
    pub fn insertion_point(&self, id: RowId) -> u64 {
        self.state.read().insertion_point(self.file_of(id), id)
    }

    /// Apply `mutator` to the current address of `id` and mark it saved.
    ///
    /// Saving a stored row shifts every later saved row of the file by the
    /// change in size; saving a new row places it at its insertion point and
    /// shifts them by its whole size.
    pub fn save(&self, id: RowId, mutator: impl FnOnce(&mut RowAddress)) -> StoreResult<RowAddress> {
        self.id_locks.with_lock(&id, || {
            let file = self.file_of(id);
            let mut state = self.state.write();
            let insertion_point = state.insertion_point(file, id);
            let log = state
                .files
                .get_mut(&file)
                .and_then(|rows| rows.get_mut(&id))
                .ok_or(StoreError::RowNotFound(id))?;
            let mut next = log.current().clone();
            let delta = if log.saved {
                mutator(&mut next);
                next.size as i64 - log.current().size as i64
            } else {
                next.position = insertion_point;
                mutator(&mut next);
                next.size as i64
            };
            next.id = id;
            next.file = file;
            log.push(next.clone());
            log.saved = true;
            state.shift_after(file, id, delta);
            state.dirty.insert(file);
            Ok(next)
        })
    }

    /// Forget `id`; later saved rows of its file move back by its size.
    pub fn delete(&self, id: RowId) -> Option<RowAddress> {
        self.id_locks.with_lock(&id, || {
            let file = self.file_of(id);
            let mut state = self.state.write();
            let rows = state.files.get_mut(&file)?;
            let log = rows.remove(&id)?;
            if rows.is_empty() {
                state.files.remove(&file);
            }
            let removed = log.current().clone();
            if log.saved {
                state.shift_after(file, id, -(removed.size as i64));
                state.dirty.insert(file);
            }
            Some(removed)
        })
    }

    /// Run `consumer` on the current saved address of `id`.
    pub fn process<T>(&self, id: RowId, consumer: impl FnOnce(&RowAddress) -> T) -> Option<T> {
        self.id_locks.with_lock(&id, || {
            let state = self.state.read();
            match state.log(id, self.file_of(id)) {
                Some(log) if log.saved => Some(consumer(log.current())),
                _ => None,
            }
        })
    }

    /// Current address of `id`, saved or not.
    pub fn get(&self, id: RowId) -> Option<RowAddress> {
        let state = self.state.read();
        state.log(id, self.file_of(id)).map(|log| log.current().clone())
    }

    pub fn contains(&self, id: RowId) -> bool {
        let state = self.state.read();
        state.log(id, self.file_of(id)).is_some()
    }

    pub fn is_saved(&self, id: RowId) -> bool {
        let state = self.state.read();
        state.log(id, self.file_of(id)).map_or(false, |log| log.saved)
    }

    /// Address versions of `id`, oldest first.
    pub fn history(&self, id: RowId) -> Vec<RowAddress> {
        let state = self.state.read();
        state.log(id, self.file_of(id)).map(|log| log.versions.clone()).unwrap_or_default()
    }

    /// Number of registered rows.
    pub fn count(&self) -> usize {
        self.state.read().files.values().map(BTreeMap::len).sum()
    }

    /// All registered ids, ascending.
    pub fn ids(&self) -> Vec<RowId> {
        let state = self.state.read();
        state.files.values().flat_map(|rows| rows.keys().copied()).collect()
    }

    /// Saved addresses grouped per row file, ascending by id.
    ///
    /// Each batch is read while its row file is locked in `mode`. With `ids`
    /// only those rows are streamed and files without any of them are skipped.
    pub fn batch_stream(&self, mode: LockMode, ids: Option<&HashSet<RowId>>, locks: Arc<KeyedRwLock<PathBuf>>) -> BatchStream<'_, RowAddress> {
        let mut stream = BatchStream::new(locks, mode);
        let files: Vec<u64> = {
            let state = self.state.read();
            match ids {
                Some(ids) => {
                    let mut files: Vec<u64> = ids.iter().map(|id| self.file_of(*id)).collect();
                    files.sort_unstable();
                    files.dedup();
                    files.retain(|file| state.files.contains_key(file));
                    files
                }
                None => state.files.keys().copied().collect(),
            }
        };
        for file in files {
            let filter = ids.map(|ids| ids.clone());
            stream.push_batch(self.row_path(file), move || {
                let state = self.state.read();
                let Some(rows) = state.files.get(&file) else {
                    return Ok(Vec::new());
                };
                Ok(rows
                    .iter()
                    .filter(|(id, log)| log.saved && filter.as_ref().map_or(true, |f| f.contains(*id)))
                    .map(|(_, log)| log.current().clone())
                    .collect())
            });
        }
        stream
    }

    /// Write the saved addresses of row file `file` if they changed.
    ///
    /// Runs under the row file's write lock; a flush calls it while holding
    /// that lock, right before swapping the rewritten file in.
    pub fn persist_file(&self, file: u64) -> StoreResult<bool> {
        let _file = self.converter.files().locks().write(&self.row_path(file));
        let addresses = {
            let mut state = self.state.write();
            if !state.dirty.remove(&file) {
                return Ok(false);
            }
            state.saved_addresses(file)
        };
        let path = self.ledger_path(file);
        let written = if addresses.is_empty() {
            if self.converter.files().delete(&path) {
                Ok(())
            } else {
                Err(StoreError::Io {
                    path: Some(path.clone()),
                    kind: io::ErrorKind::Other,
                    message: "cannot remove emptied ledger file".into(),
                })
            }
        } else {
            self.converter.to_file(&path, &addresses)
        };
        if let Err(e) = written {
            self.state.write().dirty.insert(file);
            return Err(e);
        }
        tracing::trace!(file, rows = addresses.len(), "ledger file persisted");
        Ok(true)
    }

    /// Persist every changed row file and the id counter.
    pub fn persist(&self) -> StoreResult<bool> {
        let (dirty, counter) = {
            let mut state = self.state.write();
            let counter = std::mem::take(&mut state.counter_changed).then_some(state.last_id);
            (state.dirty.iter().copied().collect::<Vec<u64>>(), counter)
        };
        let mut persisted = false;
        for file in dirty {
            persisted |= self.persist_file(file)?;
        }
        if let Some(last_id) = counter {
            if let Err(e) = self.converter.to_file(&self.counter_path(), &last_id) {
                self.state.write().counter_changed = true;
                return Err(e);
            }
            persisted = true;
        }
        if persisted {
            tracing::debug!(dir = %self.dir.display(), "ledger persisted");
        }
        Ok(persisted)
    }
}

fn parse_file_number(name: &str) -> Option<u64> {
    name.strip_prefix(ROW_PREFIX)?.parse().ok()
}

impl Destroyable for RowLedger {
    fn name(&self) -> String {
        format!("ledger {}", self.dir.display())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.persist().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileHelper;
    use tempfile::TempDir;

    fn ledger(dir: &Path, rows_per_file: u64) -> RowLedger {
        let mut config = Config::budget();
        config.rows_per_file = rows_per_file;
        let files = FileHelper::with_locks(Arc::new(KeyedRwLock::new()), false);
        RowLedger::open(dir, &config, ObjectConverter::with_files(files, true)).unwrap()
    }

    #[test]
    fn test_ids_are_monotonic_and_files_by_range() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        assert_eq!(ledger.new_id(), 1);
        assert_eq!(ledger.new_id(), 2);
        assert_eq!(ledger.file_of(1), 1);
        assert_eq!(ledger.file_of(10), 1);
        assert_eq!(ledger.file_of(11), 2);
        assert_eq!(ledger.row_path(2), dir.path().join("row").join("row2"));
    }

    #[test]
    fn test_unsaved_rows_take_no_space() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        assert_eq!(ledger.add(1, 5).unwrap().position, 0);
        assert_eq!(ledger.add(2, 7).unwrap().position, 0);
        assert_eq!(ledger.add(11, 3).unwrap().position, 0);
        assert!(matches!(ledger.add(2, 1), Err(StoreError::RowExists(2))));
        assert_eq!(ledger.last_id(), 11);

        ledger.save(1, |_| ()).unwrap();
        assert_eq!(ledger.insertion_point(2), 5);
        assert_eq!(ledger.save(2, |_| ()).unwrap().position, 5);

        // an unsaved row leaves without moving anything
        ledger.add(3, 4).unwrap();
        ledger.delete(3).unwrap();
        assert_eq!(ledger.get(2).unwrap().position, 5);
    }

    #[test]
    fn test_rows_saved_out_of_order_stay_in_id_order() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        for _ in 0..3 {
            ledger.add_new(1).unwrap();
        }
        assert_eq!(ledger.save(3, |a| a.size = 4).unwrap().position, 0);
        assert_eq!(ledger.save(2, |a| a.size = 6).unwrap().position, 0);
        assert_eq!(ledger.get(3).unwrap().position, 6);
        assert_eq!(ledger.save(1, |a| a.size = 5).unwrap().position, 0);
        assert_eq!(ledger.get(2).unwrap().position, 5);
        assert_eq!(ledger.get(3).unwrap().position, 11);
    }

    #[test]
    fn test_add_new_allocates_and_registers() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 2);
        assert_eq!(ledger.new_id(), 1);
        let address = ledger.add_new(9).unwrap();
        assert_eq!((address.id, address.file, address.size), (2, 1, 9));
        assert_eq!(ledger.add_new(9).unwrap().file, 2);
        assert!(ledger.contains(2));
        assert!(!ledger.contains(1));
        assert!(!ledger.is_saved(2));
    }

    #[test]
    fn test_save_and_delete_shift_later_rows() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        for id in 1..=3 {
            ledger.add(id, 10).unwrap();
            ledger.save(id, |_| ()).unwrap();
        }
        ledger.save(1, |a| a.size = 15).unwrap();
        assert_eq!(ledger.get(2).unwrap().position, 15);
        assert_eq!(ledger.get(3).unwrap().position, 25);
        assert_eq!(ledger.history(3).len(), 2);

        let removed = ledger.delete(2).unwrap();
        assert_eq!(removed.size, 10);
        assert_eq!(ledger.get(3).unwrap().position, 15);
        assert_eq!(ledger.history(3).last().unwrap().position, 15);
        assert!(ledger.delete(2).is_none());
    }

    #[test]
    fn test_process_sees_only_saved_rows() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        ledger.add(1, 4).unwrap();
        assert!(ledger.process(1, |a| a.size).is_none());
        assert!(ledger.contains(1));
        ledger.save(1, |_| ()).unwrap();
        assert_eq!(ledger.process(1, |a| a.size), Some(4));
        assert!(ledger.process(99, |a| a.size).is_none());
        assert!(matches!(ledger.save(99, |_| ()), Err(StoreError::RowNotFound(99))));
    }

    #[test]
    fn test_version_log_is_bounded() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 10);
        ledger.add(1, 1).unwrap();
        for size in 2..20 {
            ledger.save(1, |a| a.size = size).unwrap();
        }
        let history = ledger.history(1);
        assert_eq!(history.len(), MAX_VERSIONS);
        assert_eq!(history.last().unwrap().size, 19);
    }

    #[test]
    fn test_batch_stream_groups_by_file() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(dir.path(), 2);
        for id in 1..=5 {
            ledger.add(id, 1).unwrap();
            if id != 4 {
                ledger.save(id, |_| ()).unwrap();
            }
        }
        let locks = Arc::new(KeyedRwLock::new());
        let mut batches = Vec::new();
        ledger
            .batch_stream(LockMode::Read, None, Arc::clone(&locks))
            .for_each_batch(|path, items| {
                batches.push((path.to_path_buf(), items.iter().map(|a| a.id).collect::<Vec<_>>()));
                Ok(())
            })
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].1, vec![3]);
        assert_eq!(batches[2], (ledger.row_path(3), vec![5]));

        let only: HashSet<RowId> = [2, 5].into_iter().collect();
        let ids: Vec<RowId> = {
            let mut ids = Vec::new();
            ledger
                .batch_stream(LockMode::Write, Some(&only), locks)
                .for_each(|a| {
                    ids.push(a.id);
                    Ok(())
                })
                .unwrap();
            ids
        };
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = ledger(dir.path(), 10);
            let id = ledger.new_id();
            ledger.add(id, 8).unwrap();
            ledger.save(id, |_| ()).unwrap();
            let pending = ledger.new_id();
            ledger.add(pending, 3).unwrap();
            assert!(ledger.persist().unwrap());
            assert!(!ledger.persist().unwrap());
        }
        let ledger = ledger(dir.path(), 10);
        assert_eq!(ledger.last_id(), 2);
        assert_eq!(ledger.count(), 1);
        assert_eq!(ledger.process(1, |a| a.size), Some(8));
    }

    #[test]
    fn test_persist_file_writes_one_row_file() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = ledger(dir.path(), 2);
            for id in 1..=3 {
                ledger.add_new(1).unwrap();
                ledger.save(id, |a| a.size = 10).unwrap();
            }
            assert!(ledger.persist_file(2).unwrap());
            assert!(!ledger.persist_file(2).unwrap());
            assert!(ledger.ledger_path(2).exists());
            assert!(!ledger.ledger_path(1).exists());
        }
        // no counter was written: ids resume after the highest saved one
        let ledger = ledger(dir.path(), 2);
        assert_eq!(ledger.ids(), vec![3]);
        assert_eq!(ledger.last_id(), 3);
        assert_eq!(ledger.process(3, |a| (a.position, a.size)), Some((0, 10)));

        ledger.delete(3).unwrap();
        assert!(ledger.persist_file(2).unwrap());
        assert!(!ledger.ledger_path(2).exists());
    }
}
