//! Row repository: row CRUD over the buffer, the ledger and the row files
//!
//! Mutations update the indexes at once and are staged in the write-behind
//! buffer; `flush` turns the staged elements into one `collect` pass per row
//! file. New rows are inserted at their place in id order, and each file's
//! addresses are persisted before the rewritten file is swapped in. Reads look
//! at the buffer first and fall back to the row files, holding the file's
//! read lock across the ledger lookup and the read so a concurrent flush
//! cannot move the row in between.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::buffer::{Buffer, Element, State};
use crate::codec::ObjectConverter;
use crate::condition::{Condition, StandardEvaluator};
use crate::config::Config;
use crate::destroy::Destroyable;
use crate::error::{StoreError, StoreResult};
use crate::files::{skip, ChainInput, CollectEntry, FileHelper};
use crate::index::IndexService;
use crate::ledger::{RowAddress, RowLedger};
use crate::lock::{KeyedLock, LockMode};
use crate::model::ModelService;
use crate::stream::StopFlag;
use crate::value::{Row, RowId};

const PROGRESS_EVERY: usize = 1000;

/// Rows of one table.
pub struct RowRepository {
    ledger: Arc<RowLedger>,
    index: Arc<IndexService>,
    model: Arc<ModelService>,
    converter: ObjectConverter,
    files: FileHelper,
    evaluator: StandardEvaluator,
    buffer: Buffer<Row>,
    row_locks: KeyedLock<RowId>,
    flush_lock: Mutex<()>,
    /// Field set last seen from the model
    fields: Mutex<HashSet<String>>,
}

impl RowRepository {
    /// Wire a repository to its table's services.
    ///
    /// The repository subscribes to field deletions (rows are rewritten
    /// without the removed fields) and to new indexes (which it backfills).
    pub fn open(
        config: &Config,
        ledger: Arc<RowLedger>,
        index: Arc<IndexService>,
        model: Arc<ModelService>,
        converter: ObjectConverter,
    ) -> Arc<Self> {
        let repository = Arc::new(Self {
            files: converter.files().clone(),
            fields: Mutex::new(model.field_names()),
            ledger,
            index,
            model,
            converter,
            evaluator: StandardEvaluator,
            buffer: Buffer::new(config.buffer_max_size),
            row_locks: KeyedLock::new(),
            flush_lock: Mutex::new(()),
        });

        let weak = Arc::downgrade(&repository);
        repository.model.subscribe_fields(move |fields| match weak.upgrade() {
            Some(repository) => repository.strip_deleted_fields(fields),
            None => Ok(()),
        });
        let weak = Arc::downgrade(&repository);
        repository.index.subscribe_new_indexes(move |index, fields| match weak.upgrade() {
            Some(repository) => repository.backfill(index, fields),
            None => Ok(()),
        });
        repository
    }

    /// Insert (id 0) or update a row. Returns its id.
    pub fn add(&self, mut row: Row) -> StoreResult<RowId> {
        self.model.normalize(&mut row)?;
        if row.id == 0 {
            let size = self.converter.to_bytes(&row)?.len() as u64;
            let id = self.ledger.add_new(size)?.id;
            row.id = id;
            self.index.insert(&row);
            self.buffer.add(row, State::Added);
            tracing::trace!(id, "row added");
            return Ok(id);
        }

        let id = row.id;
        let _row = self.row_locks.guard(&id);
        let old = self.get(id)?.ok_or(StoreError::RowNotFound(id))?;
        self.index.transform(&old, &row);
        self.buffer.add(row, State::Updated);
        tracing::trace!(id, "row updated");
        Ok(id)
    }

    /// Delete row `id`. Returns false if it does not exist.
    pub fn delete(&self, id: RowId) -> StoreResult<bool> {
        let _row = self.row_locks.guard(&id);
        let Some(row) = self.get(id)? else {
            return Ok(false);
        };
        self.index.delete(&row);
        self.buffer.add(row, State::Deleted);
        tracing::trace!(id, "row deleted");
        Ok(true)
    }

    /// Current version of row `id`, staged or stored.
    pub fn get(&self, id: RowId) -> StoreResult<Option<Row>> {
        if let Some(element) = self.buffer.get(id) {
            return Ok(visible(&element));
        }
        let _row = self.row_locks.guard(&id);
        if let Some(element) = self.buffer.get(id) {
            return Ok(visible(&element));
        }
        let row = self.read_stored(id)?;
        if let Some(row) = &row {
            self.buffer.add(row.clone(), State::Read);
        }
        Ok(row)
    }

    /// Apply `consumer` to row `id`. Returns false if it does not exist.
    pub fn process(&self, id: RowId, consumer: impl FnOnce(Row)) -> StoreResult<bool> {
        match self.get(id)? {
            Some(row) => {
                consumer(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_stored(&self, id: RowId) -> StoreResult<Option<Row>> {
        let path = self.ledger.path_of(id);
        let _file = self.files.locks().read(&path);
        let Some(address) = self.ledger.process(id, RowAddress::clone) else {
            return Ok(None);
        };
        match self.files.read(&self.ledger.range_of(&address))? {
            Some(bytes) => Ok(Some(self.converter.from_bytes(&bytes)?)),
            None => Err(StoreError::ShortRead { path, position: address.position, expected: address.size, actual: 0 }),
        }
    }

    /// Rows matching `condition` (all rows for `None`), ascending by id,
    /// skipping the first `from` and returning at most `size`.
    pub fn list(&self, condition: Option<&Condition>, from: usize, size: usize) -> StoreResult<Vec<Row>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut rows = BTreeMap::new();
        self.scan(condition, None, |row| {
            rows.insert(row.id, row);
            true
        })?;
        Ok(rows.into_values().skip(from).take(size).collect())
    }

    /// Number of rows matching `condition`, counting no further than `max`.
    pub fn count(&self, condition: Option<&Condition>, max: Option<usize>) -> StoreResult<usize> {
        let mut count = 0;
        self.scan(condition, max, |_| {
            count += 1;
            max.map_or(true, |max| count < max)
        })?;
        Ok(count)
    }

    /// Feed matching rows to `visit` until it returns false.
    ///
    /// Indexed conditions only touch the rows the indexes name; anything else
    /// is a full scan of stored rows followed by rows that exist only in the
    /// buffer.
    fn scan(&self, condition: Option<&Condition>, limit: Option<usize>, mut visit: impl FnMut(Row) -> bool) -> StoreResult<()> {
        if let Some(max) = limit {
            if max == 0 {
                return Ok(());
            }
        }
        let matches = |row: &Row| condition.map_or(true, |c| self.evaluator.matches(row, c));
        let search = condition.map(|c| self.index.search(c, limit)).filter(|result| result.found);

        if let Some(result) = search {
            let mut ids: Vec<RowId> = result.ids.into_iter().collect();
            ids.sort_unstable();
            let mut stored = HashSet::new();
            for id in ids {
                match self.buffer.get(id) {
                    Some(element) => {
                        if let Some(row) = visible(&element).filter(|row| matches(row)) {
                            if !visit(row) {
                                return Ok(());
                            }
                        }
                    }
                    None => {
                        stored.insert(id);
                    }
                }
            }
            if !stored.is_empty() {
                self.stream_stored(Some(&stored), &mut |row| Ok(!matches(&row) || visit(row)))?;
            }
            return Ok(());
        }

        let mut stopped = false;
        let seen = self.stream_stored(None, &mut |row| {
            stopped = matches(&row) && !visit(row);
            Ok(!stopped)
        })?;
        if stopped {
            return Ok(());
        }
        let stop = StopFlag::new();
        self.buffer.stream(&stop, |element| {
            if seen.contains(&element.value().id) {
                return;
            }
            if let Some(row) = visible(element).filter(|row| matches(row)) {
                if !visit(row) {
                    stop.stop();
                }
            }
        });
        Ok(())
    }

    /// Stream stored rows (restricted to `ids`) file by file, preferring
    /// staged versions. Returns every id visited, staged deletions included.
    fn stream_stored(
        &self,
        ids: Option<&HashSet<RowId>>,
        visit: &mut dyn FnMut(Row) -> StoreResult<bool>,
    ) -> StoreResult<HashSet<RowId>> {
        let mut seen = HashSet::new();
        let stream = self.ledger.batch_stream(LockMode::Read, ids, Arc::clone(self.files.locks()));
        let stop = stream.stop_flag();
        stream.for_each_batch(|path, addresses| {
            let mut input = self.files.chain_input();
            input.init(path)?;
            let mut cursor = 0;
            for address in addresses {
                if stop.is_stopped() {
                    break;
                }
                seen.insert(address.id);
                let row = match self.buffer.get(address.id) {
                    Some(element) => match visible(&element) {
                        Some(row) => row,
                        None => continue,
                    },
                    None => {
                        let row = self.read_next(&mut input, path, &address, cursor)?;
                        cursor = address.end();
                        row
                    }
                };
                if !visit(row)? {
                    stop.stop();
                }
            }
            input.close();
            Ok(())
        })?;
        Ok(seen)
    }

    /// Read the row at `address` from an input positioned at `cursor`.
    fn read_next(&self, input: &mut ChainInput, path: &Path, address: &RowAddress, cursor: u64) -> StoreResult<Row> {
        let short = |actual: u64| StoreError::ShortRead {
            path: path.to_path_buf(),
            position: address.position,
            expected: address.size,
            actual,
        };
        let Some(stream) = input.stream() else {
            return Err(short(0));
        };
        let gap = address.position.checked_sub(cursor).ok_or_else(|| short(0))?;
        let skipped = skip(stream, gap).map_err(|e| StoreError::io_at(path, &e, "Failed to skip"))?;
        if skipped < gap {
            return Err(short(0));
        }
        let mut bytes = Vec::with_capacity(address.size as usize);
        stream
            .take(address.size)
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::io_at(path, &e, "Failed to read row"))?;
        if bytes.len() as u64 != address.size {
            return Err(short(bytes.len() as u64));
        }
        self.converter.from_bytes(&bytes)
    }

    /// Write every staged mutation to the row files.
    pub fn flush(&self) -> StoreResult<usize> {
        let _flush = self.flush_lock.lock();
        self.buffer.flush(|batch| self.write_batch(batch))
    }

    /// One collect pass: per row file, in id order, removed rows are
    /// skipped, updated rows replaced and new rows inserted after their
    /// closest saved predecessor. Ledger changes are applied and the file's
    /// addresses persisted right before each file is swapped in.
    fn write_batch(&self, batch: &[Arc<Element<Row>>]) -> StoreResult<()> {
        let mut entries: Vec<(u64, RowId, CollectEntry<'_>)> = Vec::with_capacity(batch.len());
        for element in batch {
            let id = element.value().id;
            let Some(address) = self.ledger.get(id) else {
                tracing::warn!(id, state = ?element.state(), "staged row has no address, skipped");
                continue;
            };
            let saved = self.ledger.is_saved(id);
            let path = self.ledger.row_path(address.file);
            let entry = match (element.state(), saved) {
                (State::Read, _) => continue,
                (State::Deleted, false) => {
                    self.ledger.delete(id);
                    continue;
                }
                (State::Deleted, true) => CollectEntry::remove(path, address.position, address.size).then(move || {
                    self.ledger.delete(id);
                    Ok(())
                }),
                (_, saved) => {
                    let bytes = self.converter.to_bytes(element.value())?;
                    let size = bytes.len() as u64;
                    let entry = if saved {
                        CollectEntry::replace(path, address.position, address.size, bytes)
                    } else {
                        CollectEntry::insert(path, self.ledger.insertion_point(id), bytes)
                    };
                    entry.then(move || self.ledger.save(id, |a| a.size = size).map(|_| ()))
                }
            };
            entries.push((address.file, id, entry));
        }
        if entries.is_empty() {
            return Ok(());
        }
        entries.sort_by_key(|(file, id, _)| (*file, *id));
        let mut pass = Vec::with_capacity(entries.len());
        let mut entries = entries.into_iter().peekable();
        while let Some((file, _, entry)) = entries.next() {
            let last_of_file = entries.peek().map_or(true, |(next, _, _)| *next != file);
            if last_of_file {
                pass.push(entry.then(move || self.ledger.persist_file(file).map(|_| ())));
            } else {
                pass.push(entry);
            }
        }
        let stats = self.files.collect(pass)?;
        tracing::debug!(rows = stats.entries, files = stats.files, "rows flushed");
        Ok(())
    }

    /// Index every row into the keepers of `fields`.
    fn backfill(&self, index: &IndexService, fields: &HashSet<String>) -> StoreResult<()> {
        tracing::info!(fields = ?fields, "backfilling indexes");
        let mut count = 0usize;
        let seen = self.stream_stored(None, &mut |row| {
            index.insert_fields(&row, fields);
            count += 1;
            if count % PROGRESS_EVERY == 0 {
                tracing::info!(rows = count, "backfill progress");
            }
            Ok(true)
        })?;
        self.buffer.stream(&StopFlag::new(), |element| {
            if seen.contains(&element.value().id) {
                return;
            }
            if let Some(row) = visible(element) {
                index.insert_fields(&row, fields);
                count += 1;
            }
        });
        tracing::info!(rows = count, "backfill done");
        Ok(())
    }

    /// Rewrite rows that still carry fields missing from `fields`.
    fn strip_deleted_fields(&self, fields: &HashSet<String>) -> StoreResult<()> {
        let removed: HashSet<String> = {
            let mut known = self.fields.lock();
            let removed = known.difference(fields).cloned().collect();
            *known = fields.clone();
            removed
        };
        if removed.is_empty() {
            return Ok(());
        }
        tracing::info!(fields = ?removed, "removing deleted fields from rows");
        let strip = |mut row: Row| {
            let before = row.fields.len();
            row.fields.retain(|name, _| !removed.contains(name));
            (row.fields.len() != before).then_some(row)
        };

        // collected first: rewriting stages mutations, which must not happen
        // under a row file lock
        let mut rewrites = Vec::new();
        let seen = self.stream_stored(None, &mut |row| {
            rewrites.extend(strip(row));
            Ok(true)
        })?;
        self.buffer.stream(&StopFlag::new(), |element| {
            if !seen.contains(&element.value().id) {
                rewrites.extend(visible(element).and_then(&strip));
            }
        });
        let count = rewrites.len();
        for row in rewrites {
            self.add(row)?;
        }
        tracing::info!(rows = count, "deleted fields removed");
        Ok(())
    }

    /// Elements staged or cached in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Elements waiting for a flush.
    pub fn pending(&self) -> usize {
        self.buffer.size()
    }
}

fn visible(element: &Element<Row>) -> Option<Row> {
    match element.state() {
        State::Deleted => None,
        _ => Some(element.value().clone()),
    }
}

impl Destroyable for RowRepository {
    fn name(&self) -> String {
        "row repository".into()
    }

    fn destroy(&self) -> StoreResult<()> {
        self.flush().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::SimpleKind;
    use crate::config::KeeperKind;
    use crate::lock::KeyedRwLock;
    use crate::value::{FieldType, Value};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Config,
        ledger: Arc<RowLedger>,
        model: Arc<ModelService>,
        index: Arc<IndexService>,
        repository: Arc<RowRepository>,
    }

    fn fixture(rows_per_file: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::budget();
        config.rows_per_file = rows_per_file;
        config.buffer_max_size = 4;
        let files = FileHelper::with_locks(Arc::new(KeyedRwLock::new()), false);
        let converter = ObjectConverter::with_files(files, true);
        let model = Arc::new(ModelService::open(dir.path(), converter.clone()).unwrap());
        model.add("name", FieldType::String).unwrap();
        model.add("age", FieldType::Int).unwrap();
        let ledger = Arc::new(RowLedger::open(dir.path(), &config, converter.clone()).unwrap());
        let index = Arc::new(IndexService::open(dir.path(), &model.indexed_fields(), KeeperKind::Tree, converter.clone()).unwrap());
        let repository = RowRepository::open(&config, Arc::clone(&ledger), Arc::clone(&index), Arc::clone(&model), converter);
        let reconcile = Arc::clone(&index);
        model.subscribe_indexes(move |indexed| reconcile.reconcile(indexed));
        Fixture { dir, config, ledger, model, index, repository }
    }

    fn person(name: &str, age: i64) -> Row {
        Row::new().set("name", name).set("age", age)
    }

    fn eq(field: &str, value: impl Into<Value>) -> Condition {
        Condition::simple(SimpleKind::Eq, field, value).unwrap()
    }

    fn file_len(f: &Fixture, id: RowId) -> u64 {
        std::fs::metadata(f.ledger.path_of(id)).map(|m| m.len()).unwrap_or(0)
    }

    #[test]
    fn test_add_get_update_delete_across_flushes() {
        let f = fixture(3);
        let a = f.repository.add(person("a", 1)).unwrap();
        let b = f.repository.add(person("b", 2)).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(f.repository.get(a).unwrap().unwrap().get("name"), Some(&Value::from("a")));

        f.repository.flush().unwrap();
        assert!(f.ledger.is_saved(a));
        assert_eq!(f.repository.pending(), 0);

        let mut renamed = person("a-much-longer-name", 1);
        renamed.id = a;
        f.repository.add(renamed).unwrap();
        f.repository.flush().unwrap();

        assert!(f.repository.delete(b).unwrap());
        assert!(!f.repository.delete(b).unwrap());
        f.repository.flush().unwrap();

        let address = f.ledger.get(a).unwrap();
        assert_eq!(address.position, 0);
        assert_eq!(file_len(&f, a), address.size);
        assert!(f.ledger.get(b).is_none());
        let stored = f.repository.read_stored(a).unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&Value::from("a-much-longer-name")));
    }

    #[test]
    fn test_update_unknown_row_fails() {
        let f = fixture(10);
        let mut row = person("x", 1);
        row.id = 42;
        assert!(matches!(f.repository.add(row), Err(StoreError::RowNotFound(42))));
        assert!(matches!(
            f.repository.add(Row::new().set("missing", 1)),
            Err(StoreError::Field { .. })
        ));
    }

    #[test]
    fn test_rows_spread_over_files_and_list_pages() {
        let f = fixture(2);
        for n in 0..7 {
            f.repository.add(person(&format!("p{}", n), n)).unwrap();
        }
        f.repository.flush().unwrap();
        assert_eq!(f.ledger.row_path(4), f.ledger.path_of(7));
        assert!(f.ledger.path_of(7).exists());

        // staged on top of stored rows
        f.repository.delete(3).unwrap();
        f.repository.add(person("late", 99)).unwrap();

        let all = f.repository.list(None, 0, 100).unwrap();
        let ids: Vec<RowId> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5, 6, 7, 8]);
        let page: Vec<RowId> = f.repository.list(None, 2, 3).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(page, vec![4, 5, 6]);

        let older = Condition::simple(SimpleKind::Gte, "age", 4).unwrap();
        assert_eq!(f.repository.count(Some(&older), None).unwrap(), 4);
        assert_eq!(f.repository.count(Some(&older), Some(2)).unwrap(), 2);
    }

    #[test]
    fn test_indexed_search_and_backfill() {
        let f = fixture(4);
        for (name, age) in [("a", 1), ("b", 2), ("a", 3)] {
            f.repository.add(person(name, age)).unwrap();
        }
        f.repository.flush().unwrap();
        f.repository.add(person("a", 4)).unwrap();

        f.model.add_index(&["name"]).unwrap();
        assert_eq!(f.index.indexed_fields(), vec!["name".to_string()]);
        let found = f.index.search(&eq("name", "a"), None);
        assert!(found.found);
        assert_eq!(found.ids.len(), 3);

        let rows = f.repository.list(Some(&eq("name", "a")), 0, 10).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[test]
    fn test_deleted_fields_are_stripped() {
        let f = fixture(10);
        let id = f.repository.add(person("a", 30)).unwrap();
        f.repository.flush().unwrap();
        f.model.delete(&["age"]).unwrap();
        let row = f.repository.get(id).unwrap().unwrap();
        assert_eq!(row.get("age"), None);
        f.repository.flush().unwrap();
        assert_eq!(f.repository.read_stored(id).unwrap().unwrap().get("age"), None);
    }

    #[test]
    fn test_row_added_then_deleted_never_reaches_disk() {
        let f = fixture(10);
        let keep = f.repository.add(person("keep", 1)).unwrap();
        let gone = f.repository.add(person("gone", 2)).unwrap();
        let last = f.repository.add(person("last", 3)).unwrap();
        f.repository.delete(gone).unwrap();
        f.repository.flush().unwrap();

        assert!(f.ledger.get(gone).is_none());
        let keep_address = f.ledger.get(keep).unwrap();
        let last_address = f.ledger.get(last).unwrap();
        assert_eq!(last_address.position, keep_address.end());
        assert_eq!(file_len(&f, keep), last_address.end());
        assert_eq!(f.repository.read_stored(last).unwrap().unwrap().get("name"), Some(&Value::from("last")));
    }

    #[test]
    fn test_row_staged_after_a_later_flush_lands_in_id_order() {
        let f = fixture(10);
        // id 1 is registered but only staged once a higher id is on disk
        let mut early = person("early", 1);
        early.id = f.ledger.add_new(0).unwrap().id;
        let late = f.repository.add(person("late", 2)).unwrap();
        f.repository.flush().unwrap();
        assert_eq!(f.ledger.get(late).unwrap().position, 0);

        f.repository.buffer.add(early.clone(), State::Added);
        f.repository.flush().unwrap();

        let first = f.ledger.get(early.id).unwrap();
        let second = f.ledger.get(late).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, first.end());
        assert_eq!(file_len(&f, late), second.end());
        assert_eq!(f.repository.read_stored(early.id).unwrap().unwrap().get("name"), Some(&Value::from("early")));
        assert_eq!(f.repository.read_stored(late).unwrap().unwrap().get("name"), Some(&Value::from("late")));
    }

    #[test]
    fn test_flushed_addresses_survive_without_destroy() {
        let f = fixture(2);
        for n in 0..5 {
            f.repository.add(person(&format!("p{}", n), n)).unwrap();
        }
        f.repository.flush().unwrap();
        f.repository.delete(2).unwrap();
        let mut longer = person("a-much-longer-name", 3);
        longer.id = 4;
        f.repository.add(longer).unwrap();
        f.repository.flush().unwrap();

        let files = FileHelper::with_locks(Arc::new(KeyedRwLock::new()), false);
        let reopened = RowLedger::open(f.dir.path(), &f.config, ObjectConverter::with_files(files, true)).unwrap();
        assert_eq!(reopened.ids(), vec![1, 3, 4, 5]);
        for id in reopened.ids() {
            assert_eq!(reopened.get(id), f.ledger.get(id));
        }
    }
}
