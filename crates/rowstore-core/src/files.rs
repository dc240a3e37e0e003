//! File storage layer: locked byte-range I/O and crash-safe collect
//!
//! Every path is guarded by the process-wide keyed file lock table. Reads take
//! the read lock, writes the write lock.
//!
//! `collect` rewrites files through a `.tmp` sibling:
//! 1. Read-lock the source, write-lock `<path>.tmp`
//! 2. Copy bytes verbatim up to each target offset, let the entry's splice
//!    consume (skip) and/or produce bytes there, copy the tail
//! 3. Flush and durable_sync the temp file
//! 4. Write-lock the source, run queued post-write callbacks, rename the temp
//!    file over the source, durable_sync the directory
//!
//! If anything fails before step 4 the temp file is removed and the source is
//! untouched. Each file is committed on its own: a failure on the third file of
//! a batch leaves the first two rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::lock::{file_locks, KeyedRwLock};
use crate::platform_durability::{durable_sync, sync_directory};

/// Suffix of the rewrite target of a file.
pub const TMP_SUFFIX: &str = ".tmp";

/// Progress is logged every this many collected entries.
const PROGRESS_EVERY: usize = 1000;

/// `<path>.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Location of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub path: PathBuf,
    pub position: u64,
    pub size: u64,
}

/// Best-effort skip of `size` bytes.
///
/// Returns how many bytes were actually skipped; fewer than `size` means the
/// stream ended first.
pub fn skip<R: Read + ?Sized>(reader: &mut R, size: u64) -> io::Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    io::copy(&mut reader.take(size), &mut io::sink())
}

/// Consumes the bytes of one entry and writes its replacement.
pub type Splice<'a> = Box<dyn FnOnce(&mut dyn Read, &mut dyn Write) -> io::Result<()> + 'a>;

/// Runs after a file's temp copy is complete, before it is swapped in.
pub type AfterWrite<'a> = Box<dyn FnOnce() -> StoreResult<()> + 'a>;

/// One rewrite target of a `collect` pass.
pub struct CollectEntry<'a> {
    pub path: PathBuf,
    /// Offset in the current (pre-rewrite) file
    pub position: u64,
    pub splice: Splice<'a>,
    pub after: Option<AfterWrite<'a>>,
}

impl<'a> CollectEntry<'a> {
    pub fn new(
        path: impl Into<PathBuf>,
        position: u64,
        splice: impl FnOnce(&mut dyn Read, &mut dyn Write) -> io::Result<()> + 'a,
    ) -> Self {
        Self { path: path.into(), position, splice: Box::new(splice), after: None }
    }

    /// Queue `after` to run before this entry's file is swapped in, after
    /// any callback queued earlier.
    pub fn then(mut self, after: impl FnOnce() -> StoreResult<()> + 'a) -> Self {
        self.after = Some(match self.after.take() {
            Some(first) => Box::new(move || {
                first()?;
                after()
            }),
            None => Box::new(after),
        });
        self
    }

    /// Drop `size` bytes at `position`.
    pub fn remove(path: impl Into<PathBuf>, position: u64, size: u64) -> Self {
        Self::new(path, position, move |input, _output| skip(input, size).map(|_| ()))
    }

    /// Replace `size` bytes at `position` with `bytes`.
    pub fn replace(path: impl Into<PathBuf>, position: u64, size: u64, bytes: Vec<u8>) -> Self {
        Self::new(path, position, move |input, output| {
            skip(input, size)?;
            output.write_all(&bytes)
        })
    }

    /// Insert `bytes` at `position` (use `u64::MAX` to append).
    pub fn insert(path: impl Into<PathBuf>, position: u64, bytes: Vec<u8>) -> Self {
        Self::new(path, position, move |_input, output| output.write_all(&bytes))
    }
}

/// Outcome of a `collect` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectStats {
    pub entries: usize,
    pub files: usize,
}

/// Reader that tracks its offset from the start of the file.
pub struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Input stream that owns the read lock of the file it is opened on.
///
/// `init` closes the previous file and releases its lock first. A missing file
/// opens as "no stream"; the lock is still held so nobody can create it under
/// the reader.
pub struct ChainInput {
    locks: Arc<KeyedRwLock<PathBuf>>,
    path: Option<PathBuf>,
    stream: Option<CountingReader<BufReader<File>>>,
    _not_send: PhantomData<*const ()>,
}

impl ChainInput {
    pub fn new(locks: Arc<KeyedRwLock<PathBuf>>) -> Self {
        Self { locks, path: None, stream: None, _not_send: PhantomData }
    }

    pub fn init(&mut self, path: &Path) -> StoreResult<()> {
        self.close();
        self.locks.read_lock(&path.to_path_buf());
        self.path = Some(path.to_path_buf());
        self.stream = match File::open(path) {
            Ok(file) => Some(CountingReader::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io_at(path, &e, "Failed to open file for reading")),
        };
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn stream(&mut self) -> Option<&mut CountingReader<BufReader<File>>> {
        self.stream.as_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.path.is_none()
    }

    pub fn close(&mut self) {
        self.stream = None;
        if let Some(path) = self.path.take() {
            self.locks.read_unlock(&path);
        }
    }
}

impl Drop for ChainInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output stream that owns the write lock of the file it is created on.
pub struct ChainOutput {
    locks: Arc<KeyedRwLock<PathBuf>>,
    path: Option<PathBuf>,
    stream: Option<BufWriter<File>>,
    _not_send: PhantomData<*const ()>,
}

impl ChainOutput {
    pub fn new(locks: Arc<KeyedRwLock<PathBuf>>) -> Self {
        Self { locks, path: None, stream: None, _not_send: PhantomData }
    }

    /// Truncate-create `path` under its write lock.
    pub fn init(&mut self, path: &Path) -> StoreResult<()> {
        self.close();
        self.locks.write_lock(&path.to_path_buf());
        self.path = Some(path.to_path_buf());
        let file = File::create(path).map_err(|e| StoreError::io_at(path, &e, "Failed to create file"))?;
        self.stream = Some(BufWriter::with_capacity(64 * 1024, file));
        Ok(())
    }

    pub fn stream(&mut self) -> Option<&mut BufWriter<File>> {
        self.stream.as_mut()
    }

    /// Flush buffered bytes, optionally syncing them to disk.
    pub fn finish(&mut self, durable: bool) -> io::Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush()?;
            if durable {
                durable_sync(stream.get_ref())?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.stream = None;
        if let Some(path) = self.path.take() {
            self.locks.write_unlock(&path);
        }
    }
}

impl Drop for ChainOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Locked file operations shared by every table.
#[derive(Clone)]
pub struct FileHelper {
    locks: Arc<KeyedRwLock<PathBuf>>,
    durable: bool,
}

impl FileHelper {
    /// Helper over the process-wide file lock table.
    pub fn new(config: &Config) -> Self {
        Self::with_locks(file_locks(), config.durable_writes)
    }

    pub fn with_locks(locks: Arc<KeyedRwLock<PathBuf>>, durable: bool) -> Self {
        Self { locks, durable }
    }

    pub fn locks(&self) -> &Arc<KeyedRwLock<PathBuf>> {
        &self.locks
    }

    pub fn chain_input(&self) -> ChainInput {
        ChainInput::new(Arc::clone(&self.locks))
    }

    pub fn chain_output(&self) -> ChainOutput {
        ChainOutput::new(Arc::clone(&self.locks))
    }

    /// Overwrite or append `bytes` to `path` under its write lock.
    pub fn write(&self, path: &Path, bytes: &[u8], append: bool) -> StoreResult<()> {
        let _guard = self.locks.write(&path.to_path_buf());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io_at(parent, &e, "Failed to create directory"))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| StoreError::io_at(path, &e, "Failed to open file for writing"))?;
        file.write_all(bytes).map_err(|e| StoreError::io_at(path, &e, "Failed to write"))?;
        file.flush().map_err(|e| StoreError::io_at(path, &e, "Failed to flush"))?;
        if self.durable {
            durable_sync(&file).map_err(|e| StoreError::io_at(path, &e, "Failed to sync"))?;
        }
        Ok(())
    }

    /// Read the bytes of `range`. `None` if the file does not exist.
    pub fn read(&self, range: &ByteRange) -> StoreResult<Option<Vec<u8>>> {
        let _guard = self.locks.read(&range.path);
        let file = match File::open(&range.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io_at(&range.path, &e, "Failed to open file for reading")),
        };
        let mut reader = BufReader::new(file);
        let skipped = skip(&mut reader, range.position).map_err(|e| StoreError::io_at(&range.path, &e, "Failed to skip"))?;
        let short = |actual: u64| StoreError::ShortRead {
            path: range.path.clone(),
            position: range.position,
            expected: range.size,
            actual,
        };
        if skipped < range.position {
            return Err(short(0));
        }
        let mut bytes = Vec::with_capacity(range.size as usize);
        (&mut reader)
            .take(range.size)
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::io_at(&range.path, &e, "Failed to read"))?;
        if bytes.len() as u64 != range.size {
            return Err(short(bytes.len() as u64));
        }
        Ok(Some(bytes))
    }

    /// Whole file under its read lock. `None` if missing.
    pub fn read_all(&self, path: &Path) -> StoreResult<Option<Vec<u8>>> {
        let _guard = self.locks.read(&path.to_path_buf());
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io_at(path, &e, "Failed to read file")),
        }
    }

    /// Remove `path` under its write lock. A missing file counts as removed.
    pub fn delete(&self, path: &Path) -> bool {
        let _guard = self.locks.write(&path.to_path_buf());
        remove_quietly(path)
    }

    /// Move `from` over `to` under the write lock of `to`.
    ///
    /// An empty `from` removes both files instead. Failures are logged and
    /// reported as `false`.
    pub fn replace(&self, from: &Path, to: &Path) -> bool {
        let _guard = self.locks.write(&to.to_path_buf());
        let empty = match fs::metadata(from) {
            Ok(meta) => meta.len() == 0,
            Err(e) => {
                tracing::warn!(path = %from.display(), error = %e, "cannot stat file to move");
                return false;
            }
        };
        if empty {
            return remove_quietly(to) && remove_quietly(from) && self.sync_parent(to);
        }
        if let Err(e) = fs::rename(from, to) {
            tracing::warn!(from = %from.display(), to = %to.display(), error = %e, "cannot rename file");
            return false;
        }
        self.sync_parent(to)
    }

    fn sync_parent(&self, path: &Path) -> bool {
        if !self.durable {
            return true;
        }
        match path.parent() {
            Some(parent) => match sync_directory(parent) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(path = %parent.display(), error = %e, "cannot sync directory");
                    false
                }
            },
            None => true,
        }
    }

    /// Rewrite one range of one file.
    pub fn collect_one<'a>(
        &self,
        range: &ByteRange,
        splice: impl FnOnce(&mut dyn Read, &mut dyn Write) -> io::Result<()> + 'a,
    ) -> StoreResult<()> {
        self.collect(vec![CollectEntry::new(range.path.clone(), range.position, splice)])
            .map(|_| ())
    }

    /// Rewrite every file named by `entries`.
    ///
    /// Entries are grouped by path in encounter order. Within a group they
    /// must come in ascending position; an entry whose offset is already
    /// behind the cursor (or past the end of the file) still gets its splice
    /// called at the current cursor.
    pub fn collect(&self, entries: Vec<CollectEntry<'_>>) -> StoreResult<CollectStats> {
        let mut groups: Vec<(PathBuf, Vec<CollectEntry<'_>>)> = Vec::new();
        for entry in entries {
            match groups.iter_mut().find(|(path, _)| *path == entry.path) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.path.clone(), vec![entry])),
            }
        }

        let mut stats = CollectStats::default();
        for (path, group) in groups {
            let count = group.len();
            self.collect_file(&path, group, &mut stats)?;
            stats.files += 1;
            tracing::debug!(path = %path.display(), entries = count, "file collected");
        }
        if stats.entries >= PROGRESS_EVERY {
            tracing::info!(entries = stats.entries, files = stats.files, "collect done");
        }
        Ok(stats)
    }

    fn collect_file(&self, path: &Path, group: Vec<CollectEntry<'_>>, stats: &mut CollectStats) -> StoreResult<()> {
        let tmp = tmp_path(path);
        let mut input = self.chain_input();
        let mut output = self.chain_output();
        let mut afters = Vec::new();

        let copied = self
            .copy_with_splices(path, &tmp, &mut input, &mut output, group, &mut afters, stats)
            .and_then(|()| {
                output
                    .finish(self.durable)
                    .map_err(|e| StoreError::io_at(&tmp, &e, "Failed to flush temp file"))
            });
        if let Err(e) = copied {
            tracing::error!(path = %path.display(), error = %e, "collect failed, rolling back");
            output.close();
            remove_quietly(&tmp);
            return Err(e);
        }

        // Swap under the source write lock so readers see either the old
        // file with old addresses or the new file with new addresses.
        let _swap = self.locks.write(&path.to_path_buf());
        input.close();
        for after in afters {
            if let Err(e) = after() {
                tracing::error!(path = %path.display(), error = %e, "post-write callback failed, rolling back");
                output.close();
                remove_quietly(&tmp);
                return Err(e);
            }
        }
        output.close();
        if !self.replace(&tmp, path) {
            remove_quietly(&tmp);
            return Err(StoreError::Io {
                path: Some(path.to_path_buf()),
                kind: io::ErrorKind::Other,
                message: "cannot replace file with its rewritten copy".into(),
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_with_splices<'a>(
        &self,
        path: &Path,
        tmp: &Path,
        input: &mut ChainInput,
        output: &mut ChainOutput,
        group: Vec<CollectEntry<'a>>,
        afters: &mut Vec<AfterWrite<'a>>,
        stats: &mut CollectStats,
    ) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io_at(parent, &e, "Failed to create directory"))?;
        }
        input.init(path)?;
        output.init(tmp)?;
        let Some(out) = output.stream() else {
            return Ok(());
        };
        let mut empty = io::empty();
        let source: &mut dyn Read = match input.stream() {
            Some(stream) => stream,
            None => &mut empty,
        };
        let mut reader = CountingReader::new(source);
        for entry in group {
            let cursor = reader.position();
            if cursor < entry.position {
                io::copy(&mut (&mut reader).take(entry.position - cursor), &mut *out)
                    .map_err(|e| StoreError::io_at(path, &e, "Failed to copy"))?;
            }
            (entry.splice)(&mut reader, &mut *out)
                .map_err(|e| StoreError::io_at(path, &e, "Collect callback failed"))?;
            if let Some(after) = entry.after {
                afters.push(after);
            }
            stats.entries += 1;
            if stats.entries % PROGRESS_EVERY == 0 {
                tracing::info!(entries = stats.entries, "collect progress");
            }
        }
        io::copy(&mut reader, &mut *out).map_err(|e| StoreError::io_at(path, &e, "Failed to copy tail"))?;
        Ok(())
    }
}

fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot delete file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn helper() -> FileHelper {
        FileHelper::with_locks(Arc::new(KeyedRwLock::new()), false)
    }

    fn range(path: &Path, position: u64, size: u64) -> ByteRange {
        ByteRange { path: path.to_path_buf(), position, size }
    }

    #[test]
    fn test_write_append_and_read_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("row").join("row1");
        let files = helper();

        files.write(&path, b"hello", false).unwrap();
        files.write(&path, b" world", true).unwrap();
        assert_eq!(files.read(&range(&path, 6, 5)).unwrap().unwrap(), b"world");
        assert_eq!(files.read(&range(&path, 0, 0)).unwrap().unwrap(), b"");

        files.write(&path, b"new", false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_read_missing_and_short() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let files = helper();
        assert!(files.read(&range(&path, 0, 3)).unwrap().is_none());

        files.write(&path, b"abc", false).unwrap();
        match files.read(&range(&path, 2, 5)) {
            Err(StoreError::ShortRead { expected, actual, .. }) => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 1);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_skip_stops_at_end() {
        let mut input: &[u8] = b"12345";
        assert_eq!(skip(&mut input, 3).unwrap(), 3);
        assert_eq!(input, b"45");
        assert_eq!(skip(&mut input, 10).unwrap(), 2);
        assert_eq!(skip(&mut input, 0).unwrap(), 0);
    }

    #[test]
    fn test_collect_one_replaces_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let files = helper();
        files.write(&path, b"aaaBBBccc", false).unwrap();

        files
            .collect_one(&range(&path, 3, 3), |input, output| {
                skip(input, 3)?;
                output.write_all(b"xy")
            })
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"aaaxyccc");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_failed_callback_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let files = helper();
        files.write(&path, b"0123456789", false).unwrap();

        let result = files.collect_one(&range(&path, 4, 2), |_input, output| {
            output.write_all(b"partial")?;
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"0123456789");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_failed_after_callback_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let files = helper();
        files.write(&path, b"0123456789", false).unwrap();

        let entry = CollectEntry::remove(&path, 0, 5)
            .then(|| Err(StoreError::Codec("ledger refused".into())));
        assert!(files.collect(vec![entry]).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"0123456789");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_collect_groups_files_and_runs_afters() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let files = helper();
        files.write(&a, b"11122233", false).unwrap();
        files.write(&b, b"xyz", false).unwrap();

        let ran = std::cell::RefCell::new(Vec::new());
        let entries = vec![
            CollectEntry::remove(&a, 3, 3).then(|| {
                ran.borrow_mut().push("a");
                Ok(())
            }),
            CollectEntry::insert(&b, u64::MAX, b"!".to_vec()).then(|| {
                ran.borrow_mut().push("b");
                Ok(())
            }),
            CollectEntry::replace(&a, 6, 2, b"44".to_vec())
                .then(|| {
                    ran.borrow_mut().push("a-tail");
                    Ok(())
                })
                .then(|| {
                    ran.borrow_mut().push("a-file");
                    Ok(())
                }),
        ];
        let stats = files.collect(entries).unwrap();
        assert_eq!(stats, CollectStats { entries: 3, files: 2 });
        assert_eq!(fs::read(&a).unwrap(), b"11144");
        assert_eq!(fs::read(&b).unwrap(), b"xyz!");
        assert_eq!(*ran.borrow(), vec!["a", "a-tail", "a-file", "b"]);
    }

    #[test]
    fn test_collect_creates_missing_and_removes_emptied_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("row").join("row1");
        let files = helper();

        files.collect(vec![CollectEntry::insert(&path, 0, b"abc".to_vec())]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc");

        files.collect(vec![CollectEntry::remove(&path, 0, 3)]).unwrap();
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_chain_streams_release_locks() {
        let dir = TempDir::new().unwrap();
        let files = helper();
        let a = dir.path().join("a");
        files.write(&a, b"abc", false).unwrap();
        {
            let mut input = files.chain_input();
            input.init(&a).unwrap();
            let mut buf = String::new();
            input.stream().unwrap().read_to_string(&mut buf).unwrap();
            assert_eq!(buf, "abc");
            input.init(&dir.path().join("missing")).unwrap();
            assert!(input.stream().is_none());
            assert_eq!(files.locks().held_keys(), 1);
        }
        assert_eq!(files.locks().held_keys(), 0);
    }

    #[test]
    fn test_replace_reports_failure() {
        let dir = TempDir::new().unwrap();
        let files = helper();
        assert!(!files.replace(&dir.path().join("nope"), &dir.path().join("target")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_noop_collect_is_identity(data in proptest::collection::vec(any::<u8>(), 0..512), at in 0usize..600) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data");
            let files = helper();
            files.write(&path, &data, false).unwrap();
            files.collect_one(&range(&path, at as u64, 0), |_, _| Ok(())).unwrap();
            let after = fs::read(&path).unwrap_or_default();
            prop_assert_eq!(after, data);
        }

        #[test]
        fn prop_skip_removes_exact_range(data in proptest::collection::vec(any::<u8>(), 1..512), a in 0usize..512, b in 0usize..512) {
            let start = a % data.len();
            let len = b % (data.len() - start + 1);
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data");
            let files = helper();
            files.write(&path, &data, false).unwrap();
            files.collect(vec![CollectEntry::remove(&path, start as u64, len as u64)]).unwrap();

            let mut expected = data.clone();
            expected.drain(start..start + len);
            let after = fs::read(&path).unwrap_or_default();
            prop_assert_eq!(after, expected);
        }
    }
}
