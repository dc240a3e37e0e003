//! Keyed lock service
//!
//! Locks are created lazily per distinct key value and are never global:
//! threads working on different keys never wait on each other. Each key has
//! read/write semantics: many readers, or one writer, per key.
//!
//! Locks are reentrant per thread. A thread that already holds a key (read or
//! write) may take it again, and a thread that is the only reader of a key may
//! upgrade to write. This is what lets a compaction pass hold the read lock
//! of a row file and still take its write lock for the final swap.
//!
//! Entries are reference counted by their holders and removed as soon as the
//! last holder releases the key, so the table only ever contains keys that
//! are currently locked.

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

/// Lock mode held by a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Default)]
struct Holders {
    /// Hold counts of reading threads
    readers: HashMap<ThreadId, usize>,
    /// Writing thread and its hold count
    writer: Option<(ThreadId, usize)>,
}

impl Holders {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn can_read(&self, me: ThreadId) -> bool {
        match self.writer {
            Some((owner, _)) => owner == me,
            None => true,
        }
    }

    fn can_write(&self, me: ThreadId) -> bool {
        let writer_free = match self.writer {
            Some((owner, _)) => owner == me,
            None => true,
        };
        writer_free && self.readers.keys().all(|reader| *reader == me)
    }
}

/// Per-key read/write lock table.
pub struct KeyedRwLock<K> {
    table: Mutex<HashMap<K, Holders>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone + Debug> KeyedRwLock<K> {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until the calling thread holds `key` for reading.
    pub fn read_lock(&self, key: &K) {
        let me = thread::current().id();
        let mut table = self.table.lock();
        loop {
            let holders = table.entry(key.clone()).or_default();
            if holders.can_read(me) {
                *holders.readers.entry(me).or_insert(0) += 1;
                return;
            }
            self.released.wait(&mut table);
        }
    }

    /// Block until the calling thread holds `key` for writing.
    pub fn write_lock(&self, key: &K) {
        let me = thread::current().id();
        let mut table = self.table.lock();
        loop {
            let holders = table.entry(key.clone()).or_default();
            if holders.can_write(me) {
                match holders.writer.as_mut() {
                    Some((_, count)) => *count += 1,
                    None => holders.writer = Some((me, 1)),
                }
                return;
            }
            self.released.wait(&mut table);
        }
    }

    /// Release one read hold of `key`.
    ///
    /// Returns false (and logs) if the calling thread did not hold it.
    pub fn read_unlock(&self, key: &K) -> bool {
        let me = thread::current().id();
        let mut table = self.table.lock();
        let Some(holders) = table.get_mut(key) else {
            tracing::warn!(key = ?key, "read unlock of a key that is not locked");
            return false;
        };
        let Some(count) = holders.readers.get_mut(&me) else {
            tracing::warn!(key = ?key, "read unlock of a key not read-held by this thread");
            return false;
        };
        *count -= 1;
        if *count == 0 {
            holders.readers.remove(&me);
        }
        if holders.is_free() {
            table.remove(key);
        }
        drop(table);
        self.released.notify_all();
        true
    }

    /// Release one write hold of `key`.
    ///
    /// Returns false (and logs) if the calling thread did not hold it.
    pub fn write_unlock(&self, key: &K) -> bool {
        let me = thread::current().id();
        let mut table = self.table.lock();
        let Some(holders) = table.get_mut(key) else {
            tracing::warn!(key = ?key, "write unlock of a key that is not locked");
            return false;
        };
        match holders.writer {
            Some((owner, count)) if owner == me => {
                holders.writer = if count > 1 { Some((owner, count - 1)) } else { None };
            }
            _ => {
                tracing::warn!(key = ?key, "write unlock of a key not write-held by this thread");
                return false;
            }
        }
        if holders.is_free() {
            table.remove(key);
        }
        drop(table);
        self.released.notify_all();
        true
    }

    /// Acquire `key` for reading; released when the guard drops.
    pub fn read(&self, key: &K) -> KeyGuard<'_, K> {
        self.read_lock(key);
        KeyGuard::new(self, key.clone(), LockMode::Read)
    }

    /// Acquire `key` for writing; released when the guard drops.
    pub fn write(&self, key: &K) -> KeyGuard<'_, K> {
        self.write_lock(key);
        KeyGuard::new(self, key.clone(), LockMode::Write)
    }

    /// Acquire `key` in `mode`.
    pub fn acquire(&self, key: &K, mode: LockMode) -> KeyGuard<'_, K> {
        match mode {
            LockMode::Read => self.read(key),
            LockMode::Write => self.write(key),
        }
    }

    /// Run `action` while holding `key` for reading.
    ///
    /// The lock is released on every exit path, including unwinding.
    pub fn with_read<T>(&self, key: &K, action: impl FnOnce() -> T) -> T {
        let _guard = self.read(key);
        action()
    }

    /// Run `action` while holding `key` for writing.
    pub fn with_write<T>(&self, key: &K, action: impl FnOnce() -> T) -> T {
        let _guard = self.write(key);
        action()
    }

    /// Number of keys currently held by anyone.
    pub fn held_keys(&self) -> usize {
        self.table.lock().len()
    }
}

impl<K: Eq + Hash + Clone + Debug> Default for KeyedRwLock<K> {
    fn default() -> Self { Self::new() }
}

/// RAII hold of one key. Not `Send`: holds are tracked per thread.
pub struct KeyGuard<'a, K: Eq + Hash + Clone + Debug> {
    lock: &'a KeyedRwLock<K>,
    key: K,
    mode: LockMode,
    _not_send: PhantomData<*const ()>,
}

impl<'a, K: Eq + Hash + Clone + Debug> KeyGuard<'a, K> {
    fn new(lock: &'a KeyedRwLock<K>, key: K, mode: LockMode) -> Self {
        Self { lock, key, mode, _not_send: PhantomData }
    }

    /// The locked key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The held mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<K: Eq + Hash + Clone + Debug> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        match self.mode {
            LockMode::Read => self.lock.read_unlock(&self.key),
            LockMode::Write => self.lock.write_unlock(&self.key),
        };
    }
}

/// Exclusive per-key lock: the write half of a `KeyedRwLock`.
pub struct KeyedLock<K> {
    inner: KeyedRwLock<K>,
}

impl<K: Eq + Hash + Clone + Debug> KeyedLock<K> {
    pub fn new() -> Self {
        Self { inner: KeyedRwLock::new() }
    }

    pub fn lock(&self, key: &K) {
        self.inner.write_lock(key);
    }

    pub fn unlock(&self, key: &K) -> bool {
        self.inner.write_unlock(key)
    }

    pub fn guard(&self, key: &K) -> KeyGuard<'_, K> {
        self.inner.write(key)
    }

    /// Run `action` while holding `key`, releasing on every exit path.
    pub fn with_lock<T>(&self, key: &K, action: impl FnOnce() -> T) -> T {
        self.inner.with_write(key, action)
    }
}

impl<K: Eq + Hash + Clone + Debug> Default for KeyedLock<K> {
    fn default() -> Self { Self::new() }
}

/// Process-wide lock table for file paths.
///
/// Every component touching a row or index file goes through this table so
/// that appends, reads and compaction swaps of one path are serialized across
/// tables and repositories.
pub fn file_locks() -> Arc<KeyedRwLock<PathBuf>> {
    static FILE_LOCKS: OnceLock<Arc<KeyedRwLock<PathBuf>>> = OnceLock::new();
    Arc::clone(FILE_LOCKS.get_or_init(|| Arc::new(KeyedRwLock::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::time::Duration;

    use rand::Rng;

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = Arc::new(KeyedRwLock::<String>::new());
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let l = Arc::clone(&locks);
        let holder = thread::spawn(move || {
            let _guard = l.write(&"a".to_string());
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();

        // "a" is write-held by another thread; "b" must be free.
        let (done_tx, done_rx) = mpsc::channel();
        let l = Arc::clone(&locks);
        let worker = thread::spawn(move || {
            l.with_write(&"b".to_string(), || ());
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        worker.join().unwrap();
        assert_eq!(locks.held_keys(), 0);
    }

    #[test]
    fn test_readers_share_a_key() {
        let locks = Arc::new(KeyedRwLock::<u32>::new());
        let barrier = Arc::new(Barrier::new(3));
        let mut handles = vec![];
        for _ in 0..3 {
            let l = Arc::clone(&locks);
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let _guard = l.read(&7);
                // All three readers are inside at once, or this never returns.
                b.wait();
            }));
        }
        for h in handles { h.join().unwrap(); }
    }

    #[test]
    fn test_read_and_write_do_not_overlap() {
        let locks = Arc::new(KeyedRwLock::<u32>::new());
        let readers = Arc::new(AtomicUsize::new(0));
        let writing = Arc::new(AtomicBool::new(false));

        let mut handles = vec![];
        for _ in 0..8 {
            let l = Arc::clone(&locks);
            let readers = Arc::clone(&readers);
            let writing = Arc::clone(&writing);
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..200 {
                    if rng.gen_bool(0.3) {
                        let _guard = l.write(&1);
                        assert!(!writing.swap(true, Ordering::SeqCst));
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        thread::yield_now();
                        writing.store(false, Ordering::SeqCst);
                    } else {
                        let _guard = l.read(&1);
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert!(!writing.load(Ordering::SeqCst));
                        thread::yield_now();
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles { h.join().unwrap(); }
        assert_eq!(locks.held_keys(), 0);
    }

    #[test]
    fn test_reentrant_and_upgrade_on_same_thread() {
        let locks = KeyedRwLock::<&'static str>::new();
        let _r1 = locks.read(&"file");
        let _r2 = locks.read(&"file");
        {
            let _w = locks.write(&"file");
            let _w2 = locks.write(&"file");
            assert_eq!(locks.held_keys(), 1);
        }
        drop(_r2);
        drop(_r1);
        assert_eq!(locks.held_keys(), 0);
    }

    #[test]
    fn test_unlock_unknown_key_is_harmless() {
        let locks = KeyedRwLock::<u64>::new();
        assert!(!locks.read_unlock(&42));
        assert!(!locks.write_unlock(&42));

        let exclusive = KeyedLock::<u64>::new();
        assert!(!exclusive.unlock(&1));
        exclusive.lock(&1);
        assert!(exclusive.unlock(&1));
    }

    #[test]
    fn test_lock_released_when_action_panics() {
        let locks = Arc::new(KeyedLock::<u8>::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_lock(&3, || panic!("boom"));
        }));
        assert!(result.is_err());

        let l = Arc::clone(&locks);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            l.with_lock(&3, || ());
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let locks = Arc::new(KeyedRwLock::<u8>::new());
        let guard = locks.read(&9);

        let l = Arc::clone(&locks);
        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || {
            l.with_write(&9, || ());
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        writer.join().unwrap();
    }
}
