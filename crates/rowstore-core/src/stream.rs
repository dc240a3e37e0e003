//! Stoppable, batch-aware streams
//!
//! A `BatchStream` yields items grouped per file. Each batch is loaded and
//! consumed while the file's keyed lock is held in the stream's mode, so a
//! per-file consumer can finish its work on the file before the lock is
//! released. Consumers stop a stream early through its `StopFlag`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreResult;
use crate::lock::{KeyedRwLock, LockMode};

/// Cooperative stop signal shared by a stream and its consumers.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type Loader<'a, T> = Box<dyn FnOnce() -> StoreResult<Vec<T>> + 'a>;

/// Items grouped by the file they live in.
pub struct BatchStream<'a, T> {
    locks: Arc<KeyedRwLock<PathBuf>>,
    mode: LockMode,
    batches: Vec<(PathBuf, Loader<'a, T>)>,
    stop: StopFlag,
}

impl<'a, T> BatchStream<'a, T> {
    pub fn new(locks: Arc<KeyedRwLock<PathBuf>>, mode: LockMode) -> Self {
        Self { locks, mode, batches: Vec::new(), stop: StopFlag::new() }
    }

    /// Append a batch; `load` runs under the batch's lock.
    pub fn push_batch(&mut self, path: PathBuf, load: impl FnOnce() -> StoreResult<Vec<T>> + 'a) {
        self.batches.push((path, Box::new(load)));
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Feed every item to `consumer`. Returns how many were consumed.
    pub fn for_each(self, mut consumer: impl FnMut(T) -> StoreResult<()>) -> StoreResult<usize> {
        let stop = self.stop.clone();
        let mut count = 0;
        self.for_each_batch(|_, items| {
            for item in items {
                if stop.is_stopped() {
                    break;
                }
                consumer(item)?;
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Feed every batch to `consumer` in one call per file, under the
    /// file's lock.
    pub fn for_each_batch(self, mut consumer: impl FnMut(&Path, Vec<T>) -> StoreResult<()>) -> StoreResult<()> {
        for (path, load) in self.batches {
            if self.stop.is_stopped() {
                break;
            }
            let _guard = self.locks.acquire(&path, self.mode);
            let items = load()?;
            consumer(&path, items)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream<'a>(locks: &Arc<KeyedRwLock<PathBuf>>) -> BatchStream<'a, u32> {
        let mut stream = BatchStream::new(Arc::clone(locks), LockMode::Read);
        stream.push_batch(PathBuf::from("row1"), || Ok(vec![1, 2, 3]));
        stream.push_batch(PathBuf::from("row2"), || Ok(vec![4, 5]));
        stream
    }

    #[test]
    fn test_items_in_batch_order() {
        let locks = Arc::new(KeyedRwLock::new());
        let mut seen = Vec::new();
        let count = stream(&locks)
            .for_each(|item| {
                seen.push(item);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(locks.held_keys(), 0);
    }

    #[test]
    fn test_stop_skips_remaining_batches() {
        let locks = Arc::new(KeyedRwLock::new());
        let s = stream(&locks);
        let stop = s.stop_flag();
        let mut files = Vec::new();
        s.for_each_batch(|path, items| {
            files.push(path.to_path_buf());
            if items.contains(&2) {
                stop.stop();
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(files, vec![PathBuf::from("row1")]);
    }

    #[test]
    fn test_batch_lock_is_held_during_consumer() {
        let locks = Arc::new(KeyedRwLock::new());
        let s = stream(&locks);
        s.for_each_batch(|_, _| {
            assert_eq!(locks.held_keys(), 1);
            Ok(())
        })
        .unwrap();
    }
}
