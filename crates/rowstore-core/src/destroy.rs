//! Destroy service: orchestrated persistence of in-memory state
//!
//! Components holding state that must reach disk (model, ledger, field
//! keepers) register a `Destroyable` with the service. `destroy_all` runs
//! every registered destroyer; the optional idle destroyer thread calls it
//! after the store has been quiet for the configured window. Every
//! `wake_up` restarts that window, so a busy store is never interrupted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{StoreError, StoreResult};

/// State that can be flushed to disk on demand.
pub trait Destroyable: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> String;

    fn destroy(&self) -> StoreResult<()>;
}

#[derive(Default)]
struct Signal {
    woken: bool,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    entries: Mutex<BTreeMap<u64, Arc<dyn Destroyable>>>,
    next_id: AtomicU64,
    signal: Mutex<Signal>,
    wake: Condvar,
}

impl Shared {
    fn destroy_all(&self) -> StoreResult<usize> {
        let entries: Vec<Arc<dyn Destroyable>> = self.entries.lock().values().cloned().collect();
        let mut first_error = None;
        for entry in &entries {
            if let Err(e) = entry.destroy() {
                tracing::warn!(destroyer = %entry.name(), error = %e, "destroy failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(entries.len()),
        }
    }
}

/// Registry of destroyers plus the idle destroyer that drives them.
#[derive(Clone, Default)]
pub struct DestroyService {
    shared: Arc<Shared>,
    idle: Arc<Mutex<Option<IdleDestroyer>>>,
}

impl DestroyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `target` until the returned registration is stopped or dropped.
    pub fn register(&self, target: Arc<dyn Destroyable>) -> Registration {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(destroyer = %target.name(), id, "destroyer registered");
        self.shared.entries.lock().insert(id, target);
        Registration { id, shared: Arc::downgrade(&self.shared) }
    }

    pub fn registered(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Restart the idle window.
    pub fn wake_up(&self) {
        let mut signal = self.shared.signal.lock();
        signal.woken = true;
        self.shared.wake.notify_all();
    }

    /// Run every registered destroyer. All of them run even if some fail;
    /// the first failure is returned.
    pub fn destroy_all(&self) -> StoreResult<usize> {
        self.shared.destroy_all()
    }

    /// Start the idle destroyer with the given window. A running one is
    /// replaced.
    pub fn start_idle(&self, window: Duration) -> StoreResult<()> {
        let mut idle = self.idle.lock();
        if let Some(previous) = idle.take() {
            previous.shutdown();
        }
        self.shared.signal.lock().shutdown = false;
        *idle = Some(IdleDestroyer::start(Arc::clone(&self.shared), window)?);
        Ok(())
    }

    pub fn is_idle_running(&self) -> bool {
        self.idle.lock().as_ref().map_or(false, IdleDestroyer::is_running)
    }

    /// Stop the idle destroyer, then run every destroyer one last time.
    pub fn shutdown(&self) -> StoreResult<usize> {
        if let Some(idle) = self.idle.lock().take() {
            idle.shutdown();
        }
        self.destroy_all()
    }
}

/// Membership of one destroyer in a `DestroyService`.
pub struct Registration {
    id: u64,
    shared: Weak<Shared>,
}

impl Registration {
    /// Unregister. Returns false if the service is gone or the destroyer was
    /// already removed.
    pub fn stop(mut self) -> bool {
        self.unregister()
    }

    fn unregister(&mut self) -> bool {
        let shared = std::mem::take(&mut self.shared);
        match shared.upgrade() {
            Some(shared) => shared.entries.lock().remove(&self.id).is_some(),
            None => false,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Handle to the idle destroyer background thread.
/// Dropping this handle stops the thread.
pub struct IdleDestroyer {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IdleDestroyer {
    fn start(shared: Arc<Shared>, window: Duration) -> StoreResult<Self> {
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("rowstore-destroyer".to_string())
            .spawn(move || idle_loop(&worker, window))
            .map_err(|e| StoreError::Io {
                path: None,
                kind: e.kind(),
                message: format!("failed to spawn destroyer thread: {}", e),
            })?;
        tracing::debug!(window_ms = window.as_millis() as u64, "idle destroyer started");
        Ok(Self { shared, thread: Some(thread) })
    }

    /// Signal the thread to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        {
            let mut signal = self.shared.signal.lock();
            signal.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleDestroyer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn idle_loop(shared: &Shared, window: Duration) {
    let mut signal = shared.signal.lock();
    loop {
        if signal.shutdown {
            return;
        }
        signal.woken = false;
        let timed_out = shared.wake.wait_for(&mut signal, window).timed_out();
        if signal.shutdown {
            return;
        }
        if signal.woken || !timed_out {
            continue;
        }
        drop(signal);
        match shared.destroy_all() {
            Ok(count) => tracing::debug!(count, "idle destroy completed"),
            Err(e) => tracing::warn!(error = %e, "idle destroy failed"),
        }
        signal = shared.signal.lock();
    }
}
