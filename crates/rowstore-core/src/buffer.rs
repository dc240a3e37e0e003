//! Write-behind buffer of staged row mutations
//!
//! Mutations are staged per id and written out in batches by `flush`. A
//! flushed element stays readable (it doubles as a row cache) until eviction
//! brings the buffer back under its size limit. Staging a mutation over an
//! unflushed one merges them:
//!
//! | staged     | new        | result    |
//! |------------|------------|-----------|
//! | Added      | Updated    | Added     |
//! | Added      | Deleted    | Deleted   |
//! | Updated    | Updated    | Updated   |
//! | any        | Deleted    | Deleted   |
//! | flushed    | any        | new state |
//!
//! `Read` elements are clean copies loaded from disk. They only fill empty
//! slots and count as flushed from the start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::StoreResult;
use crate::stream::StopFlag;
use crate::value::{Row, RowId};

/// Values the buffer can stage: anything with a row id.
pub trait Identified: Clone + Send + Sync + 'static {
    fn id(&self) -> RowId;
}

impl Identified for Row {
    fn id(&self) -> RowId {
        self.id
    }
}

/// Kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Added,
    Updated,
    Deleted,
    Read,
}

/// One staged value.
#[derive(Debug)]
pub struct Element<V> {
    value: V,
    state: State,
    flushed: AtomicBool,
}

impl<V> Element<V> {
    fn new(value: V, state: State) -> Self {
        Self { value, state, flushed: AtomicBool::new(state == State::Read) }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }
}

fn merge(previous: &Element<impl Sized>, state: State) -> State {
    if previous.is_flushed() {
        return state;
    }
    match (previous.state, state) {
        (State::Added, State::Updated) => State::Added,
        (_, state) => state,
    }
}

/// Staged mutations keyed by id.
pub struct Buffer<V: Identified> {
    elements: RwLock<HashMap<RowId, Arc<Element<V>>>>,
    max_size: usize,
    /// Staging shares it, flushing takes it exclusively
    gate: RwLock<()>,
}

impl<V: Identified> Buffer<V> {
    pub fn new(max_size: usize) -> Self {
        Self { elements: RwLock::new(HashMap::new()), max_size: max_size.max(1), gate: RwLock::new(()) }
    }

    /// Stage `value` with `state`, merging with an unflushed element.
    pub fn add(&self, value: V, state: State) {
        let id = value.id();
        if state == State::Read {
            self.elements.write().entry(id).or_insert_with(|| Arc::new(Element::new(value, state)));
            return;
        }
        let _gate = self.gate.read();
        let mut elements = self.elements.write();
        let state = match elements.get(&id) {
            Some(previous) => merge(previous, state),
            None => state,
        };
        elements.insert(id, Arc::new(Element::new(value, state)));
    }

    /// Latest staged element of `id`.
    pub fn get(&self, id: RowId) -> Option<Arc<Element<V>>> {
        self.elements.read().get(&id).cloned()
    }

    /// Number of elements, flushed ones included.
    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }

    /// Number of elements waiting for a flush.
    pub fn size(&self) -> usize {
        self.elements.read().values().filter(|e| !e.is_flushed()).count()
    }

    /// Snapshot of every element, ascending by id.
    pub fn elements(&self) -> Vec<Arc<Element<V>>> {
        self.sorted(|_| true)
    }

    /// Feed every element to `consumer` in id order until `stop` is raised.
    pub fn stream(&self, stop: &StopFlag, mut consumer: impl FnMut(&Element<V>)) -> usize {
        let mut count = 0;
        for element in self.elements() {
            if stop.is_stopped() {
                break;
            }
            consumer(&element);
            count += 1;
        }
        count
    }

    /// Hand every unflushed element to `flusher` (ascending by id) and mark
    /// them flushed once it succeeds. Flushed deletions leave the buffer;
    /// other flushed elements are evicted down to the size limit.
    ///
    /// Staging waits while a flush runs.
    pub fn flush(&self, flusher: impl FnOnce(&[Arc<Element<V>>]) -> StoreResult<()>) -> StoreResult<usize> {
        let _gate = self.gate.write();
        let batch = self.sorted(|e| !e.is_flushed());
        if batch.is_empty() {
            return Ok(0);
        }
        flusher(&batch)?;

        let mut elements = self.elements.write();
        self.evict(&mut elements);
        for element in &batch {
            element.flushed.store(true, Ordering::Release);
            if element.state == State::Deleted {
                let id = element.value.id();
                if elements.get(&id).map_or(false, |current| Arc::ptr_eq(current, element)) {
                    elements.remove(&id);
                }
            }
        }
        tracing::debug!(flushed = batch.len(), remaining = elements.len(), "buffer flushed");
        Ok(batch.len())
    }

    /// Drop flushed elements while the buffer is over its limit.
    fn evict(&self, elements: &mut HashMap<RowId, Arc<Element<V>>>) {
        let excess = elements.len().saturating_sub(self.max_size);
        if excess == 0 {
            return;
        }
        let victims: Vec<RowId> = elements
            .iter()
            .filter(|(_, e)| e.is_flushed())
            .map(|(id, _)| *id)
            .take(excess)
            .collect();
        for id in &victims {
            elements.remove(id);
        }
        tracing::trace!(evicted = victims.len(), "buffer evicted");
    }

    fn sorted(&self, filter: impl Fn(&Element<V>) -> bool) -> Vec<Arc<Element<V>>> {
        let mut list: Vec<Arc<Element<V>>> = self.elements.read().values().filter(|e| filter(e)).cloned().collect();
        list.sort_by_key(|e| e.value.id());
        list
    }
}
