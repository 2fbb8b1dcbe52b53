//! Concurrency-safe maps for live executions and image availability.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;

use super::executor::ExecutionControl;
use crate::result::{ExecutionId, ExecutionState};

/// A `HashMap` behind a read/write lock. The lock never escapes.
#[derive(Debug)]
pub(crate) struct SharedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> SharedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Visits every entry under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in map.iter() {
            f(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A live execution as seen by `kill` and the cleanup loop.
#[derive(Debug, Clone)]
pub(crate) struct ActiveExecution {
    pub control: ExecutionControl,
    pub language: &'static str,
    pub started: Instant,
    pub workspace: PathBuf,
}

const RECENT_CAPACITY: usize = 1024;

/// Live executions by id, plus a bounded memory of how finished ones ended so
/// a late `kill` is a no-op rather than an error and `status` can answer.
#[derive(Debug, Default)]
pub(crate) struct ExecutionRegistry {
    active: SharedMap<ExecutionId, ActiveExecution>,
    recent: Mutex<RecentStates>,
}

#[derive(Debug, Default)]
struct RecentStates {
    order: VecDeque<ExecutionId>,
    states: HashMap<ExecutionId, ExecutionState>,
}

impl ExecutionRegistry {
    pub fn register(&self, id: ExecutionId, execution: ActiveExecution) {
        self.active.insert(id, execution);
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ActiveExecution> {
        self.active.get(id)
    }

    /// Removes a live entry and remembers the state it ended in.
    pub fn finish(&self, id: &ExecutionId, state: ExecutionState) {
        self.active.remove(id);

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.states.insert(*id, state).is_none() {
            recent.order.push_back(*id);
            if recent.order.len() > RECENT_CAPACITY {
                if let Some(oldest) = recent.order.pop_front() {
                    recent.states.remove(&oldest);
                }
            }
        }
    }

    /// Terminal state of a recently finished execution.
    pub fn finished_state(&self, id: &ExecutionId) -> Option<ExecutionState> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .states
            .get(id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Snapshot of all live entries.
    pub fn entries(&self) -> Vec<(ExecutionId, ActiveExecution)> {
        let mut entries = Vec::new();
        self.active
            .for_each(|id, execution| entries.push((*id, execution.clone())));
        entries
    }
}
