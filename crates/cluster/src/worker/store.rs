use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use stellwerk_core::Value;
use stellwerk_wire::protocol::TaskRef;

/// Results this worker holds until the scheduler releases them.
#[derive(Debug, Default)]
pub struct ResultStore {
    entries: RwLock<HashMap<TaskRef, (Value, u64)>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: TaskRef, value: Value, nbytes: u64) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(task, (value, nbytes));
    }

    pub fn get(&self, task: &TaskRef) -> Option<Value> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(task).map(|(v, _)| v.clone())
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(task)
    }

    /// Drop the given results; returns how many were present.
    pub fn remove(&self, tasks: &[TaskRef]) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter(|t| entries.remove(t).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held.
    pub fn memory_bytes(&self) -> u64 {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).values().map(|(_, n)| n).sum()
    }
}
