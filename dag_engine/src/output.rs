use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

///
/// The shared result mapping for one `Graph::run` invocation. Owned by the caller; node work
/// functions observe and mutate it only through an `OutputHandle`.
///
#[derive(Clone)]
pub struct Output {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl Output {
    pub(crate) fn new() -> Output {
        Output {
            inner: Arc::new(Mutex::new(Map::new())),
        }
    }

    pub(crate) fn handle(&self) -> OutputHandle {
        OutputHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns a clone of the current contents.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.lock().clone()
    }

    /// Consumes this handle, returning the underlying map. Falls back to cloning if other
    /// handles are still outstanding (callers that await `Graph::run` to completion before
    /// dropping node-side handles will always hit the cheap path).
    pub fn into_map(self) -> Map<String, Value> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner(),
            Err(inner) => inner.lock().clone(),
        }
    }
}

///
/// A cheaply cloneable reference to a run's `Output`, handed to work functions and predicates.
/// Every operation takes the underlying lock only for the duration of a single map access.
///
#[derive(Clone)]
pub struct OutputHandle {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl OutputHandle {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.lock().insert(key.into(), value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }
}
