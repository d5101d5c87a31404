//! Lock-protected key/value store shared by both memory tiers.
//!
//! Each `StateManager` owns its own lock. The lock is taken for exactly one
//! operation and released before returning, so it is never held across an
//! await point and two instances never block each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::error::{Result, SmartGraphError};

/// Combines the stored value (if any) with an incoming one.
pub type Reducer<V> = Arc<dyn Fn(Option<&V>, V) -> V + Send + Sync>;

struct Inner<V> {
    entries: HashMap<String, V>,
    reducers: HashMap<String, Reducer<V>>,
}

/// Generic key/value store with per-key reducers.
pub struct StateManager<V = Value> {
    inner: RwLock<Inner<V>>,
}

impl<V: Clone> StateManager<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                reducers: HashMap::new(),
            }),
        }
    }

    /// Register a reducer for `key` (builder form).
    pub fn with_reducer(self, key: impl Into<String>, reducer: Reducer<V>) -> Self {
        self.set_reducer(key, reducer);
        self
    }

    /// Register a reducer applied by `update` for `key`.
    pub fn set_reducer(&self, key: impl Into<String>, reducer: Reducer<V>) {
        self.write().reducers.insert(key.into(), reducer);
    }

    /// Insert or overwrite `key`, folding through its reducer when one is set.
    pub fn update(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.write();
        let next = match inner.reducers.get(&key) {
            Some(reducer) => reducer(inner.entries.get(&key), value),
            None => value,
        };
        inner.entries.insert(key, next);
    }

    /// Atomic read-modify-write. Returns the stored result.
    pub fn update_with<F>(&self, key: impl Into<String>, f: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let key = key.into();
        let mut inner = self.write();
        let next = f(inner.entries.get(&key));
        inner.entries.insert(key, next.clone());
        next
    }

    /// Current value, or `None` when absent. Never fails.
    pub fn get(&self, key: &str) -> Option<V> {
        self.read().entries.get(key).cloned()
    }

    /// Current value, failing with `KeyNotFound` when absent.
    pub fn get_required(&self, key: &str) -> Result<V> {
        self.get(key)
            .ok_or_else(|| SmartGraphError::KeyNotFound(key.to_string()))
    }

    /// Remove `key`, returning the previous value.
    pub fn delete(&self, key: &str) -> Option<V> {
        self.write().entries.remove(key)
    }

    /// Remove `key` only if `pred` holds for its current value. The check
    /// and the removal happen under one write lock.
    pub fn delete_if<F>(&self, key: &str, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut inner = self.write();
        match inner.entries.get(key) {
            Some(value) if pred(value) => inner.entries.remove(key),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().entries.contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace every entry. Reducers are kept.
    pub fn restore(&self, entries: impl IntoIterator<Item = (String, V)>) {
        let mut inner = self.write();
        inner.entries = entries.into_iter().collect();
    }

    pub fn clear(&self) {
        self.write().entries.clear();
    }

    // A panic while holding the lock leaves the map itself intact, so
    // poisoning is recovered rather than propagated.
    fn read(&self) -> RwLockReadGuard<'_, Inner<V>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<V>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: Clone> Default for StateManager<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + std::fmt::Debug> std::fmt::Debug for StateManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("entries", &self.snapshot())
            .finish()
    }
}

/// Reducers over JSON values.
pub mod reducers {
    use std::sync::Arc;

    use serde_json::Value;

    use super::Reducer;

    /// Last write wins.
    pub fn replace() -> Reducer<Value> {
        Arc::new(|_, new| new)
    }

    /// Append to a list, keeping only the newest `cap` items (FIFO eviction).
    ///
    /// An incoming array is appended element by element.
    pub fn append_capped(cap: usize) -> Reducer<Value> {
        Arc::new(move |old, new| {
            let mut items = match old {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other.clone()],
            };
            match new {
                Value::Array(more) => items.extend(more),
                single => items.push(single),
            }
            if items.len() > cap {
                items.drain(..items.len() - cap);
            }
            Value::Array(items)
        })
    }

    /// Shallow object merge; the incoming object wins on conflicts.
    /// A non-object on either side replaces.
    pub fn merge_object() -> Reducer<Value> {
        Arc::new(|old, new| match (old, new) {
            (Some(Value::Object(base)), Value::Object(update)) => {
                let mut merged = base.clone();
                merged.extend(update);
                Value::Object(merged)
            }
            (_, new) => new,
        })
    }

    /// Keep the larger number.
    pub fn max_number() -> Reducer<Value> {
        Arc::new(|old, new| {
            let old_n = old.and_then(Value::as_f64);
            match (old_n, new.as_f64()) {
                (Some(a), Some(b)) if a >= b => old.cloned().unwrap_or(new),
                _ => new,
            }
        })
    }
}
