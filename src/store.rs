//! The object store is an external collaborator in the spec: a
//! content-addressed reference store holding request/response payloads.
//! `InMemoryObjectStore` is the in-process stand-in used by the drivers and
//! by tests; a production deployment would swap it for a networked store
//! without changing anything above this module.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::StoreError;

/// Opaque handle to a value held in the object store. Cloning a ref is
/// cheap; it does not clone the underlying value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(Uuid);

impl ObjectRef {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ref:{}", self.0)
    }
}

/// A value stored in the object store: either a scalar payload or, in the
/// KaaS router's case, a reference wrapping another reference. Pipeline
/// boundaries must dereference nested references recursively (spec §6).
#[derive(Clone)]
pub enum StoredValue {
    Bytes(Arc<Vec<u8>>),
    Ref(ObjectRef),
    Any(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredValue::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            StoredValue::Ref(r) => write!(f, "Ref({r})"),
            StoredValue::Any(_) => write!(f, "Any(..)"),
        }
    }
}

struct Slot {
    value: Option<StoredValue>,
}

/// In-process object store: `put`/`get`/`wait` over a map guarded by one
/// mutex + condvar, woken on every `put`.
pub struct InMemoryObjectStore {
    inner: Mutex<HashMap<ObjectRef, Slot>>,
    ready: Condvar,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    /// Reserve a ref whose value will be filled in later by `fulfill`. Lets
    /// a caller hand out a reference to a future result before the result
    /// exists, mirroring Ray's lazy futures.
    pub fn reserve(&self) -> ObjectRef {
        let r = ObjectRef::new();
        self.inner.lock().insert(r.clone(), Slot { value: None });
        r
    }

    pub fn fulfill(&self, r: &ObjectRef, value: StoredValue) {
        let mut guard = self.inner.lock();
        if let Some(slot) = guard.get_mut(r) {
            slot.value = Some(value);
        } else {
            guard.insert(r.clone(), Slot { value: Some(value) });
        }
        drop(guard);
        self.ready.notify_all();
    }

    pub fn put(&self, value: StoredValue) -> ObjectRef {
        let r = ObjectRef::new();
        self.fulfill(&r, value);
        r
    }

    pub fn put_bytes(&self, bytes: Vec<u8>) -> ObjectRef {
        self.put(StoredValue::Bytes(Arc::new(bytes)))
    }

    /// Block until `r` has a value and return it.
    pub fn get(&self, r: &ObjectRef) -> Result<StoredValue, StoreError> {
        let mut guard = self.inner.lock();
        loop {
            match guard.get(r) {
                Some(Slot { value: Some(v) }) => return Ok(v.clone()),
                Some(Slot { value: None }) => {
                    self.ready.wait(&mut guard);
                }
                None => return Err(StoreError::NotFound(r.to_string())),
            }
        }
    }

    fn is_ready_locked(guard: &HashMap<ObjectRef, Slot>, r: &ObjectRef) -> bool {
        matches!(guard.get(r), Some(Slot { value: Some(_) }))
    }

    /// Block until at least `n` of `refs` are ready, or `timeout` elapses.
    /// Returns the refs that became ready (possibly fewer than `n` if the
    /// timeout expired). An empty result signals timeout, matching
    /// `ray.wait`'s `(done, pending)` semantics collapsed to just `done`.
    pub fn wait(
        &self,
        refs: &[ObjectRef],
        n: usize,
        timeout: Option<Duration>,
    ) -> Vec<ObjectRef> {
        if refs.is_empty() {
            return Vec::new();
        }
        let n = n.min(refs.len());
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut guard = self.inner.lock();
        loop {
            let ready: Vec<ObjectRef> = refs
                .iter()
                .filter(|r| Self::is_ready_locked(&guard, r))
                .cloned()
                .collect();
            if ready.len() >= n {
                return ready;
            }
            match deadline {
                None => {
                    self.ready.wait(&mut guard);
                }
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return ready;
                    }
                    let timed_out = self.ready.wait_for(&mut guard, d - now).timed_out();
                    if timed_out {
                        let ready: Vec<ObjectRef> = refs
                            .iter()
                            .filter(|r| Self::is_ready_locked(&guard, r))
                            .cloned()
                            .collect();
                        return ready;
                    }
                }
            }
        }
    }

    /// Block until every ref in `refs` is ready (the pre-acquisition wait
    /// the runner pool performs before reserving a worker).
    pub fn wait_all(&self, refs: &[ObjectRef]) {
        self.wait(refs, refs.len(), None);
    }
}

/// Recursively unwrap `StoredValue::Ref` chains. The KaaS router sometimes
/// wraps a result in an extra reference; `deref_if_kaas` applies this one
/// extra time for KaaS models, matching `post()` in the original benchmark.
pub fn deref_once(store: &InMemoryObjectStore, value: StoredValue) -> StoredValue {
    match value {
        StoredValue::Ref(r) => store.get(&r).unwrap_or(StoredValue::Ref(r)),
        other => other,
    }
}

pub fn deref_if_kaas(store: &InMemoryObjectStore, value: StoredValue, is_kaas: bool) -> StoredValue {
    let once = deref_once(store, value);
    if is_kaas {
        deref_once(store, once)
    } else {
        once
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn put_get_roundtrip() {
        let store = InMemoryObjectStore::new();
        let r = store.put_bytes(vec![1, 2, 3]);
        match store.get(&r).unwrap() {
            StoredValue::Bytes(b) => assert_eq!(*b, vec![1, 2, 3]),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn get_unknown_ref_errors() {
        let store = InMemoryObjectStore::new();
        let dangling = store.reserve();
        store.inner.lock().remove(&dangling);
        assert!(matches!(store.get(&dangling), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn wait_blocks_until_fulfilled() {
        let store = StdArc::new(InMemoryObjectStore::new());
        let r = store.reserve();
        let store2 = store.clone();
        let r2 = r.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            store2.fulfill(&r2, StoredValue::Bytes(StdArc::new(vec![9])));
        });
        let ready = store.wait(&[r.clone()], 1, None);
        assert_eq!(ready, vec![r]);
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_with_no_ready_refs() {
        let store = InMemoryObjectStore::new();
        let r = store.reserve();
        let ready = store.wait(&[r], 1, Some(Duration::from_millis(10)));
        assert!(ready.is_empty());
    }

    #[test]
    fn deref_if_kaas_unwraps_twice_only_for_kaas() {
        let store = InMemoryObjectStore::new();
        let inner = store.put_bytes(vec![42]);
        let outer = store.put(StoredValue::Ref(inner));

        let non_kaas = deref_if_kaas(&store, StoredValue::Ref(outer.clone()), false);
        assert!(matches!(non_kaas, StoredValue::Ref(_)));

        let kaas = deref_if_kaas(&store, StoredValue::Ref(outer), true);
        match kaas {
            StoredValue::Bytes(b) => assert_eq!(*b, vec![42]),
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
