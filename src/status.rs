//! Shared worker-status bookkeeping used by the balanced-scheduling
//! policies. One `StatusList` guards both the states and the handles of
//! every worker a policy owns behind a single mutex + condvar, keyed by each
//! worker's stable id rather than its position in a vector, exactly as the
//! original `actorStatus` bookkeeping in the benchmark's `PolicyBalance`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::store::ObjectRef;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reserved,
    Busy,
}

struct Slot {
    handle: WorkerHandle,
    state: WorkerState,
    /// The output ref the worker is currently producing, if `Busy`.
    in_flight_ref: Option<ObjectRef>,
}

struct Inner {
    slots: HashMap<usize, Slot>,
    reserved_count: usize,
}

/// Tracks idle/reserved/busy state and ownership for a pool of workers,
/// guarded by one mutex + one condvar woken on every state transition.
/// Worker identity is the stable `WorkerHandle::id`, not a vector index, so a
/// concurrent `remove` never invalidates a reservation held elsewhere.
pub struct StatusList {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl StatusList {
    pub fn new(workers: Vec<WorkerHandle>) -> Self {
        let slots = workers
            .into_iter()
            .map(|handle| {
                (
                    handle.id(),
                    Slot {
                        handle,
                        state: WorkerState::Idle,
                        in_flight_ref: None,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner { slots, reserved_count: 0 }),
            changed: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All worker ids currently in the pool, in no particular order.
    pub fn ids(&self) -> Vec<usize> {
        self.inner.lock().slots.keys().copied().collect()
    }

    /// Every worker's handle, in no particular order.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.inner.lock().slots.values().map(|s| s.handle.clone()).collect()
    }

    /// Add a freshly spawned worker in the `Idle` state (scale-up). Returns
    /// its stable id.
    pub fn push_idle(&self, handle: WorkerHandle) -> usize {
        let mut guard = self.inner.lock();
        let id = handle.id();
        guard.slots.insert(
            id,
            Slot {
                handle,
                state: WorkerState::Idle,
                in_flight_ref: None,
            },
        );
        id
    }

    /// Remove the worker with id `id` and return its handle, provided it is
    /// currently `Idle`. No-op (returns `None`) if it is busy, reserved, or
    /// already gone.
    pub fn remove_if_idle(&self, id: usize) -> Option<WorkerHandle> {
        let mut guard = self.inner.lock();
        if guard.slots.get(&id).map(|s| s.state) != Some(WorkerState::Idle) {
            return None;
        }
        let slot = guard.slots.remove(&id)?;
        drop(guard);
        self.changed.notify_all();
        Some(slot.handle)
    }

    /// Remove every worker regardless of state, returning their handles.
    /// Used on shutdown.
    pub fn drain(&self) -> Vec<WorkerHandle> {
        let mut guard = self.inner.lock();
        guard.slots.drain().map(|(_, s)| s.handle).collect()
    }

    pub fn update_state(&self, id: usize, state: WorkerState, in_flight_ref: Option<ObjectRef>) {
        let mut guard = self.inner.lock();
        if let Some(slot) = guard.slots.get_mut(&id) {
            let was_reserved = slot.state == WorkerState::Reserved;
            slot.state = state;
            slot.in_flight_ref = in_flight_ref;
            match (was_reserved, state == WorkerState::Reserved) {
                (false, true) => guard.reserved_count += 1,
                (true, false) => guard.reserved_count = guard.reserved_count.saturating_sub(1),
                _ => {}
            }
        }
        drop(guard);
        self.changed.notify_all();
    }

    pub fn state_of(&self, id: usize) -> Option<WorkerState> {
        self.inner.lock().slots.get(&id).map(|s| s.state)
    }

    /// Non-blocking: transition any `Busy` worker whose output has already
    /// landed in `store` back to `Idle`, without reserving it for anyone.
    /// Lets a caller outside the normal pick loop (eviction) see workers
    /// that finished but that nobody has polled since.
    pub fn refresh_ready(&self, store: &crate::store::InMemoryObjectStore) {
        let outstanding: Vec<ObjectRef> = {
            let guard = self.inner.lock();
            guard
                .slots
                .values()
                .filter(|s| s.state == WorkerState::Busy)
                .filter_map(|s| s.in_flight_ref.clone())
                .collect()
        };
        if outstanding.is_empty() {
            return;
        }
        let ready = store.wait(&outstanding, 1, Some(Duration::ZERO));
        if ready.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        for slot in guard.slots.values_mut() {
            if slot.state == WorkerState::Busy {
                if let Some(r) = &slot.in_flight_ref {
                    if ready.contains(r) {
                        slot.state = WorkerState::Idle;
                        slot.in_flight_ref = None;
                    }
                }
            }
        }
        drop(guard);
        self.changed.notify_all();
    }

    pub fn all_reserved_or_busy(&self) -> bool {
        let guard = self.inner.lock();
        guard.slots.values().all(|s| s.state != WorkerState::Idle)
    }
}

/// Implements the balanced-pick algorithm: return `None` immediately on an
/// empty pool, otherwise wait out a fully reserved/busy pool, poll the store
/// for any in-flight output becoming ready, transition the first such worker
/// back to `Idle`, then reserve and return it. Returns `None` if `timeout`
/// elapses with nothing to pick.
pub fn pick_worker_balanced(
    list: &StatusList,
    store: &crate::store::InMemoryObjectStore,
    timeout: Option<Duration>,
) -> Option<WorkerHandle> {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        if list.is_empty() {
            return None;
        }

        let (idle, outstanding) = {
            let guard = list.inner.lock();
            if let Some((id, slot)) = guard.slots.iter().find(|(_, s)| s.state == WorkerState::Idle) {
                (Some((*id, slot.handle.clone())), Vec::new())
            } else {
                let outstanding: Vec<ObjectRef> = guard
                    .slots
                    .values()
                    .filter(|s| s.state == WorkerState::Busy)
                    .filter_map(|s| s.in_flight_ref.clone())
                    .collect();
                (None, outstanding)
            }
        };

        if let Some((id, handle)) = idle {
            list.update_state(id, WorkerState::Reserved, None);
            return Some(handle);
        }

        if outstanding.is_empty() {
            // Every worker is reserved (none busy, none idle): wait for a
            // reservation to resolve rather than spin.
            let mut guard = list.inner.lock();
            if guard.slots.is_empty() {
                return None;
            }
            if guard.slots.values().any(|s| s.state == WorkerState::Idle) {
                continue;
            }
            match deadline {
                None => {
                    list.changed.wait(&mut guard);
                }
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return None;
                    }
                    list.changed.wait_for(&mut guard, d - now);
                }
            }
            continue;
        }

        let remaining = deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()));
        if let Some(Duration::ZERO) = remaining {
            return None;
        }
        let ready = store.wait(&outstanding, 1, remaining);
        if ready.is_empty() && deadline.is_some_and(|d| std::time::Instant::now() >= d) {
            return None;
        }

        let mut guard = list.inner.lock();
        for slot in guard.slots.values_mut() {
            if slot.state == WorkerState::Busy {
                if let Some(r) = &slot.in_flight_ref {
                    if ready.contains(r) {
                        slot.state = WorkerState::Idle;
                        slot.in_flight_ref = None;
                    }
                }
            }
        }
        drop(guard);
        list.changed.notify_all();
        // Loop back to the top: another waiter may have claimed the newly
        // idle worker first, which is fine, we just try again.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryObjectStore, StoredValue};
    use crate::worker::EchoKaasEngine;
    use std::sync::Arc;

    fn spawn_n(n: usize) -> Vec<WorkerHandle> {
        (0..n).map(|id| WorkerHandle::spawn(id, Arc::new(EchoKaasEngine))).collect()
    }

    #[test]
    fn picks_idle_worker_immediately() {
        let list = StatusList::new(spawn_n(3));
        let store = InMemoryObjectStore::new();
        let picked = pick_worker_balanced(&list, &store, None).unwrap();
        assert_eq!(list.state_of(picked.id()), Some(WorkerState::Reserved));
    }

    #[test]
    fn returns_none_immediately_on_an_empty_pool() {
        let list = StatusList::new(Vec::new());
        let store = InMemoryObjectStore::new();
        assert!(pick_worker_balanced(&list, &store, None).is_none());
        assert!(pick_worker_balanced(&list, &store, Some(Duration::from_secs(2))).is_none());
    }

    #[test]
    fn waits_for_busy_worker_to_complete() {
        let list = Arc::new(StatusList::new(spawn_n(1)));
        let store = Arc::new(InMemoryObjectStore::new());
        let out_ref = store.reserve();
        let id = list.ids()[0];
        list.update_state(id, WorkerState::Busy, Some(out_ref.clone()));

        let store2 = store.clone();
        let out_ref2 = out_ref.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            store2.fulfill(&out_ref2, StoredValue::Bytes(Arc::new(vec![1])));
        });

        let picked = pick_worker_balanced(&list, &store, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(picked.id(), id);
        handle.join().unwrap();
    }

    #[test]
    fn times_out_when_nothing_becomes_available() {
        let list = StatusList::new(spawn_n(1));
        let store = InMemoryObjectStore::new();
        let out_ref = store.reserve();
        let id = list.ids()[0];
        list.update_state(id, WorkerState::Busy, Some(out_ref));
        let picked = pick_worker_balanced(&list, &store, Some(Duration::from_millis(20)));
        assert!(picked.is_none());
    }
}
