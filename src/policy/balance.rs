//! Load-balanced: all tenants share one worker pool; `get_runner` blocks
//! until some worker is idle or finishes its current output. Grounded on
//! `rayBench.PolicyBalance` including its `scaleUp`/`scaleDown` hooks. Worker
//! state and ownership live together in one `StatusList`, keyed by each
//! worker's stable id, so a concurrent `scale_down` can never hand a caller
//! back a stale or out-of-bounds worker reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Policy, RunnerHandle};
use crate::error::DispatchError;
use crate::stats::{merge_per_tenant, ProfCollection};
use crate::status::{pick_worker_balanced, StatusList, WorkerState};
use crate::store::{InMemoryObjectStore, ObjectRef};
use crate::worker::{KaasEngine, WorkerHandle};

pub struct PolicyBalance {
    statuses: StatusList,
    store: Arc<InMemoryObjectStore>,
    kaas_engine: Arc<dyn KaasEngine>,
    next_worker_id: Mutex<usize>,
    /// Stats drained from workers removed by `scale_down`, kept until the
    /// next `get_stats` call merges them back in.
    pending_stats: Mutex<HashMap<String, ProfCollection>>,
}

impl PolicyBalance {
    pub fn new(n_workers: usize, store: Arc<InMemoryObjectStore>, kaas_engine: Arc<dyn KaasEngine>) -> Self {
        let workers: Vec<WorkerHandle> = (0..n_workers)
            .map(|id| WorkerHandle::spawn(id, kaas_engine.clone()))
            .collect();
        Self {
            statuses: StatusList::new(workers),
            store,
            kaas_engine,
            next_worker_id: Mutex::new(n_workers),
            pending_stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn n_workers(&self) -> usize {
        self.statuses.len()
    }

    /// Add one worker to the pool, in the `Idle` state.
    pub fn scale_up(&self) -> usize {
        let mut id_guard = self.next_worker_id.lock();
        let id = *id_guard;
        *id_guard += 1;
        drop(id_guard);
        let handle = WorkerHandle::spawn(id, self.kaas_engine.clone());
        self.statuses.push_idle(handle)
    }

    /// Remove the worker with id `id` if it is currently idle. Returns
    /// `false` without effect if the worker is busy, reserved, or absent.
    pub fn scale_down(&self, id: usize) -> bool {
        match self.statuses.remove_if_idle(id) {
            Some(handle) => {
                let drained = handle.terminate();
                merge_per_tenant(&mut self.pending_stats.lock(), drained);
                true
            }
            None => false,
        }
    }

    /// Find any currently idle worker and remove it. Used by
    /// `PolicyExclusive` when it needs to reclaim a runner from another
    /// tenant's pool without knowing which id is idle in advance. Refreshes
    /// busy-but-finished workers back to idle first, since nothing else
    /// polls this pool's own status list on a peer's behalf.
    pub fn try_scale_down_any(&self) -> bool {
        self.statuses.refresh_ready(&self.store);
        for id in self.statuses.ids() {
            if self.scale_down(id) {
                return true;
            }
        }
        false
    }
}

impl Policy for PolicyBalance {
    fn get_runner(&self, tenant_id: &str, timeout: Option<Duration>) -> Result<RunnerHandle, DispatchError> {
        let worker = pick_worker_balanced(&self.statuses, &self.store, timeout).ok_or_else(|| DispatchError::Exhausted {
            tenant: tenant_id.to_string(),
        })?;
        let worker_idx = worker.id();
        Ok(RunnerHandle { worker, worker_idx })
    }

    fn update(&self, _tenant_id: &str, handle: RunnerHandle, out_ref: ObjectRef) {
        self.statuses
            .update_state(handle.worker_idx, WorkerState::Busy, Some(out_ref));
    }

    fn get_stats(&self) -> HashMap<String, ProfCollection> {
        let mut merged = std::mem::take(&mut *self.pending_stats.lock());
        for w in self.statuses.handles() {
            merge_per_tenant(&mut merged, w.get_stats());
        }
        merged
    }

    fn shutdown(&self) -> HashMap<String, ProfCollection> {
        let mut merged = std::mem::take(&mut *self.pending_stats.lock());
        for w in self.statuses.drain() {
            merge_per_tenant(&mut merged, w.terminate());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredValue;
    use crate::worker::EchoKaasEngine;

    #[test]
    fn never_exceeds_pool_size_under_contention() {
        let store = Arc::new(InMemoryObjectStore::new());
        let policy = PolicyBalance::new(2, store.clone(), Arc::new(EchoKaasEngine));

        let h0 = policy.get_runner("t", None).unwrap();
        let r0 = store.reserve();
        let h0_idx = h0.worker_idx;
        policy.update("t", h0, r0.clone());

        let h1 = policy.get_runner("t", None).unwrap();
        let r1 = store.reserve();
        policy.update("t", h1, r1.clone());

        // Both workers busy; a third get_runner must wait for one to finish.
        let store2 = store.clone();
        let r0c = r0.clone();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            store2.fulfill(&r0c, StoredValue::Bytes(Arc::new(vec![1])));
        });

        let h2 = policy.get_runner("t", Some(Duration::from_secs(2))).unwrap();
        assert_eq!(h2.worker_idx, h0_idx);
        completer.join().unwrap();
        assert_eq!(policy.n_workers(), 2);
    }

    #[test]
    fn scale_up_then_down_round_trips() {
        let store = Arc::new(InMemoryObjectStore::new());
        let policy = PolicyBalance::new(1, store, Arc::new(EchoKaasEngine));
        let id = policy.scale_up();
        assert_eq!(policy.n_workers(), 2);
        assert!(policy.scale_down(id));
        assert_eq!(policy.n_workers(), 1);
    }
}
