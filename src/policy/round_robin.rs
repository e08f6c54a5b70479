//! Round-robin: cycles through a fixed worker set with no admission control
//! and no tenant affinity. The simplest of the three policies, grounded
//! directly on `rayBench.PolicyRR`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Policy, RunnerHandle};
use crate::error::DispatchError;
use crate::stats::{merge_per_tenant, ProfCollection};
use crate::store::ObjectRef;
use crate::worker::{KaasEngine, WorkerHandle};

pub struct PolicyRR {
    workers: Vec<WorkerHandle>,
    cursor: Mutex<usize>,
}

impl PolicyRR {
    pub fn new(n_workers: usize, kaas_engine: Arc<dyn KaasEngine>) -> Self {
        let workers = (0..n_workers)
            .map(|id| WorkerHandle::spawn(id, kaas_engine.clone()))
            .collect();
        Self {
            workers,
            cursor: Mutex::new(0),
        }
    }
}

impl Policy for PolicyRR {
    fn get_runner(&self, _tenant_id: &str, _timeout: Option<Duration>) -> Result<RunnerHandle, DispatchError> {
        let mut cursor = self.cursor.lock();
        let idx = *cursor % self.workers.len();
        *cursor = (*cursor + 1) % self.workers.len();
        Ok(RunnerHandle {
            worker: self.workers[idx].clone(),
            worker_idx: idx,
        })
    }

    fn update(&self, _tenant_id: &str, _handle: RunnerHandle, _out_ref: ObjectRef) {
        // No bookkeeping: round-robin never waits on completion to admit
        // the next request.
    }

    fn get_stats(&self) -> HashMap<String, ProfCollection> {
        let mut merged = HashMap::new();
        for w in &self.workers {
            merge_per_tenant(&mut merged, w.get_stats());
        }
        merged
    }

    fn shutdown(&self) -> HashMap<String, ProfCollection> {
        let mut merged = HashMap::new();
        for w in &self.workers {
            merge_per_tenant(&mut merged, w.terminate());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::EchoKaasEngine;

    #[test]
    fn cycles_through_workers_in_order() {
        let policy = PolicyRR::new(3, Arc::new(EchoKaasEngine));
        let picks: Vec<usize> = (0..9)
            .map(|_| {
                let h = policy.get_runner("any", None).unwrap();
                h.worker_idx
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }
}
