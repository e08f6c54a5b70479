//! The runner pool ties a scheduling policy to a model spec and an object
//! store, implementing the dispatch sequence every driver calls into:
//! wait for inputs, acquire a worker, dispatch, release the reservation,
//! wait for the output. Grounded on `rayBench.runnerPool.run`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::RunnerMode;
use crate::error::DispatchError;
use crate::model::ModelSpec;
use crate::policy::Policy;
use crate::store::{InMemoryObjectStore, ObjectRef, StoredValue};
use crate::worker::{KaasEngine, WorkerHandle};

pub struct RunnerPool {
    mode: RunnerMode,
    policy: Option<Box<dyn Policy>>,
    store: Arc<InMemoryObjectStore>,
    model_spec: ModelSpec,
    kaas_engine: Arc<dyn KaasEngine>,
    cache_task_model: bool,
    next_task_worker_id: std::sync::atomic::AtomicUsize,
}

impl RunnerPool {
    /// Build a pool for `RunnerMode::Task`: no policy, each call gets an
    /// ephemeral worker.
    pub fn for_task_mode(store: Arc<InMemoryObjectStore>, model_spec: ModelSpec, kaas_engine: Arc<dyn KaasEngine>) -> Self {
        Self {
            mode: RunnerMode::Task,
            policy: None,
            store,
            model_spec,
            kaas_engine,
            cache_task_model: false,
            next_task_worker_id: std::sync::atomic::AtomicUsize::new(1_000_000),
        }
    }

    /// Build a pool for `RunnerMode::Actor` or `RunnerMode::Kaas` backed by
    /// `policy`.
    pub fn with_policy(
        mode: RunnerMode,
        policy: Box<dyn Policy>,
        store: Arc<InMemoryObjectStore>,
        model_spec: ModelSpec,
        kaas_engine: Arc<dyn KaasEngine>,
    ) -> Self {
        assert_ne!(mode, RunnerMode::Task, "task mode must use for_task_mode");
        Self {
            mode,
            policy: Some(policy),
            store,
            model_spec,
            kaas_engine,
            cache_task_model: false,
            next_task_worker_id: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Dispatch one request for `tenant_id`, reading `arg` (the tenant's
    /// model argument) and `input_refs` (already-resolved pipeline inputs),
    /// and returning the worker's raw outputs (before any post-dereference).
    pub fn run(
        &self,
        tenant_id: &str,
        arg: StoredValue,
        n_const: usize,
        input_refs: Vec<ObjectRef>,
        input_values: Vec<StoredValue>,
        timeout: Option<Duration>,
    ) -> Result<Vec<StoredValue>, DispatchError> {
        if self.mode != RunnerMode::Task {
            self.store.wait_all(&input_refs);
        }

        match self.mode {
            RunnerMode::Task => {
                let id = self
                    .next_task_worker_id
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let worker = WorkerHandle::spawn(id, self.kaas_engine.clone());
                debug!(tenant = tenant_id, worker = id, "task mode: spawned ephemeral worker");
                let out = worker
                    .run_native(self.model_spec.clone(), arg, n_const, input_values, tenant_id)
                    .map_err(|e| DispatchError::StageFailure { stage: "run", source: e })?;
                worker.terminate();
                Ok(out)
            }
            RunnerMode::Actor => {
                let policy = self.policy.as_ref().expect("actor mode requires a policy");
                let handle = policy.get_runner(tenant_id, timeout)?;
                let worker = handle.worker.clone();
                let out_ref = self.store.reserve();
                policy.update(tenant_id, handle, out_ref.clone());
                let result = worker.run_native(self.model_spec.clone(), arg, n_const, input_values, tenant_id);
                match result {
                    Ok(out) => {
                        self.store.fulfill(&out_ref, StoredValue::Bytes(Arc::new(Vec::new())));
                        Ok(out)
                    }
                    Err(e) => {
                        self.store.fulfill(&out_ref, StoredValue::Bytes(Arc::new(Vec::new())));
                        Err(DispatchError::StageFailure { stage: "run", source: e })
                    }
                }
            }
            RunnerMode::Kaas => {
                let policy = self.policy.as_ref().expect("kaas mode requires a policy");
                let handle = policy.get_runner(tenant_id, timeout)?;
                let worker = handle.worker.clone();
                let out_ref = self.store.reserve();
                policy.update(tenant_id, handle, out_ref.clone());
                let model = self.model_spec.instantiate(arg);
                let req = model
                    .build_kaas_request(input_values)
                    .map_err(|e| DispatchError::StageFailure { stage: "build_kaas_request", source: e })?;
                let result = worker.run_kaas(req, tenant_id);
                self.store.fulfill(&out_ref, StoredValue::Bytes(Arc::new(Vec::new())));
                result.map_err(|e| DispatchError::StageFailure { stage: "run_kaas", source: e })
            }
        }
    }

    pub fn mode(&self) -> RunnerMode {
        self.mode
    }

    pub fn get_stats(&self) -> std::collections::HashMap<String, crate::stats::ProfCollection> {
        self.policy.as_ref().map(|p| p.get_stats()).unwrap_or_default()
    }

    pub fn shutdown(&self) -> std::collections::HashMap<String, crate::stats::ProfCollection> {
        self.policy.as_ref().map(|p| p.shutdown()).unwrap_or_default()
    }
}
