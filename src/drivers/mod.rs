//! Driver entry points: three ways to feed requests into a `RunnerPool`.
//! `nshot` is the synchronous/async batch benchmark, `mlperf` is the
//! latency-harness SUT callback, and `server` (in the crate root) is the
//! live network front end. All three funnel through `Dispatcher`.

pub mod mlperf;
pub mod nshot;

use std::sync::Arc;
use std::time::Duration;

use crate::config::BenchConfig;
use crate::error::DispatchError;
use crate::model::ModelSpec;
use crate::pipeline;
use crate::pool::RunnerPool;
use crate::store::{InMemoryObjectStore, ObjectRef, StoredValue};

/// Bundles a runner pool, object store, and model spec behind the one call
/// every driver needs: "run this tenant's request, give me back a ref to
/// the final result."
pub struct Dispatcher {
    config: BenchConfig,
    pool: RunnerPool,
    store: Arc<InMemoryObjectStore>,
    model_spec: ModelSpec,
}

impl Dispatcher {
    pub fn new(config: BenchConfig, pool: RunnerPool, store: Arc<InMemoryObjectStore>, model_spec: ModelSpec) -> Self {
        Self { config, pool, store, model_spec }
    }

    pub fn store(&self) -> &InMemoryObjectStore {
        &self.store
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Submit one request for `tenant_id` and return a ref to its final
    /// output, after the full pre/run/post pipeline (or the fused inline
    /// path when `config.inline` is set).
    pub fn dispatch(
        &self,
        tenant_id: &str,
        model_arg: StoredValue,
        inp: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<ObjectRef, DispatchError> {
        let inp_ref = self.store.put_bytes(inp);
        let out_refs = if self.config.inline {
            pipeline::run_inline(&self.store, &self.model_spec, model_arg, &[], &[inp_ref])?
        } else {
            pipeline::run_staged(&self.pool, &self.store, &self.model_spec, model_arg, tenant_id, &[], &[inp_ref], timeout)?
        };
        out_refs
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::StageFailure {
                stage: "post",
                source: anyhow::anyhow!("pipeline produced no output refs"),
            })
    }

    pub fn get_stats(&self) -> std::collections::HashMap<String, crate::stats::ProfCollection> {
        self.pool.get_stats()
    }

    pub fn shutdown(&self) -> std::collections::HashMap<String, crate::stats::ProfCollection> {
        self.pool.shutdown()
    }
}
