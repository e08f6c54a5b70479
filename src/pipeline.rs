//! Composes a tenant's model into a pre -> run -> post pipeline over the
//! object store, or fuses all three into one inline call when the model
//! needs no cross-stage scheduling. Grounded on `rayBench.runTask` /
//! `rayBench.runInline` / `rayBench._runOne`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::DispatchError;
use crate::model::{pack_inputs, ModelSpec};
use crate::pool::RunnerPool;
use crate::store::{deref_if_kaas, InMemoryObjectStore, ObjectRef, StoredValue};

fn deref_refs(store: &InMemoryObjectStore, refs: &[ObjectRef], is_kaas: bool) -> Vec<StoredValue> {
    refs.iter()
        .map(|r| deref_if_kaas(store, StoredValue::Ref(r.clone()), is_kaas))
        .collect()
}

fn store_all(store: &InMemoryObjectStore, values: Vec<StoredValue>) -> Vec<ObjectRef> {
    values.into_iter().map(|v| store.put(v)).collect()
}

/// Dispatch one request through the staged pre -> run -> post pipeline,
/// returning the final stage's output refs. Skips the post stage entirely
/// when the model declares `no_post()`, matching the "inline noPost"
/// short-circuit the completion path depends on to emit exactly one
/// message.
pub fn run_staged(
    pool: &RunnerPool,
    store: &InMemoryObjectStore,
    model_spec: &ModelSpec,
    model_arg: StoredValue,
    tenant_id: &str,
    const_refs: &[ObjectRef],
    inp_refs: &[ObjectRef],
    timeout: Option<Duration>,
) -> Result<Vec<ObjectRef>, DispatchError> {
    let model = model_spec.instantiate(model_arg.clone());
    let is_kaas = model.model_type() == crate::model::ModelType::Kaas;

    let pre_refs = pack_inputs(&model.pre_map(), const_refs, inp_refs, &[], &[]);
    let pre_vals = deref_refs(store, &pre_refs, is_kaas);
    let pre_out = model
        .pre(pre_vals)
        .map_err(|e| DispatchError::StageFailure { stage: "pre", source: e })?;
    let pre_out_refs = store_all(store, pre_out);

    let run_refs = pack_inputs(&model.run_map(), const_refs, inp_refs, &pre_out_refs, &[]);
    let run_vals = deref_refs(store, &run_refs, is_kaas);
    let n_const = model.n_const();
    let run_out = pool.run(tenant_id, model_arg, n_const, run_refs.clone(), run_vals, timeout)?;
    let run_out_refs = store_all(store, run_out);

    if model.no_post() {
        return Ok(run_out_refs);
    }

    let post_refs = pack_inputs(&model.post_map(), const_refs, inp_refs, &pre_out_refs, &run_out_refs);
    let post_vals = deref_refs(store, &post_refs, is_kaas);
    let post_out = model
        .post(post_vals)
        .map_err(|e| DispatchError::StageFailure { stage: "post", source: e })?;
    Ok(store_all(store, post_out))
}

/// Fuse pre, run, and post into a single call with no intermediate object
/// store round trips. Only meaningful for native models dispatched
/// directly (no worker-pool scheduling in between stages); used by `nShot`
/// when `BenchConfig::inline` is set.
pub fn run_inline(
    store: &InMemoryObjectStore,
    model_spec: &ModelSpec,
    model_arg: StoredValue,
    const_refs: &[ObjectRef],
    inp_refs: &[ObjectRef],
) -> Result<Vec<ObjectRef>, DispatchError> {
    let model = model_spec.instantiate(model_arg);
    let is_kaas = model.model_type() == crate::model::ModelType::Kaas;

    let pre_refs = pack_inputs(&model.pre_map(), const_refs, inp_refs, &[], &[]);
    let pre_vals = deref_refs(store, &pre_refs, is_kaas);
    let pre_out = model
        .pre(pre_vals)
        .map_err(|e| DispatchError::StageFailure { stage: "pre", source: e })?;
    let pre_out_refs = store_all(store, pre_out);

    let run_refs = pack_inputs(&model.run_map(), const_refs, inp_refs, &pre_out_refs, &[]);
    let run_vals = deref_refs(store, &run_refs, is_kaas);
    let run_out = model
        .run(run_vals, None)
        .map_err(|e| DispatchError::StageFailure { stage: "run", source: e })?;
    let run_out_refs = store_all(store, run_out);

    if model.no_post() {
        return Ok(run_out_refs);
    }

    let post_refs = pack_inputs(&model.post_map(), const_refs, inp_refs, &pre_out_refs, &run_out_refs);
    let post_vals = deref_refs(store, &post_refs, is_kaas);
    let post_out = model
        .post(post_vals)
        .map_err(|e| DispatchError::StageFailure { stage: "post", source: e })?;
    Ok(store_all(store, post_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerMode;
    use crate::model::testing::doubling_model_spec;
    use crate::policy::round_robin::PolicyRR;
    use crate::worker::EchoKaasEngine;

    #[test]
    fn staged_pipeline_applies_pre_run_post_in_order() {
        let store = Arc::new(InMemoryObjectStore::new());
        let spec = doubling_model_spec(false, false);
        let policy = Box::new(PolicyRR::new(1, Arc::new(EchoKaasEngine)));
        let pool = RunnerPool::with_policy(RunnerMode::Actor, policy, store.clone(), spec.clone(), Arc::new(EchoKaasEngine));

        let inp = store.put_bytes(vec![1]);
        let out_refs = run_staged(
            &pool,
            &store,
            &spec,
            StoredValue::Bytes(Arc::new(vec![])),
            "tenant",
            &[],
            &[inp],
            None,
        )
        .unwrap();
        match store.get(&out_refs[0]).unwrap() {
            StoredValue::Bytes(b) => assert_eq!(*b, vec![8]), // doubled 3 times: 1 -> 2 -> 4 -> 8
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn inline_short_circuits_when_no_post() {
        let store = InMemoryObjectStore::new();
        let spec = doubling_model_spec(true, false);
        let inp = store.put_bytes(vec![1]);
        let out_refs = run_inline(&store, &spec, StoredValue::Bytes(Arc::new(vec![])), &[], &[inp]).unwrap();
        match store.get(&out_refs[0]).unwrap() {
            StoredValue::Bytes(b) => assert_eq!(*b, vec![4]), // doubled twice: 1 -> 2 -> 4, post skipped
            other => panic!("unexpected: {other:?}"),
        }
    }
}
