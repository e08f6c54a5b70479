//! The worker actor: a long-lived, single-threaded execution unit pinned to
//! one GPU. Modeled as a dedicated OS thread (cf. `cylo::task::ExecutionPool`'s
//! `worker_loop`) that owns its model cache and stats collector exclusively,
//! so no synchronization is needed inside the actor itself, only the
//! command channel crosses a thread boundary.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, trace, warn};

use crate::model::{ModelClass, ModelSpec};
use crate::stats::ProfCollection;
use crate::store::StoredValue;

/// A KaaS accelerator request, opaque to the dispatcher: it is produced by
/// the model's `build_kaas_request` and consumed by `KaasEngine::serve`.
pub type KaasRequest = Vec<u8>;

/// The external GPU execution engine. `runKaas` invokes this with no
/// tenant-side model code on the inner loop. Production backends talk to
/// the accelerator; `InMemoryKaasEngine` echoes the request for tests.
pub trait KaasEngine: Send + Sync {
    fn serve(&self, req: &KaasRequest, stats: Option<&mut ProfCollection>) -> anyhow::Result<Vec<StoredValue>>;
}

#[derive(Default)]
pub struct EchoKaasEngine;

impl KaasEngine for EchoKaasEngine {
    fn serve(&self, req: &KaasRequest, stats: Option<&mut ProfCollection>) -> anyhow::Result<Vec<StoredValue>> {
        let _timer = crate::stats::Timer::new("t_model_run", stats);
        Ok(vec![StoredValue::Bytes(Arc::new(req.clone()))])
    }
}

fn unmarshal_args(n_const: usize, mut args: Vec<StoredValue>) -> (Vec<StoredValue>, Vec<StoredValue>) {
    let data = args.split_off(n_const.min(args.len()));
    (args, data)
}

enum Command {
    RunNative {
        spec: ModelSpec,
        arg: StoredValue,
        inputs: Vec<StoredValue>,
        n_const: usize,
        tenant: String,
        cache_model: bool,
        reply: Sender<anyhow::Result<Vec<StoredValue>>>,
    },
    RunKaas {
        req: KaasRequest,
        tenant: String,
        reply: Sender<anyhow::Result<Vec<StoredValue>>>,
    },
    GetStats {
        reply: Sender<HashMap<String, ProfCollection>>,
    },
    Terminate {
        reply: Sender<HashMap<String, ProfCollection>>,
    },
}

/// Handle to a running worker actor. Cheap to clone; all clones share the
/// same backing thread.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    tx: Sender<Command>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkerHandle(#{})", self.id)
    }
}

impl WorkerHandle {
    /// Spawn a new worker actor pinned to logical id `id`.
    pub fn spawn(id: usize, kaas_engine: Arc<dyn KaasEngine>) -> Self {
        let (tx, rx) = bounded::<Command>(64);
        std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(id, rx, kaas_engine))
            .expect("failed to spawn worker thread");
        Self { id, tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// `runNative(spec, arg, inputs...) -> outputs`. Caches the tenant's
    /// model instance across calls regardless of `cache_model` (the actor
    /// always caches; `cache_model` only matters for task-mode ephemeral
    /// workers, see `pool::run_task`).
    pub fn run_native(
        &self,
        spec: ModelSpec,
        arg: StoredValue,
        n_const: usize,
        inputs: Vec<StoredValue>,
        tenant: &str,
    ) -> anyhow::Result<Vec<StoredValue>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Command::RunNative {
                spec,
                arg,
                inputs,
                n_const,
                tenant: tenant.to_string(),
                cache_model: true,
                reply: reply_tx,
            })
            .map_err(|_| anyhow::anyhow!("worker {} is gone", self.id))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("worker {} dropped the reply channel", self.id))?
    }

    pub fn run_kaas(&self, req: KaasRequest, tenant: &str) -> anyhow::Result<Vec<StoredValue>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Command::RunKaas {
                req,
                tenant: tenant.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| anyhow::anyhow!("worker {} is gone", self.id))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("worker {} dropped the reply channel", self.id))?
    }

    /// Atomically read-and-reset the per-tenant stats map.
    pub fn get_stats(&self) -> HashMap<String, ProfCollection> {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(Command::GetStats { reply: reply_tx }).is_err() {
            return HashMap::new();
        }
        reply_rx.recv().unwrap_or_default()
    }

    /// Ask the actor to exit after draining its current command queue,
    /// returning whatever stats it still held.
    pub fn terminate(&self) -> HashMap<String, ProfCollection> {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(Command::Terminate { reply: reply_tx }).is_err() {
            return HashMap::new();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

fn worker_loop(id: usize, rx: crossbeam_channel::Receiver<Command>, kaas_engine: Arc<dyn KaasEngine>) {
    let mut model_cache: HashMap<String, Arc<dyn ModelClass>> = HashMap::new();
    let mut stats: HashMap<String, ProfCollection> = HashMap::new();

    debug!(worker = id, "worker actor started");
    for cmd in rx.iter() {
        match cmd {
            Command::RunNative {
                spec,
                arg,
                inputs,
                n_const,
                tenant,
                cache_model: _,
                reply,
            } => {
                trace!(worker = id, tenant, "runNative");
                let model = model_cache
                    .entry(tenant.clone())
                    .or_insert_with(|| spec.instantiate(arg))
                    .clone();
                let (constants, data) = unmarshal_args(n_const, inputs);
                let mut args = constants;
                args.extend(data);
                let tenant_stats = stats.entry(tenant).or_default();
                let result = model.run(args, Some(tenant_stats));
                let _ = reply.send(result);
            }
            Command::RunKaas { req, tenant, reply } => {
                trace!(worker = id, tenant, "runKaas");
                let tenant_stats = stats.entry(tenant).or_default();
                let result = kaas_engine.serve(&req, Some(tenant_stats));
                let _ = reply.send(result);
            }
            Command::GetStats { reply } => {
                let drained = std::mem::take(&mut stats);
                let _ = reply.send(drained);
            }
            Command::Terminate { reply } => {
                debug!(worker = id, "worker actor terminating");
                let _ = reply.send(std::mem::take(&mut stats));
                return;
            }
        }
    }
    warn!(worker = id, "worker actor channel closed without terminate()");
}
