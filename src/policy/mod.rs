//! Scheduling policies decide which worker handles the next request for a
//! given tenant. `RunnerPool` is generic over `Policy`; all admission
//! control, fairness, and eviction behavior lives here, not in the pool.

pub mod balance;
pub mod exclusive;
pub mod round_robin;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::DispatchError;
use crate::stats::ProfCollection;
use crate::store::ObjectRef;
use crate::worker::WorkerHandle;

/// A reservation handed back by `get_runner`, threaded back into `update`
/// once the caller has dispatched work to `worker`.
pub struct RunnerHandle {
    pub worker: WorkerHandle,
    pub worker_idx: usize,
}

pub trait Policy: Send + Sync {
    /// Obtain a worker to run `tenant_id`'s next request, blocking (bounded
    /// by `timeout`) until one is available per the policy's admission
    /// rules.
    fn get_runner(&self, tenant_id: &str, timeout: Option<Duration>) -> Result<RunnerHandle, DispatchError>;

    /// Release the reservation obtained from `get_runner`, recording which
    /// output ref the dispatched work will eventually produce so balanced
    /// policies can poll it for worker availability.
    fn update(&self, tenant_id: &str, handle: RunnerHandle, out_ref: ObjectRef);

    /// Drain and merge every worker's accumulated per-tenant stats.
    fn get_stats(&self) -> HashMap<String, ProfCollection>;

    /// Ask every worker this policy owns to terminate, returning final
    /// stats.
    fn shutdown(&self) -> HashMap<String, ProfCollection>;
}
