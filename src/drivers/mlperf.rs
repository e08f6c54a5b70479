//! Latency-harness driver: a minimal MLPerf-style SUT (system under test)
//! callback. A load generator calls `issue_query` with a batch of queries
//! and later blocks on `drain` to learn when every query's completion has
//! been delivered through the push-mode `CompletionQueue`.

use std::sync::Arc;

use tracing::debug;

use crate::completion::CompletionQueue;
use crate::store::{ObjectRef, StoredValue};

use super::Dispatcher;

#[derive(Debug, Clone)]
pub struct MlperfQuery {
    pub id: u64,
    pub tenant_id: String,
    pub input: Vec<u8>,
}

/// Implements the `runBatch(queries)` contract a load generator drives:
/// dispatch every query in the batch concurrently and deliver each
/// completion through the push queue as soon as it is ready, in whatever
/// order the runner pool finishes them.
pub struct SystemUnderTest {
    dispatcher: Arc<Dispatcher>,
}

impl SystemUnderTest {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dispatch `queries` concurrently (one thread per query) and return a
    /// `CompletionQueue` handle plus its handler join handle. The caller
    /// supplies `on_complete`, invoked once per finished query with its
    /// `ObjectRef`; the handler thread exits once every query in the batch
    /// has been delivered.
    pub fn run_batch(
        &self,
        queries: Vec<MlperfQuery>,
        on_complete: crate::completion::CompletionCallback,
    ) -> std::thread::JoinHandle<u64> {
        let n = queries.len() as u64;
        let (queue, handle) = CompletionQueue::spawn(self.dispatcher.config().completion_queue_capacity, on_complete);
        let dispatcher = self.dispatcher.clone();

        std::thread::spawn(move || {
            std::thread::scope(|scope| {
                for query in &queries {
                    let dispatcher = &dispatcher;
                    let queue = &queue;
                    scope.spawn(move || {
                        debug!(query_id = query.id, tenant = query.tenant_id.as_str(), "dispatching mlperf query");
                        let out_ref = match dispatcher.dispatch(
                            &query.tenant_id,
                            StoredValue::Bytes(Arc::new(Vec::new())),
                            query.input.clone(),
                            None,
                        ) {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(query_id = query.id, error = %e, "mlperf query failed");
                                error_placeholder_ref(dispatcher)
                            }
                        };
                        let _ = queue.push(query.id, out_ref);
                    });
                }
            });
            queue.close(n).ok();
        });
        handle
    }
}

/// Stand-in ref returned for a failed query so the completion queue still
/// receives exactly one message per query in the batch.
fn error_placeholder_ref(dispatcher: &Dispatcher) -> ObjectRef {
    dispatcher.store().put_bytes(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, PolicyKind, RunnerMode};
    use crate::model::testing::doubling_model_spec;
    use crate::policy::round_robin::PolicyRR;
    use crate::pool::RunnerPool;
    use crate::store::InMemoryObjectStore;
    use crate::worker::EchoKaasEngine;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn run_batch_delivers_every_query_exactly_once() {
        let store = Arc::new(InMemoryObjectStore::new());
        let spec = doubling_model_spec(false, false);
        let policy = Box::new(PolicyRR::new(2, Arc::new(EchoKaasEngine)));
        let pool = RunnerPool::with_policy(RunnerMode::Actor, policy, store.clone(), spec.clone(), Arc::new(EchoKaasEngine));
        let config = BenchConfig::new(RunnerMode::Actor, PolicyKind::RoundRobin, 2).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(config, pool, store, spec));
        let sut = SystemUnderTest::new(dispatcher);

        let queries: Vec<MlperfQuery> = (0..6)
            .map(|i| MlperfQuery {
                id: i,
                tenant_id: "t".to_string(),
                input: vec![i as u8],
            })
            .collect();

        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        let handle = sut.run_batch(
            queries,
            Box::new(move |_id, _r| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let processed = handle.join().unwrap();
        assert_eq!(processed, 6);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }
}
