//! Push-mode completion delivery: a bounded queue fed by dispatch threads
//! and drained by a single handler thread, shut down by a sentinel count
//! rather than by dropping the sender (so in-flight completions already
//! queued are still delivered before the handler exits). Grounded on
//! `rayBench.nShot`'s async completion callback plumbing.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::store::ObjectRef;

/// One completed request, or the sentinel telling the handler how many
/// completions to expect before it may exit.
pub enum CompletionMessage {
    Done { query_id: u64, result: ObjectRef },
    Sentinel { expected: u64 },
}

pub struct CompletionQueue {
    tx: Sender<CompletionMessage>,
}

pub type CompletionCallback = Box<dyn FnMut(u64, ObjectRef) + Send>;

impl CompletionQueue {
    /// Spawn the handler thread and return a queue handle plus its join
    /// handle. The handler invokes `on_complete` for every `Done` message
    /// and exits once it has processed `expected` of them, as announced by
    /// a `Sentinel` message (sent exactly once, after all work has been
    /// enqueued).
    pub fn spawn(capacity: usize, mut on_complete: CompletionCallback) -> (Self, JoinHandle<u64>) {
        let (tx, rx): (Sender<CompletionMessage>, Receiver<CompletionMessage>) = bounded(capacity);
        let handle = std::thread::Builder::new()
            .name("completion-handler".to_string())
            .spawn(move || {
                let mut processed: u64 = 0;
                let mut expected: Option<u64> = None;
                loop {
                    if let Some(e) = expected {
                        if processed >= e {
                            break;
                        }
                    }
                    match rx.recv() {
                        Ok(CompletionMessage::Done { query_id, result }) => {
                            on_complete(query_id, result);
                            processed += 1;
                        }
                        Ok(CompletionMessage::Sentinel { expected: e }) => {
                            expected = Some(e);
                            if processed >= e {
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("completion queue closed before sentinel arrived");
                            break;
                        }
                    }
                }
                debug!(processed, "completion handler exiting");
                processed
            })
            .expect("failed to spawn completion handler thread");
        (Self { tx }, handle)
    }

    pub fn push(&self, query_id: u64, result: ObjectRef) -> Result<(), crossbeam_channel::SendError<CompletionMessage>> {
        self.tx.send(CompletionMessage::Done { query_id, result })
    }

    /// Announce the total number of completions the handler should expect,
    /// letting it exit once it has drained that many. Must be sent after
    /// every `push` that will ever happen for this run.
    pub fn close(&self, expected: u64) -> Result<(), crossbeam_channel::SendError<CompletionMessage>> {
        self.tx.send(CompletionMessage::Sentinel { expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn handler_exits_after_exactly_the_sentinel_count() {
        let store = InMemoryObjectStore::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let (queue, handle) = CompletionQueue::spawn(
            16,
            Box::new(move |_qid, _r| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..5u64 {
            let r = store.put_bytes(vec![i as u8]);
            queue.push(i, r).unwrap();
        }
        queue.close(5).unwrap();

        let processed = handle.join().unwrap();
        assert_eq!(processed, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn a_sixth_push_after_sentinel_is_never_consumed() {
        let store = InMemoryObjectStore::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let (queue, handle) = CompletionQueue::spawn(
            16,
            Box::new(move |_qid, _r| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..5u64 {
            let r = store.put_bytes(vec![i as u8]);
            queue.push(i, r).unwrap();
        }
        queue.close(5).unwrap();
        let processed = handle.join().unwrap();
        assert_eq!(processed, 5);

        // The handler thread is gone; a late push lands in a closed
        // channel and is simply undelivered, not a panic.
        let extra = store.put_bytes(vec![9]);
        let _ = queue.push(5, extra);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
