use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::operation::FetchOperation;
use crate::config::ExecutionOrder;
use crate::transport::RequestPriority;

struct QueuedOperation {
    priority: RequestPriority,
    seq: u64,
    operation: Arc<FetchOperation>,
}

struct QueueState {
    pending: Vec<QueuedOperation>,
    running: HashSet<u64>,
    max_concurrent: usize,
    suspended: bool,
    order: ExecutionOrder,
    next_seq: u64,
}

/// Starts queued operations as slots free up: higher priority first, then in
/// the configured execution order.
pub(crate) struct DownloadQueue {
    state: Mutex<QueueState>,
}

impl DownloadQueue {
    pub fn new(max_concurrent: usize, order: ExecutionOrder) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                running: HashSet::new(),
                max_concurrent: max_concurrent.max(1),
                suspended: false,
                order,
                next_seq: 0,
            }),
        }
    }

    pub fn push(&self, operation: Arc<FetchOperation>) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(QueuedOperation {
                priority: operation.request().priority,
                seq,
                operation,
            });
        }
        self.pump();
    }

    /// Forget an operation that finished or was cancelled, then fill the freed slot.
    pub fn finished(&self, id: u64) {
        {
            let mut state = self.state.lock();
            state.running.remove(&id);
            state.pending.retain(|queued| queued.operation.id() != id);
        }
        self.pump();
    }

    /// Start as many pending operations as the limit allows. Operations are started
    /// after the lock is released, since starting may finish them synchronously.
    pub fn pump(&self) {
        let ready = {
            let mut state = self.state.lock();
            let mut ready = Vec::new();
            while !state.suspended && state.running.len() < state.max_concurrent {
                let Some(index) = state.next_index() else {
                    break;
                };
                let queued = state.pending.swap_remove(index);
                state.running.insert(queued.operation.id());
                ready.push(queued.operation);
            }
            ready
        };

        for operation in ready {
            debug!(id = operation.id(), url = %operation.url(), "Starting queued download");
            operation.start();
        }
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
        if !suspended {
            self.pump();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        self.state.lock().max_concurrent = max_concurrent.max(1);
        self.pump();
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl QueueState {
    fn next_index(&self) -> Option<usize> {
        let order = self.order;
        self.pending
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority.cmp(&b.priority).then_with(|| match order {
                    ExecutionOrder::Fifo => b.seq.cmp(&a.seq),
                    ExecutionOrder::Lifo => a.seq.cmp(&b.seq),
                })
            })
            .map(|(index, _)| index)
    }
}
