//! Single task every callback-form result is delivered on.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

pub(crate) type DeliveryJob = Box<dyn FnOnce() + Send>;

/// Runs posted jobs one at a time, in posting order, on one task.
///
/// The task is spawned on the first post, so a queue can be created outside a
/// runtime.
pub(crate) struct DeliveryQueue {
    sender: mpsc::UnboundedSender<DeliveryJob>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DeliveryJob>>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn post(&self, job: DeliveryJob) {
        if let Some(mut receiver) = self.receiver.lock().take() {
            tokio::spawn(async move {
                while let Some(job) = receiver.recv().await {
                    job();
                }
            });
        }

        if self.sender.send(job).is_err() {
            warn!("Delivery queue is closed, dropping callback");
        }
    }
}
