//! # Background Continuation
//!
//! Hosts that can keep a transfer alive for a bounded time after its requester
//! has gone away. A grant that expires force-cancels the transfer it belongs to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type BackgroundTaskId = u64;

pub type ExpirationHandler = Box<dyn FnOnce() + Send>;

pub trait BackgroundTaskHost: Send + Sync {
    /// Ask for a continuation grant. `None` means the host refused.
    fn begin(&self, on_expired: ExpirationHandler) -> Option<BackgroundTaskId>;

    /// Release a grant; its expiration handler must not run afterwards.
    fn end(&self, id: BackgroundTaskId);
}

/// Grants that expire after a fixed duration.
pub struct DeadlineHost {
    grant: Duration,
    next_id: AtomicU64,
    grants: Arc<Mutex<HashMap<BackgroundTaskId, CancellationToken>>>,
}

impl DeadlineHost {
    pub fn new(grant: Duration) -> Self {
        Self {
            grant,
            next_id: AtomicU64::new(1),
            grants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_grants(&self) -> usize {
        self.grants.lock().len()
    }
}

impl BackgroundTaskHost for DeadlineHost {
    fn begin(&self, on_expired: ExpirationHandler) -> Option<BackgroundTaskId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.grants.lock().insert(id, token.clone());

        let grants = self.grants.clone();
        let grant = self.grant;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grant) => {
                    // Only fire if the grant is still live
                    if grants.lock().remove(&id).is_some() {
                        debug!(id, "Background grant expired");
                        on_expired();
                    }
                }
            }
        });

        Some(id)
    }

    fn end(&self, id: BackgroundTaskId) {
        if let Some(token) = self.grants.lock().remove(&id) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn test_grant_expires() {
        let host = DeadlineHost::new(Duration::from_secs(30));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        host.begin(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        assert_eq!(host.active_grants(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(host.active_grants(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_grant_never_fires() {
        let host = DeadlineHost::new(Duration::from_secs(30));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let id = host
            .begin(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        host.end(id);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(host.active_grants(), 0);
    }
}
