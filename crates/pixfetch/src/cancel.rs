//! Cancellation capability shared by every handle the crate hands out.

/// Something in flight that can be told to stop.
///
/// Cancelling is idempotent and never blocks; whatever the handle controls
/// finishes tearing down on its own task.
pub trait Cancelable: Send + Sync {
    fn cancel(&self);
}

impl<T: Cancelable + ?Sized> Cancelable for std::sync::Arc<T> {
    fn cancel(&self) {
        (**self).cancel()
    }
}
