//! Scoped resources with deterministic teardown

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Teardown = Box<dyn FnOnce() + Send>;

/// Disposal capability.
///
/// Services opt in through [`Service::as_dispose`](crate::core::Service::as_dispose);
/// owning contexts call it exactly once when they are disposed.
pub trait Dispose: Send + Sync {
    fn dispose(&self);
}

/// Handle to a scoped resource.
///
/// Clones share the same state. Teardown callbacks registered with
/// [`Disposable::on_dispose`] run once, in registration order, the first time
/// the resource is disposed. Registering after disposal runs the callback
/// immediately.
#[derive(Clone, Default)]
pub struct Disposable {
    inner: Arc<DisposableInner>,
}

#[derive(Default)]
struct DisposableInner {
    disposed: AtomicBool,
    teardowns: Mutex<Vec<Teardown>>,
}

impl Disposable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn on_dispose<F>(&self, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut teardowns = self.inner.teardowns.lock();
            if !self.is_disposed() {
                teardowns.push(Box::new(teardown));
                return;
            }
        }
        teardown();
    }

    /// Ties `child` to this resource: disposing `self` disposes `child`.
    pub fn adopt(&self, child: &Disposable) {
        let child = child.clone();
        self.on_dispose(move || child.dispose());
    }
}

impl Dispose for Disposable {
    fn dispose(&self) {
        let teardowns = {
            let mut teardowns = self.inner.teardowns.lock();
            if self.inner.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *teardowns)
        };

        for teardown in teardowns {
            teardown();
        }
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_teardown_runs_once() {
        let disposable = Disposable::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        disposable.on_dispose(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        disposable.dispose();
        disposable.dispose();

        assert!(disposable.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let disposable = Disposable::new();
        disposable.dispose();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        disposable.on_dispose(move || ran_clone.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_adopt_propagates() {
        let parent = Disposable::new();
        let child = Disposable::new();
        parent.adopt(&child);

        child.dispose();
        assert!(!parent.is_disposed());

        let other_child = Disposable::new();
        parent.adopt(&other_child);
        parent.dispose();
        assert!(other_child.is_disposed());
    }
}
