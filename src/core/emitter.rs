//! Minimal synchronous event emitter

use crate::core::disposable::Disposable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<T: ?Sized> {
    id: ListenerId,
    once: bool,
    callback: Callback<T>,
}

struct EmitterInner<T: ?Sized> {
    listeners: Mutex<Vec<Listener<T>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> EmitterInner<T> {
    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }
}

/// Publish/subscribe primitive.
///
/// Listeners run synchronously inside [`EventEmitter::emit`], in registration
/// order. The listener list is snapshotted before delivery, so listeners may
/// add or remove listeners (or emit again) without deadlocking; a listener
/// added during an emission does not observe it.
///
/// A listener registered with an owner is removed when the owner is disposed.
pub struct EventEmitter<T: ?Sized> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: ?Sized + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn add<F>(&self, owner: Option<&Disposable>, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(owner, Arc::new(callback), false)
    }

    /// Registers a listener that is removed after its first invocation.
    pub fn add_once<F>(&self, owner: Option<&Disposable>, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(owner, Arc::new(callback), true)
    }

    fn register(&self, owner: Option<&Disposable>, callback: Callback<T>, once: bool) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        if owner.is_some_and(Disposable::is_disposed) {
            return id;
        }

        self.inner.listeners.lock().push(Listener { id, once, callback });

        if let Some(owner) = owner {
            let weak: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
            owner.on_dispose(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(id);
                }
            });
        }

        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.inner.remove(id)
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let mut listeners = self.inner.listeners.lock();
            let snapshot = listeners.iter().map(|l| Arc::clone(&l.callback)).collect();
            listeners.retain(|l| !l.once);
            snapshot
        };

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }
}

impl<T: ?Sized + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
