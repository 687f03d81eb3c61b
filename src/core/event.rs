//! Event system
//!
//! Every context tree shares one [`EventBus`]. Emitting from a context wraps
//! the event in an [`EventWrapper`] carrying [`Routing`] metadata; each
//! [`EventBusListener`] decides locally whether the event reaches it.
//!
//! ```text
//!            root (ancestry {0})
//!              │
//!            mid  (ancestry {0, 1})
//!              │
//!            leaf (ancestry {0, 1, 2})
//!
//! Down from mid  → mid, leaf        (origin id ∈ listener ancestry)
//! Up   from mid  → mid, root        (listener id ∈ origin ancestry)
//! Global         → everyone
//! ```

use crate::core::disposable::{Disposable, Dispose};
use crate::core::emitter::EventEmitter;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Event trait
pub trait Event: Send + Sync + 'static {
    fn event_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Sub-key for event families that share one Rust type but must be
    /// listened to separately (status updates are keyed by definition).
    fn event_key(&self) -> Option<u64> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Auto-implement Event trait
#[macro_export]
macro_rules! impl_event {
    ($($t:ty),+) => {
        $(
            impl $crate::core::event::Event for $t {
                fn as_any(&self) -> &dyn std::any::Any {
                    self
                }
            }
        )+
    };
}

impl_event!(
    String, i32, i64, u32, u64, f32, f64, bool,
    Vec<u8>, Vec<String>, HashMap<String, String>
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the origin towards the root.
    Up,
    /// From the origin into its subtree.
    Down,
}

/// Identity of a context as seen by the router.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub id: u64,
    pub ancestry: Arc<HashSet<u64>>,
}

#[derive(Debug, Clone)]
pub enum Routing {
    Directed {
        direction: Direction,
        origin_id: u64,
        origin_ancestry: Arc<HashSet<u64>>,
    },
    Global,
}

impl Routing {
    pub fn directed(direction: Direction, origin: &ContextInfo) -> Self {
        Routing::Directed {
            direction,
            origin_id: origin.id,
            origin_ancestry: Arc::clone(&origin.ancestry),
        }
    }

    /// Whether an event with this routing reaches `listener`.
    pub fn admits(&self, listener: &ContextInfo) -> bool {
        match self {
            Routing::Global => true,
            Routing::Directed {
                direction: Direction::Down,
                origin_id,
                ..
            } => listener.ancestry.contains(origin_id),
            Routing::Directed {
                direction: Direction::Up,
                origin_ancestry,
                ..
            } => origin_ancestry.contains(&listener.id),
        }
    }
}

/// Event wrapper with routing metadata
pub struct EventWrapper {
    pub inner: Arc<dyn Any + Send + Sync>,
    pub type_id: TypeId,
    pub key: Option<u64>,
    pub type_name: &'static str,
    pub routing: Routing,
}

impl EventWrapper {
    pub fn new<E: Event>(event: E, routing: Routing) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            key: event.event_key(),
            type_name: event.event_type(),
            inner: Arc::new(event),
            routing,
        }
    }

    #[must_use]
    pub fn downcast<E: Any>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    fn matches(&self, filter: &EventFilter) -> bool {
        self.type_id == filter.type_id && (filter.key.is_none() || filter.key == self.key)
    }
}

impl std::fmt::Debug for EventWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWrapper")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .field("routing", &self.routing)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct EventFilter {
    type_id: TypeId,
    key: Option<u64>,
}

/// Synchronous bus shared by one context tree.
pub struct EventBus {
    emitter: EventEmitter<EventWrapper>,
    lifetime: Disposable,
    closed: watch::Sender<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            emitter: EventEmitter::new(),
            lifetime: Disposable::new(),
            closed: watch::channel(false).0,
        }
    }

    pub fn publish<E: Event>(&self, event: E, routing: Routing) {
        if self.lifetime.is_disposed() {
            return;
        }
        self.emitter.emit(&EventWrapper::new(event, routing));
    }

    pub fn publish_global<E: Event>(&self, event: E) {
        self.publish(event, Routing::Global);
    }

    /// Creates a listener for events of type `E` as seen from `info`.
    pub fn listener<E: Event>(&self, info: ContextInfo) -> EventBusListener<E> {
        EventBusListener::new(self, info, None)
    }

    /// Like [`EventBus::listener`], restricted to events whose
    /// [`Event::event_key`] equals `key`.
    pub fn keyed_listener<E: Event>(&self, info: ContextInfo, key: u64) -> EventBusListener<E> {
        EventBusListener::new(self, info, Some(key))
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_disposed()
    }

    /// Flips to `true` once the bus is disposed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispose for EventBus {
    fn dispose(&self) {
        self.lifetime.dispose();
        self.emitter.clear();
        self.closed.send_replace(true);
    }
}

/// Typed, routed view of the bus for one context.
///
/// The listener unsubscribes itself when dropped or disposed.
pub struct EventBusListener<E: Event> {
    pub on_event: EventEmitter<E>,
    lifetime: Disposable,
}

impl<E: Event> EventBusListener<E> {
    fn new(bus: &EventBus, info: ContextInfo, key: Option<u64>) -> Self {
        let on_event = EventEmitter::<E>::new();
        let lifetime = Disposable::new();

        let filter = EventFilter {
            type_id: TypeId::of::<E>(),
            key,
        };
        let forward = on_event.clone();
        bus.emitter.add(Some(&lifetime), move |wrapper| {
            if !wrapper.matches(&filter) || !wrapper.routing.admits(&info) {
                return;
            }
            if let Some(event) = wrapper.downcast::<E>() {
                forward.emit(event);
            }
        });

        Self { on_event, lifetime }
    }

    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_disposed()
    }
}

impl<E: Event> Dispose for EventBusListener<E> {
    fn dispose(&self) {
        self.lifetime.dispose();
        self.on_event.clear();
    }
}

impl<E: Event> Drop for EventBusListener<E> {
    fn drop(&mut self) {
        self.lifetime.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Ping(u32);
    impl_event!(Ping);

    fn info(id: u64, ancestry: &[u64]) -> ContextInfo {
        ContextInfo {
            id,
            ancestry: Arc::new(ancestry.iter().copied().collect()),
        }
    }

    #[test]
    fn test_routing_down() {
        let root = info(0, &[0]);
        let mid = info(1, &[0, 1]);
        let leaf = info(2, &[0, 1, 2]);

        let from_mid = Routing::directed(Direction::Down, &mid);
        assert!(!from_mid.admits(&root));
        assert!(from_mid.admits(&mid));
        assert!(from_mid.admits(&leaf));
    }

    #[test]
    fn test_routing_up() {
        let root = info(0, &[0]);
        let mid = info(1, &[0, 1]);
        let leaf = info(2, &[0, 1, 2]);

        let from_mid = Routing::directed(Direction::Up, &mid);
        assert!(from_mid.admits(&root));
        assert!(from_mid.admits(&mid));
        assert!(!from_mid.admits(&leaf));
    }

    #[test]
    fn test_routing_ignores_siblings() {
        let left = info(1, &[0, 1]);
        let right = info(2, &[0, 2]);

        assert!(!Routing::directed(Direction::Down, &left).admits(&right));
        assert!(!Routing::directed(Direction::Up, &left).admits(&right));
        assert!(Routing::Global.admits(&right));
    }

    #[test]
    fn test_listener_filters_by_type() {
        let bus = EventBus::new();
        let listener = bus.listener::<Ping>(info(0, &[0]));
        let total = Arc::new(AtomicU32::new(0));
        let total_clone = total.clone();
        listener.on_event.add(None, move |ping| {
            total_clone.fetch_add(ping.0, Ordering::SeqCst);
        });

        bus.publish_global(Ping(3));
        bus.publish_global("not a ping".to_string());

        assert_eq!(total.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropped_listener_unsubscribes() {
        let bus = EventBus::new();
        {
            let _listener = bus.listener::<Ping>(info(0, &[0]));
            assert_eq!(bus.listener_count(), 1);
        }
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_disposed_bus_drops_events() {
        let bus = EventBus::new();
        let listener = bus.listener::<Ping>(info(0, &[0]));
        let total = Arc::new(AtomicU32::new(0));
        let total_clone = total.clone();
        listener.on_event.add(None, move |_| {
            total_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispose();
        bus.publish_global(Ping(1));

        assert_eq!(bus.listener_count(), 0);
        assert_eq!(total.load(Ordering::SeqCst), 0);
        assert!(*bus.closed().borrow());
    }
}
