//! Hierarchical service contexts

use crate::core::definition::{Definition, DefinitionId, Service};
use crate::core::disposable::Dispose;
use crate::core::event::{ContextInfo, Direction, Event, EventBus, EventBusListener, Routing};
use crate::error::{Result, ResultExt, ScopeError};
use parking_lot::RwLock;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::debug;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static AMBIENT: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// Keeps a context on the ambient stack for as long as it lives.
struct AmbientGuard;

impl AmbientGuard {
    fn enter(context: &Context) -> Self {
        AMBIENT.with(|stack| stack.borrow_mut().push(context.clone()));
        AmbientGuard
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        AMBIENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) type ErasedRecord = Box<dyn Any + Send + Sync>;

struct ServiceSlot {
    name: &'static str,
    seq: u64,
    /// Holds an `Arc<T>` for the slot's definition.
    instance: ErasedRecord,
    dispose: Box<dyn Fn() + Send + Sync>,
}

struct ContextInner {
    info: ContextInfo,
    parent: Option<Context>,
    services: RwLock<HashMap<DefinitionId, ServiceSlot>>,
    statuses: RwLock<HashMap<DefinitionId, ErasedRecord>>,
    bus: OnceLock<Arc<EventBus>>,
    next_seq: AtomicU64,
    disposed: AtomicBool,
    closed: watch::Sender<bool>,
}

/// A scope in a tree of service contexts.
///
/// Cloning a `Context` yields another handle to the same scope. Lookups walk
/// from the scope towards the root; each scope owns the instances provided on
/// it and disposes them in [`Context::dispose`]. Parents and children are
/// disposed independently.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a root context.
    pub fn new() -> Self {
        Self::create(None)
    }

    /// Creates a child scope of `self`.
    pub fn child(&self) -> Self {
        Self::create(Some(self.clone()))
    }

    fn create(parent: Option<Context>) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mut ancestry: HashSet<u64> = parent
            .as_ref()
            .map(|p| p.inner.info.ancestry.iter().copied().collect())
            .unwrap_or_default();
        ancestry.insert(id);

        Self {
            inner: Arc::new(ContextInner {
                info: ContextInfo {
                    id,
                    ancestry: Arc::new(ancestry),
                },
                parent,
                services: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                bus: OnceLock::new(),
                next_seq: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                closed: watch::channel(false).0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.info.id
    }

    pub fn info(&self) -> &ContextInfo {
        &self.inner.info
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn root(&self) -> &Context {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// The innermost context currently running a factory on this thread.
    pub fn current() -> Result<Context> {
        AMBIENT
            .with(|stack| stack.borrow().last().cloned())
            .ok_or(ScopeError::NoAmbientContext)
    }

    /// Runs `factory` with `self` as the ambient context.
    ///
    /// The previous ambient context is restored when `factory` returns or
    /// unwinds. Async code must call this again after every `.await`.
    pub fn instantiate<R, F>(&self, factory: F) -> R
    where
        F: FnOnce(&Context) -> R,
    {
        let _guard = AmbientGuard::enter(self);
        factory(self)
    }

    pub fn provide<T, F>(&self, definition: &Definition<T>, factory: F) -> Result<Arc<T>>
    where
        T: ?Sized + Service,
        F: FnOnce(&Context) -> Result<Arc<T>>,
    {
        if self.is_disposed() {
            return Err(ScopeError::ContextDisposed(self.id()));
        }
        if self.has_local(definition) {
            return Err(ScopeError::DuplicateService(definition.name().to_string()));
        }

        let instance = self.instantiate(factory).with_service(definition.name())?;
        self.insert_instance(definition.id(), definition.name(), Arc::clone(&instance))?;

        debug!(
            context = self.id(),
            service = definition.name(),
            "Provided service"
        );
        Ok(instance)
    }

    /// Provides `definition` using its own default factory.
    pub fn provide_default<T>(&self, definition: &Definition<T>) -> Result<Arc<T>>
    where
        T: ?Sized + Service,
    {
        let factory = definition
            .default_factory()
            .ok_or_else(|| ScopeError::NoDefaultFactory(definition.name().to_string()))?;
        self.provide(definition, factory)
    }

    pub fn inject<T>(&self, definition: &Definition<T>) -> Result<Arc<T>>
    where
        T: ?Sized + Service,
    {
        self.try_inject(definition)
            .ok_or_else(|| ScopeError::DependencyNotProvided(definition.name().to_string()))
    }

    pub fn try_inject<T>(&self, definition: &Definition<T>) -> Option<Arc<T>>
    where
        T: ?Sized + Service,
    {
        let mut current = Some(self);
        while let Some(context) = current {
            if let Some(instance) = context.lookup_local::<T>(definition.id()) {
                return Some(instance);
            }
            current = context.parent();
        }
        None
    }

    /// Whether `definition` is provided on this very scope.
    pub fn has_local<T>(&self, definition: &Definition<T>) -> bool
    where
        T: ?Sized + Service,
    {
        self.inner.services.read().contains_key(&definition.id())
    }

    fn lookup_local<T>(&self, id: DefinitionId) -> Option<Arc<T>>
    where
        T: ?Sized + Service,
    {
        self.inner
            .services
            .read()
            .get(&id)
            .and_then(|slot| slot.instance.downcast_ref::<Arc<T>>())
            .cloned()
    }

    pub(crate) fn insert_instance<T>(&self, id: DefinitionId, name: &'static str, instance: Arc<T>) -> Result<()>
    where
        T: ?Sized + Service,
    {
        let hook = Arc::clone(&instance);
        let slot = ServiceSlot {
            name,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            instance: Box::new(instance),
            dispose: Box::new(move || {
                if let Some(disposable) = hook.as_dispose() {
                    disposable.dispose();
                }
            }),
        };

        let mut services = self.inner.services.write();
        if services.contains_key(&id) {
            return Err(ScopeError::DuplicateService(name.to_string()));
        }
        services.insert(id, slot);
        Ok(())
    }

    /// Flips to `true` once this context is disposed.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub(crate) fn statuses(&self) -> &RwLock<HashMap<DefinitionId, ErasedRecord>> {
        &self.inner.statuses
    }

    /// Disposes every instance owned by this scope, newest first.
    ///
    /// Later calls are no-ops. Disposing a root also tears down the tree's
    /// event bus.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut slots: Vec<ServiceSlot> = self
            .inner
            .services
            .write()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        slots.sort_by(|a, b| b.seq.cmp(&a.seq));

        for slot in slots {
            debug!(context = self.id(), service = slot.name, "Disposing service");
            (slot.dispose)();
        }
        self.inner.statuses.write().clear();
        self.inner.closed.send_replace(true);

        if let Some(bus) = self.inner.bus.get() {
            bus.dispose();
        }
    }

    /// The bus shared by this context tree, created on first use by the root.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(self.root().inner.bus.get_or_init(|| Arc::new(EventBus::new())))
    }

    pub fn listen<E: Event>(&self) -> EventBusListener<E> {
        self.event_bus().listener(self.inner.info.clone())
    }

    pub fn emit<E: Event>(&self, event: E, direction: Direction) {
        self.event_bus()
            .publish(event, Routing::directed(direction, &self.inner.info));
    }

    pub fn emit_global<E: Event>(&self, event: E) {
        self.event_bus().publish_global(event);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("parent", &self.parent().map(Context::id))
            .field("services", &self.inner.services.read().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
