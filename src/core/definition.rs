//! Service definitions
//!
//! A [`Definition`] is the key under which a service instance is registered in
//! a [`Context`]. Definitions compare by identity: every call to
//! [`Definition::new`] allocates a fresh [`DefinitionId`], so two definitions
//! for the same Rust type never collide. Definitions are normally kept in a
//! `static` [`LazyLock`](std::sync::LazyLock).
//!
//! ```
//! use std::sync::{Arc, LazyLock};
//! use synapse_scope::prelude::*;
//!
//! trait Clock: Service {
//!     fn now(&self) -> u64;
//! }
//!
//! struct FixedClock;
//! impl Service for FixedClock {}
//! impl Clock for FixedClock {
//!     fn now(&self) -> u64 { 42 }
//! }
//!
//! static CLOCK: LazyLock<Definition<dyn Clock>> = LazyLock::new(|| Definition::new("Clock"));
//!
//! let ctx = Context::new();
//! ctx.provide(&CLOCK, |_| Ok(Arc::new(FixedClock) as Arc<dyn Clock>)).unwrap();
//! assert_eq!(ctx.inject(&CLOCK).unwrap().now(), 42);
//! ```

use crate::core::context::Context;
use crate::core::disposable::Dispose;
use crate::error::Result;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_DEFINITION_ID: AtomicU64 = AtomicU64::new(0);

/// Base contract of everything stored in a context.
pub trait Service: Send + Sync + 'static {
    /// Disposal capability, consulted once when the owning context is disposed.
    fn as_dispose(&self) -> Option<&dyn Dispose> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionId(u64);

impl DefinitionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type DefaultFactory<T> = fn(&Context) -> Result<Arc<T>>;

pub struct Definition<T: ?Sized> {
    id: DefinitionId,
    name: &'static str,
    default_factory: Option<DefaultFactory<T>>,
    _service: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Service> Definition<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: DefinitionId(NEXT_DEFINITION_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            default_factory: None,
            _service: PhantomData,
        }
    }

    /// Definition that can construct its own instance via
    /// [`Context::provide_default`].
    pub fn with_default(name: &'static str, factory: DefaultFactory<T>) -> Self {
        Self {
            default_factory: Some(factory),
            ..Self::new(name)
        }
    }

    pub fn id(&self) -> DefinitionId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_factory(&self) -> Option<DefaultFactory<T>> {
        self.default_factory
    }
}

impl<T: ?Sized> PartialEq for Definition<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for Definition<T> {}

impl<T: ?Sized> fmt::Debug for Definition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;
    impl Service for Counter {}

    #[test]
    fn test_identity_not_shape() {
        let a = Definition::<Counter>::new("Counter");
        let b = Definition::<Counter>::new("Counter");

        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn test_default_factory() {
        let plain = Definition::<Counter>::new("Counter");
        assert!(plain.default_factory().is_none());

        let with_default = Definition::<Counter>::with_default("Counter", |_| Ok(Arc::new(Counter)));
        assert!(with_default.default_factory().is_some());
    }
}
