//! Request id generation

use crate::core::definition::{Definition, Service};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

/// Source of request ids, unique per call.
pub trait IdProvider: Service {
    fn next_id(&self) -> String;
}

/// Id provider consulted by [`MessageBridge`](crate::bridge::MessageBridge).
/// Defaults to [`IncrementalIdProvider`].
pub static ID_PROVIDER: LazyLock<Definition<dyn IdProvider>> = LazyLock::new(|| {
    Definition::with_default("IdProvider", |_| {
        Ok(Arc::new(IncrementalIdProvider::new()) as Arc<dyn IdProvider>)
    })
});

/// Yields "0", "1", "2", ...
#[derive(Debug, Default)]
pub struct IncrementalIdProvider {
    next: AtomicU64,
}

impl IncrementalIdProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service for IncrementalIdProvider {}

impl IdProvider for IncrementalIdProvider {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Random v4 UUIDs, for bridges whose peers may restart.
#[derive(Debug, Default)]
pub struct UuidIdProvider;

impl Service for UuidIdProvider {}

impl IdProvider for UuidIdProvider {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Context;
    use std::collections::HashSet;

    #[test]
    fn test_incremental() {
        let ids = IncrementalIdProvider::new();
        assert_eq!(ids.next_id(), "0");
        assert_eq!(ids.next_id(), "1");
    }

    #[test]
    fn test_uuid_unique() {
        let ids = UuidIdProvider;
        let seen: HashSet<String> = (0..64).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_default_provider() {
        let context = Context::new();
        let provider = context.provide_default(&ID_PROVIDER).unwrap();
        assert_eq!(provider.next_id(), "0");
        assert_eq!(context.inject(&ID_PROVIDER).unwrap().next_id(), "1");
    }
}
