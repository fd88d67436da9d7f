//! Subsystem registry: routes inbound envelopes by their `subsystem` name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use super::Core;
use crate::error::Result;
use crate::vip::Message;

/// Handler for every envelope addressed to one subsystem.
pub type SubsystemHandler =
    Arc<dyn Fn(Arc<Core>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure into a [`SubsystemHandler`].
pub fn subsystem_handler<F, Fut>(f: F) -> SubsystemHandler
where
    F: Fn(Arc<Core>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |core, message| -> BoxFuture<'static, Result<()>> { Box::pin(f(core, message)) })
}

/// Name to handler map. Registering a name twice replaces the earlier
/// handler (last writer wins).
#[derive(Default)]
pub struct SubsystemRegistry {
    handlers: RwLock<HashMap<String, SubsystemHandler>>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under `name`, returning the handler it replaced.
    pub fn register(&self, name: &str, handler: SubsystemHandler) -> Option<SubsystemHandler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler)
    }

    pub fn get(&self, name: &str) -> Option<SubsystemHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SubsystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> SubsystemHandler {
        subsystem_handler(|_core, _msg| async { Ok(()) })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SubsystemRegistry::new();
        assert!(registry.register("RPC", noop()).is_none());
        assert!(registry.contains("RPC"));
        assert!(registry.get("RPC").is_some());
        assert!(registry.get("pubsub").is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = SubsystemRegistry::new();
        let first = noop();
        let second = noop();
        registry.register("pubsub", Arc::clone(&first));
        let replaced = registry.register("pubsub", Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.get("pubsub").unwrap(), &second));
        assert_eq!(registry.names(), vec!["pubsub".to_string()]);
    }

    #[test]
    fn test_names_sorted() {
        let registry = SubsystemRegistry::new();
        registry.register("pubsub", noop());
        registry.register("error", noop());
        registry.register("RPC", noop());
        assert_eq!(registry.names(), vec!["RPC", "error", "pubsub"]);
    }
}
