//! Modules and module resolution
//!
//! A module is the immutable code artifact behind a set of actors; an
//! instance is one actor's live embodiment of it. The runtime treats the
//! user-code engine as opaque: anything that can instantiate actors from a
//! `(namespace, module_id)` fits behind [`ActorModule`].

use crate::hostfns::HostCapabilities;
use async_trait::async_trait;
use bytes::Bytes;
use selkie_core::{ActorId, Error, ModuleOptions, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Actor / Module Traits
// =============================================================================

/// One live actor instance.
///
/// The activation cache guarantees `invoke` is never called concurrently
/// for the same instance, and that `__startup__` precedes and
/// `__shutdown__` follows every other operation.
#[async_trait]
pub trait ActorInstance: Send {
    /// Handle one operation. Reserved lifecycle operations arrive through
    /// here as well (`__startup__`, `__shutdown__`).
    async fn invoke(&mut self, operation: &str, payload: Bytes) -> Result<Bytes>;

    /// Memory currently attributed to this instance, if the module tracks
    /// it. Feeds the heartbeat load report and the balancer.
    fn memory_usage_bytes(&self) -> u64 {
        0
    }

    /// Release any resources held outside the instance itself.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory for actor instances of one module.
#[async_trait]
pub trait ActorModule: Send + Sync {
    async fn instantiate(
        &self,
        actor_id: &ActorId,
        host: HostCapabilities,
    ) -> Result<Box<dyn ActorInstance>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Module Stores
// =============================================================================

/// Source of module factories beyond in-process registrations.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Load a module factory, or `None` when this store does not know the
    /// module.
    async fn load(&self, namespace: &str, module_id: &str)
        -> Result<Option<Arc<dyn ActorModule>>>;
}

/// A store that knows no modules.
///
/// Used when every module is registered in-process (natively linked
/// modules, tests).
pub struct NoopModuleStore;

#[async_trait]
impl ModuleStore for NoopModuleStore {
    async fn load(
        &self,
        _namespace: &str,
        _module_id: &str,
    ) -> Result<Option<Arc<dyn ActorModule>>> {
        Ok(None)
    }
}

/// Turns registry-stored module bytes into a factory.
///
/// The engine that executes the bytes (an embedded VM, usually) lives
/// behind this trait; the runtime never interprets module bytes itself.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(
        &self,
        namespace: &str,
        module_id: &str,
        module_bytes: Bytes,
        options: ModuleOptions,
    ) -> Result<Arc<dyn ActorModule>>;
}

/// A store that sources module bytes from the registry and hands them to a
/// [`ModuleLoader`].
pub struct RegistryModuleStore {
    registry: Arc<dyn selkie_registry::Registry>,
    loader: Arc<dyn ModuleLoader>,
}

impl RegistryModuleStore {
    pub fn new(
        registry: Arc<dyn selkie_registry::Registry>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self { registry, loader }
    }
}

#[async_trait]
impl ModuleStore for RegistryModuleStore {
    async fn load(
        &self,
        namespace: &str,
        module_id: &str,
    ) -> Result<Option<Arc<dyn ActorModule>>> {
        let record = self
            .registry
            .get_module(namespace, module_id)
            .await
            .map_err(Error::from)?;

        match record {
            Some((module_bytes, options)) => {
                let module = self
                    .loader
                    .load(namespace, module_id, module_bytes, options)
                    .await?;
                Ok(Some(module))
            }
            None => Ok(None),
        }
    }
}

// =============================================================================
// Module Resolver
// =============================================================================

/// Resolves `(namespace, module_id)` to a cached module factory.
///
/// Resolution order: in-process registrations, previously-loaded factories,
/// then the backing store. Factories loaded from the store are cached for
/// the life of the environment.
pub(crate) struct ModuleResolver {
    registered: RwLock<HashMap<(String, String), Arc<dyn ActorModule>>>,
    loaded: RwLock<HashMap<(String, String), Arc<dyn ActorModule>>>,
    store: Arc<dyn ModuleStore>,
}

impl ModuleResolver {
    pub(crate) fn new(store: Arc<dyn ModuleStore>) -> Self {
        Self {
            registered: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a natively-linked module factory for this process.
    pub(crate) async fn register(
        &self,
        namespace: &str,
        module_id: &str,
        module: Arc<dyn ActorModule>,
    ) {
        let mut registered = self.registered.write().await;
        registered.insert((namespace.to_string(), module_id.to_string()), module);
    }

    pub(crate) async fn resolve(
        &self,
        namespace: &str,
        module_id: &str,
    ) -> Result<Arc<dyn ActorModule>> {
        let key = (namespace.to_string(), module_id.to_string());

        if let Some(module) = self.registered.read().await.get(&key) {
            return Ok(module.clone());
        }
        if let Some(module) = self.loaded.read().await.get(&key) {
            return Ok(module.clone());
        }

        match self.store.load(namespace, module_id).await? {
            Some(module) => {
                let mut loaded = self.loaded.write().await;
                // A racing resolve may have loaded it first; keep whichever
                // landed.
                let module = loaded.entry(key).or_insert(module).clone();
                Ok(module)
            }
            None => Err(Error::ModuleNotFound {
                namespace: namespace.to_string(),
                module_id: module_id.to_string(),
            }),
        }
    }

    pub(crate) async fn close(&self) {
        let registered: Vec<_> = self.registered.write().await.drain().collect();
        let loaded: Vec<_> = self.loaded.write().await.drain().collect();
        for (_, module) in registered.into_iter().chain(loaded) {
            if let Err(e) = module.close().await {
                tracing::warn!(error = %e, "module close failed");
            }
        }
    }
}
