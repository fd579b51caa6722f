//! Selkie Runtime
//!
//! The per-server half of the Selkie virtual actor runtime: the
//! [`Environment`] owns the activation cache, the invocation router, the
//! heartbeat loop, and the module store, and is the only entry point the
//! HTTP transport talks to.
//!
//! # Invocation flow
//!
//! ```text
//!   Environment::invoke_actor
//!        │
//!        ▼
//!   registry.ensure_activation ──► [ActorReference, ...]
//!        │
//!        ├─ reference is local ──► ActivationCache::invoke (serialized per actor)
//!        └─ reference is remote ─► RemoteClient ──► peer /api/v1/invoke-direct
//!                                                      │
//!                                                      ▼
//!                                            peer ActivationCache::invoke
//! ```
//!
//! A 410 from either path makes the router report the offending server to
//! the registry, drop any cached local instance, and retry once against a
//! fresh placement.

mod activations;
mod environment;
mod hostfns;
mod module;
mod remote;

pub use environment::{
    DiscoveryOptions, DiscoveryType, Environment, EnvironmentOptions, InvokeOptions,
};
pub use hostfns::{CustomHostFn, HostCapabilities};
pub use module::{
    ActorInstance, ActorModule, ModuleLoader, ModuleStore, NoopModuleStore, RegistryModuleStore,
};
pub use remote::{InvokeDirectRequest, RemoteClient};
