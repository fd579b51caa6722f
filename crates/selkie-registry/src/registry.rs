//! The registry contract
//!
//! One trait, multiple backends. Every placement decision in the cluster
//! flows through `ensure_activation`; every liveness observation flows
//! through `heartbeat`.

use crate::error::RegistryResult;
use async_trait::async_trait;
use bytes::Bytes;
use selkie_core::{
    ActorId, ActorOptions, ActorReference, CreateActorResult, EnsureActivationRequest,
    HeartbeatResult, LoadSnapshot, ModuleOptions, RegisterModuleResult, ServerId,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Cluster-wide mapping of actors to servers, and server liveness.
///
/// # Guarantees
/// - For each actor, at most one activation record exists at a time, and
///   its `generation` is monotonic across reassignments.
/// - `ensure_activation` only returns references naming servers that were
///   alive at decision time.
///
/// All operations are retriable until the caller's request deadline;
/// remote-backed implementations retry transient transport failures
/// internally, everything else surfaces on the first attempt.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Record a liveness-and-load report for a server.
    ///
    /// The first heartbeat self-registers the server. A server whose last
    /// heartbeat is older than the TTL is excluded from placement.
    async fn heartbeat(
        &self,
        server_id: &ServerId,
        address: SocketAddr,
        load: LoadSnapshot,
    ) -> RegistryResult<HeartbeatResult>;

    /// Resolve the actor's current activation, placing it if needed.
    ///
    /// Returns at least one reference on success; callers use the first and
    /// fall back to the rest on transport failure. A fresh placement writes
    /// `generation := prev + 1` (or 0 for the first placement ever).
    ///
    /// Fails only when no live server exists (or the actor is unknown and
    /// the request carries no module for implicit creation).
    async fn ensure_activation(
        &self,
        req: EnsureActivationRequest,
    ) -> RegistryResult<Vec<ActorReference>>;

    /// Register an immutable module under `(namespace, module_id)`.
    async fn register_module(
        &self,
        namespace: &str,
        module_id: &str,
        module_bytes: Bytes,
        options: ModuleOptions,
    ) -> RegistryResult<RegisterModuleResult>;

    /// Fetch a registered module's bytes and options.
    async fn get_module(
        &self,
        namespace: &str,
        module_id: &str,
    ) -> RegistryResult<Option<(Bytes, ModuleOptions)>>;

    /// Create an actor record bound to a registered module.
    async fn create_actor(
        &self,
        namespace: &str,
        actor_id: &str,
        module_id: &str,
        options: ActorOptions,
    ) -> RegistryResult<CreateActorResult>;

    /// Read a key from the actor's durable KV.
    async fn actor_kv_get(&self, actor_id: &ActorId, key: &[u8]) -> RegistryResult<Option<Bytes>>;

    /// Write a key into the actor's durable KV.
    async fn actor_kv_put(
        &self,
        actor_id: &ActorId,
        key: Bytes,
        value: Bytes,
    ) -> RegistryResult<()>;

    /// Avoid placing `actor_id` on `server_id` for the given duration.
    ///
    /// Called by the invocation router when a server answers 410. If the
    /// actor's current activation names the blacklisted server, the next
    /// `ensure_activation` reassigns it elsewhere with a bumped generation.
    async fn blacklist_server(
        &self,
        server_id: &ServerId,
        actor_id: &ActorId,
        for_duration: Duration,
    ) -> RegistryResult<()>;

    /// Graceful departure: forget the server immediately rather than
    /// waiting out the heartbeat TTL. Backends without a notion of
    /// departure keep the default no-op.
    async fn leave(&self, _server_id: &ServerId) -> RegistryResult<()> {
        Ok(())
    }
}
