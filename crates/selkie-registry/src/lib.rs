//! Selkie Registry
//!
//! Cluster source of truth for the Selkie virtual actor runtime.
//!
//! # Overview
//!
//! The registry provides:
//! - Actor-to-server placement with a monotonic `generation` fencing token
//! - Heartbeat-based server liveness (a server is alive while its last
//!   heartbeat is younger than the TTL)
//! - The placement balancer that reads load snapshots and spreads
//!   activations across live servers
//! - Per-actor blacklist bookkeeping driving re-routing after a 410
//! - Module records and per-actor KV
//!
//! Two implementations share one contract: [`MemoryRegistry`] keeps all
//! state in a single process; [`LeaderRegistry`] forwards every operation
//! over HTTP to the leader named by a [`LeaderProvider`], and can mount a
//! registry service of its own for when this process is the leader.

mod error;
mod leader;
mod memory;
mod registry;
mod service;
mod wire;

pub use error::{RegistryError, RegistryResult};
pub use leader::{FixedLeaderProvider, LeaderProvider, LeaderRegistry};
pub use memory::{MemoryRegistry, MemoryRegistryOptions};
pub use registry::Registry;
pub use service::registry_router;
