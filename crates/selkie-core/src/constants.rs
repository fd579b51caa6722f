//! Cluster-wide limits and defaults
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identity Limits
// =============================================================================

/// Maximum length of an actor ID in bytes
pub const ACTOR_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a namespace in bytes
pub const NAMESPACE_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a server ID in bytes
pub const SERVER_ID_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a module ID in bytes
pub const MODULE_ID_LENGTH_BYTES_MAX: usize = 256;

// =============================================================================
// Heartbeat
// =============================================================================

/// Interval between heartbeats in milliseconds (1 sec)
pub const HEARTBEAT_PERIOD_MS: u64 = 1000;

/// Missed-heartbeat window after which a server is considered dead (5 sec,
/// 5x the heartbeat period)
pub const HEARTBEAT_TTL_MS: u64 = 5 * HEARTBEAT_PERIOD_MS;

/// Timeout for a single heartbeat RPC in milliseconds (2 sec)
pub const HEARTBEAT_RPC_TIMEOUT_MS: u64 = 2000;

/// Heartbeat retry backoff is capped at `HEARTBEAT_PERIOD_MS` times this factor
pub const HEARTBEAT_BACKOFF_CAP_FACTOR: u64 = 4;

// =============================================================================
// Request Timeouts
// =============================================================================

/// Timeout for registry initialization in milliseconds (10 sec)
pub const REGISTRY_INIT_TIMEOUT_MS: u64 = 10_000;

/// Timeout for a single HTTP invoke in milliseconds (5 sec)
pub const INVOKE_TIMEOUT_MS: u64 = 5000;

/// Timeout for a module upload in milliseconds (60 sec)
pub const MODULE_UPLOAD_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum size of an invoke request body in bytes (16 MiB)
pub const INVOKE_BODY_BYTES_MAX: usize = 16 * 1024 * 1024;

/// Maximum size of an uploaded module in bytes (16 MiB)
pub const MODULE_SIZE_BYTES_MAX: usize = 16 * 1024 * 1024;

/// Maximum size of a create-actor request body in bytes (1 MiB)
pub const CREATE_ACTOR_BODY_BYTES_MAX: usize = 1024 * 1024;

// =============================================================================
// Activation Cache
// =============================================================================

/// Number of shards in the activation cache map
pub const ACTIVATIONS_SHARD_COUNT: usize = 64;

/// Interval between idle-GC sweeps in milliseconds (1 sec)
pub const ACTIVATION_GC_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default idle duration after which an activation is garbage collected
/// (5 min)
pub const ACTIVATION_GC_AFTER_IDLE_MS_DEFAULT: u64 = 5 * 60 * 1000;

/// Default duration a blacklisted activation stays refused on a server
/// (30 sec)
pub const BLACKLIST_DURATION_MS_DEFAULT: u64 = 30 * 1000;

// =============================================================================
// Placement
// =============================================================================

/// Default per-server memory budget used by the placement balancer (1 GiB)
pub const SERVER_MEMORY_USAGE_LIMIT_BYTES_DEFAULT: u64 = 1024 * 1024 * 1024;

/// Maximum number of servers in a cluster
pub const CLUSTER_SERVERS_COUNT_MAX: usize = 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(HEARTBEAT_TTL_MS > HEARTBEAT_PERIOD_MS);
    assert!(HEARTBEAT_RPC_TIMEOUT_MS <= HEARTBEAT_TTL_MS);
    assert!(INVOKE_BODY_BYTES_MAX == 1 << 24);
    assert!(CREATE_ACTOR_BODY_BYTES_MAX == 1 << 20);
    assert!(ACTIVATIONS_SHARD_COUNT.is_power_of_two());
};
