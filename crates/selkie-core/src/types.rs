//! Identities and placement types
//!
//! Everything here is shared vocabulary between the registry, the per-server
//! runtime, and the HTTP surface: validated identifiers, the ephemeral
//! actor reference handed out by `ensure_activation`, and the load snapshot
//! carried by heartbeats.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

// =============================================================================
// ActorId
// =============================================================================

/// Unique identifier for an actor
///
/// Actor IDs consist of a namespace and an id; the pair is the actor's
/// stable, cluster-wide identity. Immutable after creation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActorId {
    namespace: String,
    id: String,
}

fn valid_identifier_chars(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl ActorId {
    /// Create a new ActorId with validation
    ///
    /// # Errors
    /// Returns error if namespace or id is empty, exceeds length limits, or
    /// contains invalid characters.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let id = id.into();

        if namespace.is_empty() || id.is_empty() {
            return Err(Error::InvalidIdentity {
                id: format!("{}::{}", namespace, id),
                reason: "namespace and actor id must not be empty".into(),
            });
        }

        if namespace.len() > NAMESPACE_LENGTH_BYTES_MAX {
            return Err(Error::InvalidIdentity {
                id: format!("{}::{}", namespace, id),
                reason: format!(
                    "namespace length {} exceeds limit {}",
                    namespace.len(),
                    NAMESPACE_LENGTH_BYTES_MAX
                ),
            });
        }

        if id.len() > ACTOR_ID_LENGTH_BYTES_MAX {
            return Err(Error::InvalidIdentity {
                id: format!("{}::{}", namespace, id),
                reason: format!(
                    "actor id length {} exceeds limit {}",
                    id.len(),
                    ACTOR_ID_LENGTH_BYTES_MAX
                ),
            });
        }

        if !valid_identifier_chars(&namespace) || !valid_identifier_chars(&id) {
            return Err(Error::InvalidIdentity {
                id: format!("{}::{}", namespace, id),
                reason: "identifier contains invalid characters".into(),
            });
        }

        Ok(Self { namespace, id })
    }

    /// Get the namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the fully qualified name (`namespace::id`)
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.namespace, self.id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.id)
    }
}

// =============================================================================
// ServerId
// =============================================================================

/// Unique identifier for a cluster server
///
/// Server IDs must be globally unique within the cluster. They should be
/// stable across restarts for the same physical server, typically derived
/// from hostname or configured explicitly.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    /// Create a new ServerId with validation
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidIdentity {
                id,
                reason: "server ID cannot be empty".into(),
            });
        }

        if id.len() > SERVER_ID_LENGTH_BYTES_MAX {
            return Err(Error::InvalidIdentity {
                reason: format!(
                    "server ID length {} exceeds limit {}",
                    id.len(),
                    SERVER_ID_LENGTH_BYTES_MAX
                ),
                id,
            });
        }

        if !valid_identifier_chars(&id) {
            return Err(Error::InvalidIdentity {
                id,
                reason: "server ID contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    /// Get the server ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a unique server ID from the hostname and a random suffix
    pub fn generate() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let suffix: u32 = rand::random();
        let id = format!("{}-{:08x}", hostname, suffix);

        let truncated = if id.len() > SERVER_ID_LENGTH_BYTES_MAX {
            id[..SERVER_ID_LENGTH_BYTES_MAX].to_string()
        } else {
            id
        };

        Self(truncated)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// ActorReference
// =============================================================================

/// How an actor reference should be dispatched
///
/// Closed set; the router dispatches by kind with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// The activation lives on the calling server
    Local,
    /// The activation lives on a peer, reachable over HTTP
    RemoteHttp,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::RemoteHttp => write!(f, "remote_http"),
        }
    }
}

/// Ephemeral reference to an actor's current activation
///
/// Returned by `ensure_activation`; names the owning server and carries the
/// fencing `generation` the owning server must honor. Never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorReference {
    /// The actor's identity
    pub actor_id: ActorId,
    /// The module backing the actor
    pub module_id: String,
    /// The server currently assigned the activation
    pub server_id: ServerId,
    /// The assigned server's invocation address
    pub address: SocketAddr,
    /// Fencing token; increases on every reassignment
    pub generation: u64,
    /// Dispatch kind
    pub kind: ReferenceKind,
}

impl ActorReference {
    /// Rewrite the dispatch kind relative to the observing server.
    ///
    /// The registry does not know who is asking; the router localizes the
    /// reference before dispatching.
    pub fn localized_for(mut self, observer: &ServerId) -> Self {
        self.kind = if &self.server_id == observer {
            ReferenceKind::Local
        } else {
            ReferenceKind::RemoteHttp
        };
        self
    }
}

// =============================================================================
// Load Reporting
// =============================================================================

/// Memory attributed to one resident actor, as reported by heartbeats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorMemory {
    pub actor_id: ActorId,
    pub memory_bytes: u64,
}

/// A server's load report, carried by every heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// Number of actors currently activated on the server
    pub num_activated_actors: u64,
    /// Total memory attributed to activations, in bytes
    pub used_memory_bytes: u64,
    /// Per-actor memory, when the modules expose it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_actor_memory: Vec<ActorMemory>,
}

/// A registry-side view of one server, included in heartbeat results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub server_id: ServerId,
    pub address: SocketAddr,
    pub num_activated_actors: u64,
    pub used_memory_bytes: u64,
}

/// What the registry tells a server in response to a heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    /// The memory budget this server should stay under; exceeding it makes
    /// the server shed its lowest-memory activation via blacklisting
    pub memory_usage_limit_bytes: u64,
    /// Optional snapshot of the known cluster membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerSnapshot>>,
}

// =============================================================================
// Registry Operation Inputs / Results
// =============================================================================

/// Request to resolve (and, if needed, place) an actor's activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureActivationRequest {
    pub actor_id: ActorId,
    /// When set, the actor record is created on first invocation with this
    /// module; when absent, unknown actors are an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

impl EnsureActivationRequest {
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            module_id: None,
        }
    }

    /// Allow implicit creation of the actor record with the given module
    pub fn create_if_not_exist(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }
}

/// Options for module registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleOptions {}

/// Options for actor creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorOptions {}

/// Result of registering a module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModuleResult {
    pub namespace: String,
    pub module_id: String,
    pub size_bytes: usize,
}

/// Result of creating an actor record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActorResult {
    pub namespace: String,
    pub actor_id: String,
    pub module_id: String,
}

// =============================================================================
// Base64 Payload Encoding
// =============================================================================

/// Serde helper for binary payloads embedded in JSON wire types.
///
/// The wire format carries payloads as base64 strings; in memory they stay
/// `bytes::Bytes`.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_actor_id_valid() {
        let id = ActorId::new("orders", "order-123").unwrap();
        assert_eq!(id.namespace(), "orders");
        assert_eq!(id.id(), "order-123");
        assert_eq!(id.qualified_name(), "orders::order-123");
        assert_eq!(format!("{}", id), "orders::order-123");
    }

    #[test]
    fn test_actor_id_invalid() {
        assert!(ActorId::new("", "a").is_err());
        assert!(ActorId::new("ns", "").is_err());
        assert!(ActorId::new("ns", "actor/123").is_err());
        assert!(ActorId::new("ns", "a".repeat(ACTOR_ID_LENGTH_BYTES_MAX + 1)).is_err());
    }

    #[test]
    fn test_server_id_valid() {
        let id = ServerId::new("server-1").unwrap();
        assert_eq!(id.as_str(), "server-1");
    }

    #[test]
    fn test_server_id_invalid() {
        assert!(ServerId::new("").is_err());
        assert!(ServerId::new("server 1").is_err());
        assert!(ServerId::new("s".repeat(SERVER_ID_LENGTH_BYTES_MAX + 1)).is_err());
    }

    #[test]
    fn test_server_id_generate_unique() {
        let a = ServerId::generate();
        let b = ServerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().len() <= SERVER_ID_LENGTH_BYTES_MAX);
    }

    #[test]
    fn test_reference_localized_for() {
        let reference = ActorReference {
            actor_id: ActorId::new("ns", "a").unwrap(),
            module_id: "m".into(),
            server_id: ServerId::new("server-1").unwrap(),
            address: test_addr(9000),
            generation: 3,
            kind: ReferenceKind::RemoteHttp,
        };

        let local = reference
            .clone()
            .localized_for(&ServerId::new("server-1").unwrap());
        assert_eq!(local.kind, ReferenceKind::Local);

        let remote = reference.localized_for(&ServerId::new("server-2").unwrap());
        assert_eq!(remote.kind, ReferenceKind::RemoteHttp);
    }

    #[test]
    fn test_reference_serde_roundtrip() {
        let reference = ActorReference {
            actor_id: ActorId::new("ns", "a").unwrap(),
            module_id: "m".into(),
            server_id: ServerId::new("server-1").unwrap(),
            address: test_addr(9000),
            generation: 7,
            kind: ReferenceKind::Local,
        };

        let json = serde_json::to_string(&reference).unwrap();
        let decoded: ActorReference = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.generation, 7);
        assert_eq!(decoded.kind, ReferenceKind::Local);
        assert_eq!(decoded.actor_id, reference.actor_id);
    }

    #[test]
    fn test_b64_payload_roundtrip() {
        use bytes::Bytes;

        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "b64")]
            payload: Bytes,
        }

        let w = Wrapper {
            payload: Bytes::from_static(&[0u8, 1, 2, 255]),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("AAEC/w=="));
        let decoded: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.payload, w.payload);
    }
}
