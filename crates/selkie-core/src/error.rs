//! Error types for Selkie
//!
//! Every error kind carries enough context to be logged with the server ID,
//! actor identity, and operation it occurred under. Kinds map onto wire
//! status codes in exactly one place (`http_status` / `from_remote_status`)
//! so servers and clients cannot drift apart.

use thiserror::Error;

/// Result type alias for Selkie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selkie error kinds
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Connectivity or timeout talking to the registry. Retriable until the
    /// request deadline, surfaced as 500 when exhausted.
    #[error("transient registry error: {reason}")]
    RegistryTransient { reason: String },

    /// The registry returned malformed state (e.g. zero references on
    /// success). Fatal to the request, never retried.
    #[error("registry invariant violated: {reason}")]
    RegistryInvariant { reason: String },

    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// The selected server refuses this actor right now (wire status 410).
    #[error("activation blacklisted on server {server_id}")]
    BlacklistedActivation { server_id: String },

    /// Transport failure calling a peer. The router tries the next
    /// reference, if any.
    #[error("remote transport error: {reason}")]
    RemoteTransport { reason: String },

    /// A peer answered with a non-200, non-410 status. Not retried.
    #[error("remote invocation failed with status {status}: {reason}")]
    RemoteStatus { status: u16, reason: String },

    /// An invocation reached a server that does not own the reference.
    #[error("request for server {expected} received by server {received}")]
    WrongServer { expected: String, received: String },

    /// A reference carried a kind this server cannot dispatch.
    #[error("unhandled reference kind: {kind}")]
    UnsupportedReference { kind: String },

    // =========================================================================
    // Actor Errors
    // =========================================================================
    /// The actor's user code returned an error. Passed through verbatim.
    #[error("actor error: {reason}")]
    ActorUser { reason: String },

    #[error("actor not found: {actor_id}")]
    ActorNotFound { actor_id: String },

    #[error("module not found: {namespace}/{module_id}")]
    ModuleNotFound {
        namespace: String,
        module_id: String,
    },

    #[error("unknown host function: {name}")]
    UnknownHostFunction { name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid identifier: {id}, reason: {reason}")]
    InvalidIdentity { id: String, reason: String },

    #[error("payload too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("malformed host call payload: {reason}")]
    MalformedPayload { reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("operation {operation} timed out after {timeout_ms}ms")]
    OperationTimedOut { operation: String, timeout_ms: u64 },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create a transient registry error
    pub fn registry_transient(reason: impl Into<String>) -> Self {
        Self::RegistryTransient {
            reason: reason.into(),
        }
    }

    /// Create a registry invariant error
    pub fn registry_invariant(reason: impl Into<String>) -> Self {
        Self::RegistryInvariant {
            reason: reason.into(),
        }
    }

    /// Create an actor user error
    pub fn actor_user(reason: impl Into<String>) -> Self {
        Self::ActorUser {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Check whether this error is a blacklisted activation
    pub fn is_blacklisted(&self) -> bool {
        matches!(self, Self::BlacklistedActivation { .. })
    }

    /// Check whether the router may retry this error against another
    /// reference for the same actor
    pub fn is_retriable_transport(&self) -> bool {
        matches!(self, Self::RemoteTransport { .. })
    }

    /// The wire status code for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BlacklistedActivation { .. } => 410,
            _ => 500,
        }
    }

    /// Reconstruct a typed error from a peer's response status and body.
    ///
    /// `server_id` identifies the peer that produced the response; it is
    /// attached to blacklist errors so the router can report the offending
    /// server back to the registry.
    pub fn from_remote_status(status: u16, server_id: &str, body: String) -> Self {
        match status {
            410 => Self::BlacklistedActivation {
                server_id: server_id.to_string(),
            },
            _ => Self::RemoteStatus {
                status,
                reason: body,
            },
        }
    }
}
