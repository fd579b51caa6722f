//! Registry error types

use selkie_core::Error;
use thiserror::Error;

/// Result type alias for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Registry-specific errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No live server is available to host an activation
    #[error("no live servers available for placement")]
    NoServersAvailable,

    #[error("actor not found: {actor_id}")]
    ActorNotFound { actor_id: String },

    #[error("actor already exists: {actor_id}")]
    ActorAlreadyExists { actor_id: String },

    #[error("module not found: {namespace}/{module_id}")]
    ModuleNotFound {
        namespace: String,
        module_id: String,
    },

    /// Modules are immutable once registered under a given ID
    #[error("module already exists: {namespace}/{module_id}")]
    ModuleAlreadyExists {
        namespace: String,
        module_id: String,
    },

    #[error("server not found: {server_id}")]
    ServerNotFound { server_id: String },

    /// Connectivity failure talking to a remote registry
    #[error("registry transport error: {reason}")]
    Transport { reason: String },

    /// A remote registry answered with a non-200 status
    #[error("remote registry error (status {status}): {body}")]
    Remote { status: u16, body: String },

    #[error("internal registry error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    pub fn actor_not_found(actor_id: impl std::fmt::Display) -> Self {
        Self::ActorNotFound {
            actor_id: actor_id.to_string(),
        }
    }

    pub fn module_not_found(namespace: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            namespace: namespace.into(),
            module_id: module_id.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the operation before the request deadline could
    /// succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Remote { .. } | Self::NoServersAvailable
        )
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ActorNotFound { actor_id } => Error::ActorNotFound { actor_id },
            RegistryError::ModuleNotFound {
                namespace,
                module_id,
            } => Error::ModuleNotFound {
                namespace,
                module_id,
            },
            other if other.is_transient() => Error::RegistryTransient {
                reason: other.to_string(),
            },
            other => Error::Internal {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RegistryError::transport("connection refused").is_transient());
        assert!(RegistryError::NoServersAvailable.is_transient());
        assert!(!RegistryError::actor_not_found("ns::a").is_transient());
    }

    #[test]
    fn test_conversion_to_core_error() {
        let err: Error = RegistryError::transport("timeout").into();
        assert!(matches!(err, Error::RegistryTransient { .. }));

        let err: Error = RegistryError::actor_not_found("ns::a").into();
        assert!(matches!(err, Error::ActorNotFound { .. }));

        let err: Error = RegistryError::internal("corrupt record").into();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
