//! JSON wire types for the registry service
//!
//! These mirror the [`Registry`](crate::Registry) trait one request type
//! per operation, so the leader-forwarded client and the service handlers
//! cannot disagree about shapes.

use bytes::Bytes;
use selkie_core::types::b64;
use selkie_core::{ActorId, ActorOptions, ActorReference, LoadSnapshot, ModuleOptions, ServerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Serde helper for optional binary values carried as base64 strings
pub mod b64opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub server_id: ServerId,
    pub address: SocketAddr,
    pub load: LoadSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureActivationResponse {
    pub references: Vec<ActorReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModuleRequest {
    pub namespace: String,
    pub module_id: String,
    #[serde(with = "b64")]
    pub module_bytes: Bytes,
    #[serde(default)]
    pub options: ModuleOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetModuleRequest {
    pub namespace: String,
    pub module_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetModuleResponse {
    #[serde(default, with = "b64opt")]
    pub module_bytes: Option<Bytes>,
    #[serde(default)]
    pub options: Option<ModuleOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActorRegistryRequest {
    pub namespace: String,
    pub actor_id: String,
    pub module_id: String,
    #[serde(default)]
    pub options: ActorOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetRequest {
    pub actor_id: ActorId,
    #[serde(with = "b64")]
    pub key: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetResponse {
    #[serde(default, with = "b64opt")]
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvPutRequest {
    pub actor_id: ActorId,
    #[serde(with = "b64")]
    pub key: Bytes,
    #[serde(with = "b64")]
    pub value: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistServerRequest {
    pub server_id: ServerId,
    pub actor_id: ActorId,
    pub for_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub server_id: ServerId,
}

/// Empty acknowledgement body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {}

/// Typed error body so clients can reconstruct the registry error.
///
/// The raw identifiers travel in their own fields; `message` is the
/// rendered text and is only ever shown, never parsed back into fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &crate::RegistryError) -> Self {
        use crate::RegistryError::*;

        let mut body = Self {
            kind: String::new(),
            message: err.to_string(),
            namespace: None,
            actor_id: None,
            module_id: None,
            server_id: None,
        };

        body.kind = match err {
            NoServersAvailable => "no_servers_available",
            ActorNotFound { actor_id } => {
                body.actor_id = Some(actor_id.clone());
                "actor_not_found"
            }
            ActorAlreadyExists { actor_id } => {
                body.actor_id = Some(actor_id.clone());
                "actor_already_exists"
            }
            ModuleNotFound {
                namespace,
                module_id,
            } => {
                body.namespace = Some(namespace.clone());
                body.module_id = Some(module_id.clone());
                "module_not_found"
            }
            ModuleAlreadyExists {
                namespace,
                module_id,
            } => {
                body.namespace = Some(namespace.clone());
                body.module_id = Some(module_id.clone());
                "module_already_exists"
            }
            ServerNotFound { server_id } => {
                body.server_id = Some(server_id.clone());
                "server_not_found"
            }
            Transport { .. } | Remote { .. } => "transport",
            Internal { .. } => "internal",
        }
        .to_string();

        body
    }

    /// Reconstruct the original variant on the client side; unknown kinds
    /// fall back to the raw remote status.
    pub fn into_error(self, status: u16) -> crate::RegistryError {
        use crate::RegistryError;
        match self.kind.as_str() {
            "no_servers_available" => RegistryError::NoServersAvailable,
            "actor_not_found" => RegistryError::ActorNotFound {
                actor_id: self.actor_id.unwrap_or_default(),
            },
            "actor_already_exists" => RegistryError::ActorAlreadyExists {
                actor_id: self.actor_id.unwrap_or_default(),
            },
            "module_not_found" => RegistryError::ModuleNotFound {
                namespace: self.namespace.unwrap_or_default(),
                module_id: self.module_id.unwrap_or_default(),
            },
            "module_already_exists" => RegistryError::ModuleAlreadyExists {
                namespace: self.namespace.unwrap_or_default(),
                module_id: self.module_id.unwrap_or_default(),
            },
            "server_not_found" => RegistryError::ServerNotFound {
                server_id: self.server_id.unwrap_or_default(),
            },
            "internal" => RegistryError::Internal {
                message: self.message,
            },
            _ => RegistryError::Remote {
                status,
                body: self.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_get_response_absent_value() {
        let json = serde_json::to_string(&KvGetResponse { value: None }).unwrap();
        let decoded: KvGetResponse = serde_json::from_str(&json).unwrap();
        assert!(decoded.value.is_none());

        // Absent field deserializes the same as an explicit null.
        let decoded: KvGetResponse = serde_json::from_str("{}").unwrap();
        assert!(decoded.value.is_none());
    }

    #[test]
    fn test_register_module_request_roundtrip() {
        let req = RegisterModuleRequest {
            namespace: "ns".into(),
            module_id: "m".into(),
            module_bytes: Bytes::from_static(&[1, 2, 3]),
            options: ModuleOptions::default(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let decoded: RegisterModuleRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.module_bytes, req.module_bytes);
    }

    fn roundtrip(err: &crate::RegistryError, status: u16) -> crate::RegistryError {
        let json = serde_json::to_string(&ErrorBody::from_error(err)).unwrap();
        let decoded: ErrorBody = serde_json::from_str(&json).unwrap();
        decoded.into_error(status)
    }

    #[test]
    fn test_error_body_preserves_actor_id() {
        use crate::RegistryError;

        let err = RegistryError::ActorNotFound {
            actor_id: "ns::actor-7".into(),
        };
        match roundtrip(&err, 404) {
            // The raw identifier, not the rendered message.
            RegistryError::ActorNotFound { actor_id } => assert_eq!(actor_id, "ns::actor-7"),
            other => panic!("unexpected error: {}", other),
        }

        let err = RegistryError::ActorAlreadyExists {
            actor_id: "ns::actor-7".into(),
        };
        match roundtrip(&err, 409) {
            RegistryError::ActorAlreadyExists { actor_id } => assert_eq!(actor_id, "ns::actor-7"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_error_body_preserves_module_namespace() {
        use crate::RegistryError;

        let err = RegistryError::ModuleNotFound {
            namespace: "ns".into(),
            module_id: "mod-1".into(),
        };
        match roundtrip(&err, 404) {
            RegistryError::ModuleNotFound {
                namespace,
                module_id,
            } => {
                assert_eq!(namespace, "ns");
                assert_eq!(module_id, "mod-1");
            }
            other => panic!("unexpected error: {}", other),
        }

        let err = RegistryError::ModuleAlreadyExists {
            namespace: "ns".into(),
            module_id: "mod-1".into(),
        };
        match roundtrip(&err, 409) {
            RegistryError::ModuleAlreadyExists {
                namespace,
                module_id,
            } => {
                assert_eq!(namespace, "ns");
                assert_eq!(module_id, "mod-1");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_error_body_preserves_server_id() {
        use crate::RegistryError;

        let err = RegistryError::ServerNotFound {
            server_id: "server-3".into(),
        };
        match roundtrip(&err, 404) {
            RegistryError::ServerNotFound { server_id } => assert_eq!(server_id, "server-3"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_error_body_unknown_kind_falls_back_to_remote() {
        let body = ErrorBody {
            kind: "from_the_future".into(),
            message: "something new".into(),
            namespace: None,
            actor_id: None,
            module_id: None,
            server_id: None,
        };
        match body.into_error(500) {
            crate::RegistryError::Remote { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "something new");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
