//! Remote invocation client
//!
//! Forwards invocations to the peer named by a reference and reconstructs
//! typed errors from the wire status (410 in particular).

use bytes::Bytes;
use selkie_core::types::b64;
use selkie_core::{ActorId, ActorReference, Error, Result, ServerId, INVOKE_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Wire body for peer-to-peer forwards (`/api/v1/invoke-direct`).
///
/// Carries the resolved reference so the receiving server can verify
/// ownership and fence by generation without re-resolving placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeDirectRequest {
    pub server_id: ServerId,
    pub actor_id: ActorId,
    pub module_id: String,
    pub generation: u64,
    pub operation: String,
    #[serde(default = "Bytes::new", with = "b64")]
    pub payload: Bytes,
}

/// HTTP client for forwarding invocations to peer servers.
pub struct RemoteClient {
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(INVOKE_TIMEOUT_MS))
            .build()
            .map_err(|e| Error::internal(format!("building remote client: {}", e)))?;
        Ok(Self { http })
    }

    /// Forward one invocation to the server the reference names.
    pub async fn invoke(
        &self,
        reference: &ActorReference,
        operation: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let url = format!("http://{}/api/v1/invoke-direct", reference.address);
        let request = InvokeDirectRequest {
            server_id: reference.server_id.clone(),
            actor_id: reference.actor_id.clone(),
            module_id: reference.module_id.clone(),
            generation: reference.generation,
            operation: operation.to_string(),
            payload,
        };

        debug!(
            actor_id = %reference.actor_id,
            server_id = %reference.server_id,
            operation = %operation,
            "forwarding invocation"
        );

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::RemoteTransport {
                reason: format!("{}: {}", reference.address, e),
            })?;

        let status = response.status().as_u16();
        if status == 200 {
            let body = response.bytes().await.map_err(|e| Error::RemoteTransport {
                reason: format!("{}: reading body: {}", reference.address, e),
            })?;
            Ok(body)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::from_remote_status(
                status,
                reference.server_id.as_str(),
                body,
            ))
        }
    }
}
