//! Leader-forwarded registry backend
//!
//! Every process in the cluster runs a registry replica and a client; the
//! client forwards all operations over HTTP to whichever address the
//! [`LeaderProvider`] currently names. Leader election itself is external;
//! the provider is the only coupling point.

use crate::error::{RegistryError, RegistryResult};
use crate::memory::{MemoryRegistry, MemoryRegistryOptions};
use crate::registry::Registry;
use crate::service::registry_router;
use crate::wire::*;
use async_trait::async_trait;
use bytes::Bytes;
use selkie_core::{
    ActorId, ActorOptions, ActorReference, CreateActorResult, EnsureActivationRequest,
    HeartbeatResult, LoadSnapshot, ModuleOptions, RegisterModuleResult, ServerId,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Attempts per forwarded operation before surfacing a transport error
const FORWARD_ATTEMPTS_MAX: u32 = 3;

/// Delay between forwarding attempts
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Names the current leader's registry service address.
///
/// Implementations wrap whatever election mechanism the deployment uses
/// (static configuration, an external lock service, ...).
pub trait LeaderProvider: Send + Sync + 'static {
    fn leader(&self) -> RegistryResult<SocketAddr>;
}

/// A provider backed by a mutable, explicitly-set address.
///
/// Useful for tests and static deployments.
pub struct FixedLeaderProvider {
    leader: Mutex<SocketAddr>,
}

impl FixedLeaderProvider {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            leader: Mutex::new(addr),
        }
    }

    pub fn set_leader(&self, addr: SocketAddr) {
        *self.leader.lock().unwrap() = addr;
    }
}

impl LeaderProvider for FixedLeaderProvider {
    fn leader(&self) -> RegistryResult<SocketAddr> {
        Ok(*self.leader.lock().unwrap())
    }
}

/// Registry backend that forwards all operations to the leader.
///
/// Also serves a registry replica of its own, so that when the provider
/// names this process, peers (and this process itself) land on it.
pub struct LeaderRegistry {
    provider: Arc<dyn LeaderProvider>,
    http: reqwest::Client,
    local_addr: SocketAddr,
    server_task: tokio::task::JoinHandle<()>,
}

impl LeaderRegistry {
    /// Serve a registry replica on `bind_addr` and forward operations to
    /// the provider's leader.
    pub async fn bind(
        provider: Arc<dyn LeaderProvider>,
        bind_addr: SocketAddr,
        options: MemoryRegistryOptions,
    ) -> RegistryResult<Self> {
        let replica: Arc<dyn Registry> = Arc::new(MemoryRegistry::with_options(options));
        let router = registry_router(replica);

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RegistryError::transport(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RegistryError::transport(e.to_string()))?;

        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "registry service terminated");
            }
        });

        info!(addr = %local_addr, "registry replica listening");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RegistryError::transport(e.to_string()))?;

        Ok(Self {
            provider,
            http,
            local_addr,
            server_task,
        })
    }

    /// The address this process's registry replica listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Forward one operation to the leader. Transient transport failures
    /// are retried a few times here; the caller's deadline bounds the
    /// overall attempt.
    async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> RegistryResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut last_err = None;
        for attempt in 0..FORWARD_ATTEMPTS_MAX {
            if attempt > 0 {
                tokio::time::sleep(FORWARD_RETRY_DELAY).await;
            }
            match self.call_once(operation, request).await {
                Err(RegistryError::Transport { reason }) => {
                    warn!(operation, attempt, reason = %reason, "registry forward failed");
                    last_err = Some(RegistryError::Transport { reason });
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| RegistryError::transport("forwarding failed")))
    }

    async fn call_once<Req, Resp>(&self, operation: &str, request: &Req) -> RegistryResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let leader = self.provider.leader()?;
        let url = format!("http://{}/api/v1/registry/{}", leader, operation);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RegistryError::transport(format!("{}: {}", operation, e)))?;

        let status = response.status().as_u16();
        if status == 200 {
            response
                .json::<Resp>()
                .await
                .map_err(|e| RegistryError::transport(format!("{}: decode: {}", operation, e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error_body) => Err(error_body.into_error(status)),
                Err(_) => Err(RegistryError::Remote { status, body }),
            }
        }
    }
}

impl Drop for LeaderRegistry {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

#[async_trait]
impl Registry for LeaderRegistry {
    async fn heartbeat(
        &self,
        server_id: &ServerId,
        address: SocketAddr,
        load: LoadSnapshot,
    ) -> RegistryResult<HeartbeatResult> {
        self.call(
            "heartbeat",
            &HeartbeatRequest {
                server_id: server_id.clone(),
                address,
                load,
            },
        )
        .await
    }

    async fn ensure_activation(
        &self,
        req: EnsureActivationRequest,
    ) -> RegistryResult<Vec<ActorReference>> {
        let response: EnsureActivationResponse = self.call("ensure-activation", &req).await?;
        Ok(response.references)
    }

    async fn register_module(
        &self,
        namespace: &str,
        module_id: &str,
        module_bytes: Bytes,
        options: ModuleOptions,
    ) -> RegistryResult<RegisterModuleResult> {
        self.call(
            "register-module",
            &RegisterModuleRequest {
                namespace: namespace.to_string(),
                module_id: module_id.to_string(),
                module_bytes,
                options,
            },
        )
        .await
    }

    async fn get_module(
        &self,
        namespace: &str,
        module_id: &str,
    ) -> RegistryResult<Option<(Bytes, ModuleOptions)>> {
        let response: GetModuleResponse = self
            .call(
                "get-module",
                &GetModuleRequest {
                    namespace: namespace.to_string(),
                    module_id: module_id.to_string(),
                },
            )
            .await?;

        Ok(response
            .module_bytes
            .map(|bytes| (bytes, response.options.unwrap_or_default())))
    }

    async fn create_actor(
        &self,
        namespace: &str,
        actor_id: &str,
        module_id: &str,
        options: ActorOptions,
    ) -> RegistryResult<CreateActorResult> {
        self.call(
            "create-actor",
            &CreateActorRegistryRequest {
                namespace: namespace.to_string(),
                actor_id: actor_id.to_string(),
                module_id: module_id.to_string(),
                options,
            },
        )
        .await
    }

    async fn actor_kv_get(&self, actor_id: &ActorId, key: &[u8]) -> RegistryResult<Option<Bytes>> {
        let response: KvGetResponse = self
            .call(
                "kv-get",
                &KvGetRequest {
                    actor_id: actor_id.clone(),
                    key: Bytes::copy_from_slice(key),
                },
            )
            .await?;
        Ok(response.value)
    }

    async fn actor_kv_put(
        &self,
        actor_id: &ActorId,
        key: Bytes,
        value: Bytes,
    ) -> RegistryResult<()> {
        let _: Ack = self
            .call(
                "kv-put",
                &KvPutRequest {
                    actor_id: actor_id.clone(),
                    key,
                    value,
                },
            )
            .await?;
        Ok(())
    }

    async fn blacklist_server(
        &self,
        server_id: &ServerId,
        actor_id: &ActorId,
        for_duration: Duration,
    ) -> RegistryResult<()> {
        let _: Ack = self
            .call(
                "blacklist-server",
                &BlacklistServerRequest {
                    server_id: server_id.clone(),
                    actor_id: actor_id.clone(),
                    for_millis: for_duration.as_millis() as u64,
                },
            )
            .await?;
        Ok(())
    }

    async fn leave(&self, server_id: &ServerId) -> RegistryResult<()> {
        let _: Ack = self
            .call(
                "leave",
                &LeaveRequest {
                    server_id: server_id.clone(),
                },
            )
            .await?;
        Ok(())
    }
}
