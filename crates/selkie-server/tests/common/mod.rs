//! Shared fixtures for server integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use selkie_core::hostcall::{SHUTDOWN_OPERATION, STARTUP_OPERATION};
use selkie_core::{ActorId, Error, Result, ServerId};
use selkie_registry::Registry;
use selkie_runtime::{
    ActorInstance, ActorModule, DiscoveryOptions, Environment, EnvironmentOptions,
    HostCapabilities, NoopModuleStore,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const NS: &str = "itest";
pub const MODULE: &str = "memory-hog-module";

/// Lifecycle counters shared between a module's instances and the test.
#[derive(Default)]
pub struct Lifecycle {
    pub startups: AtomicU64,
    pub shutdowns: AtomicU64,
    pub ticks: AtomicU64,
}

pub struct TestModule {
    pub lifecycle: Arc<Lifecycle>,
}

struct TestInstance {
    lifecycle: Arc<Lifecycle>,
    host: HostCapabilities,
    count: u64,
}

#[async_trait]
impl ActorModule for TestModule {
    async fn instantiate(
        &self,
        _actor_id: &ActorId,
        host: HostCapabilities,
    ) -> Result<Box<dyn ActorInstance>> {
        Ok(Box::new(TestInstance {
            lifecycle: self.lifecycle.clone(),
            host,
            count: 0,
        }))
    }
}

#[async_trait]
impl ActorInstance for TestInstance {
    async fn invoke(&mut self, operation: &str, payload: Bytes) -> Result<Bytes> {
        match operation {
            STARTUP_OPERATION => {
                self.lifecycle.startups.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::new())
            }
            SHUTDOWN_OPERATION => {
                self.lifecycle.shutdowns.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::new())
            }
            "keep-alive" => Ok(Bytes::new()),
            "echo" => Ok(payload),
            "inc-memory-usage" => {
                self.count += 1;
                Ok(Bytes::new())
            }
            "tick" => {
                self.lifecycle.ticks.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::new())
            }
            "schedule-tick" => {
                self.host
                    .schedule_invoke_after(Duration::from_millis(50), "", "tick", payload)
                    .await?;
                Ok(Bytes::new())
            }
            "kv-put-count" => {
                self.host
                    .kv_put(b"count", self.count.to_string().as_bytes())
                    .await?;
                Ok(Bytes::new())
            }
            other => Err(Error::actor_user(format!("unhandled operation: {}", other))),
        }
    }

    fn memory_usage_bytes(&self) -> u64 {
        self.count * 1024 * 1024
    }
}

/// One booted server: environment + HTTP surface on an ephemeral port.
pub struct Booted {
    pub env: Environment,
    pub addr: SocketAddr,
    pub lifecycle: Arc<Lifecycle>,
    server_task: tokio::task::JoinHandle<()>,
}

impl Booted {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn shutdown(self) {
        self.env.close().await;
        self.server_task.abort();
    }
}

/// Boot an environment and its HTTP server with the given registry and
/// environment tweaks.
pub async fn boot(
    server_id: &str,
    registry: Arc<dyn Registry>,
    mut options: EnvironmentOptions,
) -> Booted {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    options.discovery = DiscoveryOptions {
        port: addr.port(),
        ..options.discovery
    };

    let env = Environment::new(
        ServerId::new(server_id).unwrap(),
        registry.clone(),
        Arc::new(NoopModuleStore),
        options,
    )
    .await
    .unwrap();

    let lifecycle = Arc::new(Lifecycle::default());
    env.register_module(
        NS,
        MODULE,
        Arc::new(TestModule {
            lifecycle: lifecycle.clone(),
        }),
    )
    .await;

    let server = selkie_server::Server::new(registry, env.clone());
    let router = server.router();
    let server_task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Booted {
        env,
        addr,
        lifecycle,
        server_task,
    }
}

pub fn invoke_body(actor_id: &str, operation: &str, payload: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "namespace": NS,
        "actor_id": actor_id,
        "operation": operation,
        "payload": BASE64.encode(payload),
    })
}
