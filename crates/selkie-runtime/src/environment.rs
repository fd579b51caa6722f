//! The per-server environment
//!
//! Owns the activation cache, the invocation router, and the heartbeat
//! loop. One environment per server process; several can coexist in one
//! process for tests.

use crate::activations::ActivationCache;
use crate::hostfns::{CustomHostFn, DispatchFn, HostFnEnv};
use crate::module::{ActorModule, ModuleResolver, ModuleStore};
use crate::remote::{InvokeDirectRequest, RemoteClient};
use bytes::Bytes;
use selkie_core::{
    ActorId, ActorReference, EnsureActivationRequest, Error, LoadSnapshot, ReferenceKind, Result,
    ServerId, ACTIVATION_GC_AFTER_IDLE_MS_DEFAULT, ACTIVATION_GC_SWEEP_INTERVAL_MS,
    BLACKLIST_DURATION_MS_DEFAULT, HEARTBEAT_BACKOFF_CAP_FACTOR, HEARTBEAT_PERIOD_MS,
    HEARTBEAT_RPC_TIMEOUT_MS, REGISTRY_INIT_TIMEOUT_MS,
};
use selkie_registry::Registry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Options
// =============================================================================

/// How this server advertises itself to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryType {
    /// Advertise 127.0.0.1; for local testing and single-machine clusters.
    #[default]
    LocalHost,
    /// Advertise an explicitly configured address; for multi-node setups.
    Remote,
}

/// Discovery configuration for environment bootstrap.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub discovery_type: DiscoveryType,
    /// The port peers reach this server's invoke surface on.
    pub port: u16,
    /// Required for [`DiscoveryType::Remote`].
    pub advertise_address: Option<IpAddr>,
    /// Let startup proceed before the first successful heartbeat. Needed to
    /// bootstrap self-registering leader backends.
    pub allow_failed_initial_heartbeat: bool,
}

/// Environment configuration.
#[derive(Clone, Default)]
pub struct EnvironmentOptions {
    pub discovery: DiscoveryOptions,
    /// Disable the local dispatch shortcut even for local references, so a
    /// single machine exercises the real remote path.
    pub force_remote_procedure_calls: bool,
    /// Idle duration after which a live actor is garbage collected. `None`
    /// uses the default.
    pub gc_actors_after_duration_with_no_invocations: Option<Duration>,
    /// How long blacklists requested by this server last. `None` uses the
    /// default.
    pub blacklist_duration: Option<Duration>,
    /// Extra host functions exposed to actor user code.
    pub custom_host_fns: HashMap<String, CustomHostFn>,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Create the actor record on first invocation with this module.
    pub create_with_module: Option<String>,
}

impl InvokeOptions {
    pub fn create_if_not_exist(module_id: impl Into<String>) -> Self {
        Self {
            create_with_module: Some(module_id.into()),
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

struct EnvInner {
    server_id: ServerId,
    address: SocketAddr,
    registry: Arc<dyn Registry>,
    modules: Arc<ModuleResolver>,
    activations: ActivationCache,
    remote: RemoteClient,
    force_remote: bool,
    blacklist_duration: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A server's runtime: routes invocations, owns activations, reports
/// liveness. Cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Create an environment and start its background loops.
    ///
    /// Performs one heartbeat up front so the environment is immediately
    /// usable; failure aborts startup unless
    /// `allow_failed_initial_heartbeat` is set.
    pub async fn new(
        server_id: ServerId,
        registry: Arc<dyn Registry>,
        module_store: Arc<dyn ModuleStore>,
        options: EnvironmentOptions,
    ) -> Result<Self> {
        let address = advertised_address(&options.discovery)?;
        let modules = Arc::new(ModuleResolver::new(module_store));
        let gc_after = options
            .gc_actors_after_duration_with_no_invocations
            .unwrap_or(Duration::from_millis(ACTIVATION_GC_AFTER_IDLE_MS_DEFAULT));
        let blacklist_duration = options
            .blacklist_duration
            .unwrap_or(Duration::from_millis(BLACKLIST_DURATION_MS_DEFAULT));

        let (shutdown, _) = watch::channel(false);
        let remote = RemoteClient::new()?;

        let inner = Arc::new_cyclic(|weak: &Weak<EnvInner>| {
            let weak = weak.clone();
            let dispatch: DispatchFn = Arc::new(move |actor_id, operation, payload| {
                let weak = weak.clone();
                Box::pin(async move {
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| Error::internal("environment is shut down"))?;
                    inner
                        .invoke_actor(actor_id, &operation, payload, InvokeOptions::default())
                        .await
                })
            });

            let host_env = Arc::new(HostFnEnv {
                registry: registry.clone(),
                dispatch,
                custom: options.custom_host_fns.clone(),
            });

            let activations =
                ActivationCache::new(server_id.clone(), modules.clone(), host_env, gc_after);

            EnvInner {
                server_id: server_id.clone(),
                address,
                registry: registry.clone(),
                modules: modules.clone(),
                activations,
                remote,
                force_remote: options.force_remote_procedure_calls,
                blacklist_duration,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }
        });

        // One heartbeat right off the bat so placement can find us.
        let first = tokio::time::timeout(
            Duration::from_millis(REGISTRY_INIT_TIMEOUT_MS),
            inner
                .registry
                .heartbeat(&inner.server_id, inner.address, LoadSnapshot::default()),
        )
        .await;

        match first {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if options.discovery.allow_failed_initial_heartbeat => {
                warn!(server_id = %inner.server_id, error = %e, "initial heartbeat failed, continuing");
            }
            Ok(Err(e)) => return Err(Error::from(e)),
            Err(_) if options.discovery.allow_failed_initial_heartbeat => {
                warn!(server_id = %inner.server_id, "initial heartbeat timed out, continuing");
            }
            Err(_) => {
                return Err(Error::OperationTimedOut {
                    operation: "initial heartbeat".into(),
                    timeout_ms: REGISTRY_INIT_TIMEOUT_MS,
                })
            }
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            inner.clone(),
            inner.shutdown.subscribe(),
        ));
        let gc = tokio::spawn(gc_loop(inner.clone(), inner.shutdown.subscribe()));
        inner.tasks.lock().unwrap().extend([heartbeat, gc]);

        info!(server_id = %inner.server_id, address = %inner.address, "environment started");

        Ok(Self { inner })
    }

    /// This server's cluster-unique ID.
    pub fn server_id(&self) -> &ServerId {
        &self.inner.server_id
    }

    /// The address this server advertises for invocations.
    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Register a natively-linked module factory on this environment.
    pub async fn register_module(
        &self,
        namespace: &str,
        module_id: &str,
        module: Arc<dyn ActorModule>,
    ) {
        self.inner.modules.register(namespace, module_id, module).await;
    }

    /// Invoke an operation on an actor wherever it lives.
    pub async fn invoke(
        &self,
        namespace: &str,
        actor_id: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let actor_id = ActorId::new(namespace, actor_id)?;
        self.inner
            .invoke_actor(actor_id, operation, payload, InvokeOptions::default())
            .await
    }

    /// Invoke with explicit options (implicit creation, in particular).
    pub async fn invoke_with_options(
        &self,
        namespace: &str,
        actor_id: &str,
        operation: &str,
        payload: Bytes,
        options: InvokeOptions,
    ) -> Result<Bytes> {
        let actor_id = ActorId::new(namespace, actor_id)?;
        self.inner
            .invoke_actor(actor_id, operation, payload, options)
            .await
    }

    /// Serve a forwarded invocation from a peer.
    ///
    /// The reference inside the request must name this server.
    pub async fn invoke_direct(&self, request: InvokeDirectRequest) -> Result<Bytes> {
        if request.server_id != self.inner.server_id {
            return Err(Error::WrongServer {
                expected: request.server_id.to_string(),
                received: self.inner.server_id.to_string(),
            });
        }

        let reference = ActorReference {
            actor_id: request.actor_id,
            module_id: request.module_id,
            server_id: request.server_id,
            address: self.inner.address,
            generation: request.generation,
            kind: ReferenceKind::Local,
        };

        self.inner
            .activations
            .invoke(&reference, &request.operation, request.payload)
            .await
    }

    /// Blacklist an actor on this server: evict it and answer 410 until
    /// the duration elapses, steering the router elsewhere.
    pub async fn blacklist_actor(
        &self,
        namespace: &str,
        actor_id: &str,
        for_duration: Duration,
    ) -> Result<()> {
        let actor_id = ActorId::new(namespace, actor_id)?;
        self.inner.activations.blacklist(&actor_id, for_duration).await;
        Ok(())
    }

    /// Number of actors currently live on this server.
    pub fn num_activated_actors(&self) -> u64 {
        self.inner.activations.num_activated_actors()
    }

    /// Memory currently attributed to live actors on this server.
    pub fn used_memory_bytes(&self) -> u64 {
        self.inner.activations.used_memory_bytes()
    }

    /// Stop background loops (emitting a final leaving heartbeat) and shut
    /// down every live actor.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            // The loops exit promptly on the shutdown signal; don't hang
            // shutdown if one is wedged.
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(server_id = %self.inner.server_id, "background task did not stop in time");
            }
        }

        self.inner.activations.close().await;
        self.inner.modules.close().await;
        info!(server_id = %self.inner.server_id, "environment closed");
    }
}

impl EnvInner {
    async fn invoke_actor(
        &self,
        actor_id: ActorId,
        operation: &str,
        payload: Bytes,
        options: InvokeOptions,
    ) -> Result<Bytes> {
        let mut request = EnsureActivationRequest::new(actor_id.clone());
        request.module_id = options.create_with_module;

        let mut rerouted = false;
        loop {
            let references = self
                .registry
                .ensure_activation(request.clone())
                .await
                .map_err(Error::from)?;

            if references.is_empty() {
                return Err(Error::registry_invariant(format!(
                    "ensure_activation succeeded with zero references for actor {}",
                    actor_id
                )));
            }

            match self.invoke_references(&references, operation, payload.clone()).await {
                Err(Error::BlacklistedActivation { server_id }) if !rerouted => {
                    rerouted = true;
                    warn!(
                        actor_id = %actor_id,
                        operation = %operation,
                        blacklisted_server = %server_id,
                        "activation blacklisted, re-routing"
                    );

                    let offender = ServerId::new(server_id)?;
                    if let Err(e) = self
                        .registry
                        .blacklist_server(&offender, &actor_id, self.blacklist_duration)
                        .await
                    {
                        warn!(
                            server_id = %self.server_id,
                            actor_id = %actor_id,
                            error = %e,
                            "failed to record blacklist in registry"
                        );
                    }
                    // Whatever we hold locally predates the blacklist.
                    self.activations.drop_instance(&actor_id).await;
                    continue;
                }
                other => return other,
            }
        }
    }

    async fn invoke_references(
        &self,
        references: &[ActorReference],
        operation: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let last = references.len() - 1;

        for (i, reference) in references.iter().enumerate() {
            let reference = if self.force_remote {
                reference.clone()
            } else {
                reference.clone().localized_for(&self.server_id)
            };

            let result = match reference.kind {
                ReferenceKind::Local => {
                    self.activations.invoke(&reference, operation, payload.clone()).await
                }
                ReferenceKind::RemoteHttp => {
                    self.remote.invoke(&reference, operation, payload.clone()).await
                }
            };

            match result {
                Err(e) if e.is_retriable_transport() && i < last => {
                    warn!(
                        actor_id = %reference.actor_id,
                        server_id = %reference.server_id,
                        error = %e,
                        "transport failure, trying fallback reference"
                    );
                    continue;
                }
                other => return other,
            }
        }

        Err(Error::internal("no references left to try"))
    }

    /// Shed load when the registry says we are over budget: blacklist the
    /// lightest nonzero-memory actor so the balancer re-places it. Never
    /// the sole heavy actor, which would only move the problem.
    async fn maybe_shed_memory(&self, load: &LoadSnapshot, memory_limit_bytes: u64) {
        if load.used_memory_bytes <= memory_limit_bytes {
            return;
        }

        let mut with_memory: Vec<_> = load
            .per_actor_memory
            .iter()
            .filter(|m| m.memory_bytes > 0)
            .collect();
        if with_memory.len() < 2 {
            return;
        }

        with_memory.sort_by_key(|m| m.memory_bytes);
        let lightest = with_memory[0];

        warn!(
            server_id = %self.server_id,
            used_memory_bytes = load.used_memory_bytes,
            memory_limit_bytes,
            actor_id = %lightest.actor_id,
            actor_memory_bytes = lightest.memory_bytes,
            "memory over budget, shedding lightest actor"
        );

        self.activations
            .blacklist(&lightest.actor_id, self.blacklist_duration)
            .await;
    }
}

fn advertised_address(discovery: &DiscoveryOptions) -> Result<SocketAddr> {
    let ip = match discovery.discovery_type {
        DiscoveryType::LocalHost => IpAddr::V4(Ipv4Addr::LOCALHOST),
        DiscoveryType::Remote => discovery.advertise_address.ok_or_else(|| {
            Error::internal("remote discovery requires an advertise address")
        })?,
    };
    Ok(SocketAddr::new(ip, discovery.port))
}

// =============================================================================
// Background Loops
// =============================================================================

/// The sole mechanism by which this server advertises liveness and load.
async fn heartbeat_loop(inner: Arc<EnvInner>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(HEARTBEAT_PERIOD_MS);
    let backoff_cap = period * HEARTBEAT_BACKOFF_CAP_FACTOR as u32;
    let mut delay = period;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let load = inner.activations.load_snapshot();
        let result = tokio::time::timeout(
            Duration::from_millis(HEARTBEAT_RPC_TIMEOUT_MS),
            inner
                .registry
                .heartbeat(&inner.server_id, inner.address, load.clone()),
        )
        .await;

        match result {
            Ok(Ok(heartbeat_result)) => {
                delay = period;
                debug!(
                    server_id = %inner.server_id,
                    num_activated_actors = load.num_activated_actors,
                    used_memory_bytes = load.used_memory_bytes,
                    "heartbeat"
                );
                inner
                    .maybe_shed_memory(&load, heartbeat_result.memory_usage_limit_bytes)
                    .await;
            }
            Ok(Err(e)) => {
                warn!(server_id = %inner.server_id, error = %e, "heartbeat failed");
                delay = (delay * 2).min(backoff_cap);
            }
            Err(_) => {
                warn!(
                    server_id = %inner.server_id,
                    timeout_ms = HEARTBEAT_RPC_TIMEOUT_MS,
                    "heartbeat timed out"
                );
                delay = (delay * 2).min(backoff_cap);
            }
        }
    }

    // Final leaving heartbeat, where the registry supports one.
    if let Err(e) = inner.registry.leave(&inner.server_id).await {
        warn!(server_id = %inner.server_id, error = %e, "leaving heartbeat failed");
    }
}

async fn gc_loop(inner: Arc<EnvInner>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(ACTIVATION_GC_SWEEP_INTERVAL_MS);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        inner.activations.sweep().await;
    }
}
