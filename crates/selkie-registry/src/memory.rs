//! Single-process registry backend
//!
//! All state lives behind one lock in this process. Suitable for
//! single-node deployments, for tests, and as the state a leader node
//! serves to the rest of the cluster through the registry service.

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use async_trait::async_trait;
use bytes::Bytes;
use selkie_core::{
    ActorId, ActorOptions, ActorReference, CreateActorResult, EnsureActivationRequest,
    HeartbeatResult, LoadSnapshot, ModuleOptions, ReferenceKind, RegisterModuleResult, ServerId,
    ServerSnapshot, HEARTBEAT_TTL_MS, SERVER_MEMORY_USAGE_LIMIT_BYTES_DEFAULT,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Tunables for the in-memory registry
#[derive(Debug, Clone)]
pub struct MemoryRegistryOptions {
    /// A server missing heartbeats for this long is treated as dead
    pub heartbeat_ttl: Duration,
    /// Memory budget reported back to servers; the balancer prefers
    /// placements on servers below it
    pub memory_usage_limit_bytes: u64,
}

impl Default for MemoryRegistryOptions {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_millis(HEARTBEAT_TTL_MS),
            memory_usage_limit_bytes: SERVER_MEMORY_USAGE_LIMIT_BYTES_DEFAULT,
        }
    }
}

struct ServerState {
    address: SocketAddr,
    last_heartbeat: Instant,
    load: LoadSnapshot,
}

struct ActivationRecord {
    server_id: ServerId,
    generation: u64,
}

struct ModuleRecord {
    bytes: Bytes,
    options: ModuleOptions,
}

struct ActorRecord {
    module_id: String,
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<ServerId, ServerState>,
    modules: HashMap<(String, String), ModuleRecord>,
    actors: HashMap<ActorId, ActorRecord>,
    activations: HashMap<ActorId, ActivationRecord>,
    kv: HashMap<ActorId, HashMap<Vec<u8>, Bytes>>,
    blacklist: HashMap<(ServerId, ActorId), Instant>,
}

impl RegistryState {
    fn server_alive(&self, server_id: &ServerId, now: Instant, ttl: Duration) -> bool {
        self.servers
            .get(server_id)
            .map(|s| now.duration_since(s.last_heartbeat) < ttl)
            .unwrap_or(false)
    }

    fn is_blacklisted(&self, server_id: &ServerId, actor_id: &ActorId, now: Instant) -> bool {
        self.blacklist
            .get(&(server_id.clone(), actor_id.clone()))
            .map(|expiry| *expiry > now)
            .unwrap_or(false)
    }

    fn prune_blacklist(&mut self, now: Instant) {
        self.blacklist.retain(|_, expiry| *expiry > now);
    }

    /// Activations assigned per server according to the placement map.
    ///
    /// Heartbeat-reported counts lag behind rapid placement bursts; the
    /// balancer spreads by what it has already assigned.
    fn assigned_counts(&self) -> HashMap<&ServerId, u64> {
        let mut counts: HashMap<&ServerId, u64> = HashMap::new();
        for record in self.activations.values() {
            *counts.entry(&record.server_id).or_default() += 1;
        }
        counts
    }
}

/// In-memory registry implementation
///
/// All state is lost on restart.
pub struct MemoryRegistry {
    options: MemoryRegistryOptions,
    state: RwLock<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_options(MemoryRegistryOptions::default())
    }

    pub fn with_options(options: MemoryRegistryOptions) -> Self {
        Self {
            options,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Select the placement target for an actor: a live, non-blacklisted
    /// server, preferring servers under the memory budget, least-assigned
    /// first.
    fn select_server(
        &self,
        state: &RegistryState,
        actor_id: &ActorId,
        now: Instant,
    ) -> Option<ServerId> {
        let assigned = state.assigned_counts();

        let candidates: Vec<(&ServerId, &ServerState)> = state
            .servers
            .iter()
            .filter(|(id, _)| state.server_alive(id, now, self.options.heartbeat_ttl))
            .filter(|(id, _)| !state.is_blacklisted(id, actor_id, now))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let under_budget: Vec<&(&ServerId, &ServerState)> = candidates
            .iter()
            .filter(|(_, s)| s.load.used_memory_bytes < self.options.memory_usage_limit_bytes)
            .collect();

        let pool: Vec<&(&ServerId, &ServerState)> = if under_budget.is_empty() {
            candidates.iter().collect()
        } else {
            under_budget
        };

        pool.iter()
            .min_by_key(|(id, s)| {
                (
                    assigned.get(id).copied().unwrap_or(0),
                    s.load.used_memory_bytes,
                    rand::random::<u64>(),
                )
            })
            .map(|(id, _)| (*id).clone())
    }

    fn reference_for(
        state: &RegistryState,
        actor_id: &ActorId,
        module_id: &str,
        record: &ActivationRecord,
    ) -> RegistryResult<ActorReference> {
        let server = state
            .servers
            .get(&record.server_id)
            .ok_or_else(|| RegistryError::ServerNotFound {
                server_id: record.server_id.to_string(),
            })?;

        Ok(ActorReference {
            actor_id: actor_id.clone(),
            module_id: module_id.to_string(),
            server_id: record.server_id.clone(),
            address: server.address,
            generation: record.generation,
            // The registry does not know who is asking; callers localize.
            kind: ReferenceKind::RemoteHttp,
        })
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn heartbeat(
        &self,
        server_id: &ServerId,
        address: SocketAddr,
        load: LoadSnapshot,
    ) -> RegistryResult<HeartbeatResult> {
        let mut state = self.state.write().await;
        let now = Instant::now();

        let entry = state
            .servers
            .entry(server_id.clone())
            .or_insert_with(|| ServerState {
                address,
                last_heartbeat: now,
                load: LoadSnapshot::default(),
            });
        entry.address = address;
        entry.last_heartbeat = now;
        entry.load = load;

        let servers = state
            .servers
            .iter()
            .filter(|(id, _)| state.server_alive(id, now, self.options.heartbeat_ttl))
            .map(|(id, s)| ServerSnapshot {
                server_id: id.clone(),
                address: s.address,
                num_activated_actors: s.load.num_activated_actors,
                used_memory_bytes: s.load.used_memory_bytes,
            })
            .collect();

        Ok(HeartbeatResult {
            memory_usage_limit_bytes: self.options.memory_usage_limit_bytes,
            servers: Some(servers),
        })
    }

    async fn ensure_activation(
        &self,
        req: EnsureActivationRequest,
    ) -> RegistryResult<Vec<ActorReference>> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.prune_blacklist(now);

        let module_id = match state.actors.get(&req.actor_id) {
            Some(record) => record.module_id.clone(),
            None => {
                let module_id = req
                    .module_id
                    .clone()
                    .ok_or_else(|| RegistryError::actor_not_found(&req.actor_id))?;
                state.actors.insert(
                    req.actor_id.clone(),
                    ActorRecord {
                        module_id: module_id.clone(),
                    },
                );
                module_id
            }
        };

        // Reuse the existing activation while its server is alive and not
        // blacklisted for this actor.
        if let Some(record) = state.activations.get(&req.actor_id) {
            if state.server_alive(&record.server_id, now, self.options.heartbeat_ttl)
                && !state.is_blacklisted(&record.server_id, &req.actor_id, now)
            {
                let reference = Self::reference_for(&state, &req.actor_id, &module_id, record)?;
                return Ok(vec![reference]);
            }
        }

        let target = self
            .select_server(&state, &req.actor_id, now)
            .ok_or(RegistryError::NoServersAvailable)?;

        let generation = state
            .activations
            .get(&req.actor_id)
            .map(|record| record.generation + 1)
            .unwrap_or(0);

        debug!(
            actor_id = %req.actor_id,
            server_id = %target,
            generation,
            "placing activation"
        );

        let record = ActivationRecord {
            server_id: target,
            generation,
        };
        let reference = Self::reference_for(&state, &req.actor_id, &module_id, &record)?;
        state.activations.insert(req.actor_id, record);

        Ok(vec![reference])
    }

    async fn register_module(
        &self,
        namespace: &str,
        module_id: &str,
        module_bytes: Bytes,
        options: ModuleOptions,
    ) -> RegistryResult<RegisterModuleResult> {
        let mut state = self.state.write().await;
        let key = (namespace.to_string(), module_id.to_string());

        if state.modules.contains_key(&key) {
            return Err(RegistryError::ModuleAlreadyExists {
                namespace: namespace.to_string(),
                module_id: module_id.to_string(),
            });
        }

        let size_bytes = module_bytes.len();
        state.modules.insert(
            key,
            ModuleRecord {
                bytes: module_bytes,
                options,
            },
        );

        Ok(RegisterModuleResult {
            namespace: namespace.to_string(),
            module_id: module_id.to_string(),
            size_bytes,
        })
    }

    async fn get_module(
        &self,
        namespace: &str,
        module_id: &str,
    ) -> RegistryResult<Option<(Bytes, ModuleOptions)>> {
        let state = self.state.read().await;
        Ok(state
            .modules
            .get(&(namespace.to_string(), module_id.to_string()))
            .map(|record| (record.bytes.clone(), record.options.clone())))
    }

    async fn create_actor(
        &self,
        namespace: &str,
        actor_id: &str,
        module_id: &str,
        _options: ActorOptions,
    ) -> RegistryResult<CreateActorResult> {
        let id = ActorId::new(namespace, actor_id).map_err(|e| RegistryError::Internal {
            message: e.to_string(),
        })?;

        let mut state = self.state.write().await;

        if !state
            .modules
            .contains_key(&(namespace.to_string(), module_id.to_string()))
        {
            return Err(RegistryError::module_not_found(namespace, module_id));
        }

        if state.actors.contains_key(&id) {
            return Err(RegistryError::ActorAlreadyExists {
                actor_id: id.to_string(),
            });
        }

        state.actors.insert(
            id,
            ActorRecord {
                module_id: module_id.to_string(),
            },
        );

        Ok(CreateActorResult {
            namespace: namespace.to_string(),
            actor_id: actor_id.to_string(),
            module_id: module_id.to_string(),
        })
    }

    async fn actor_kv_get(&self, actor_id: &ActorId, key: &[u8]) -> RegistryResult<Option<Bytes>> {
        let state = self.state.read().await;
        Ok(state
            .kv
            .get(actor_id)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn actor_kv_put(
        &self,
        actor_id: &ActorId,
        key: Bytes,
        value: Bytes,
    ) -> RegistryResult<()> {
        let mut state = self.state.write().await;
        state
            .kv
            .entry(actor_id.clone())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn blacklist_server(
        &self,
        server_id: &ServerId,
        actor_id: &ActorId,
        for_duration: Duration,
    ) -> RegistryResult<()> {
        let mut state = self.state.write().await;
        let expiry = Instant::now() + for_duration;

        debug!(
            server_id = %server_id,
            actor_id = %actor_id,
            for_millis = for_duration.as_millis() as u64,
            "blacklisting server for actor"
        );

        state
            .blacklist
            .insert((server_id.clone(), actor_id.clone()), expiry);
        Ok(())
    }

    async fn leave(&self, server_id: &ServerId) -> RegistryResult<()> {
        let mut state = self.state.write().await;
        state.servers.remove(server_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn test_server_id(n: u32) -> ServerId {
        ServerId::new(format!("server-{}", n)).unwrap()
    }

    fn test_actor_id(n: u32) -> ActorId {
        ActorId::new("test", format!("actor-{}", n)).unwrap()
    }

    fn ensure_req(n: u32) -> EnsureActivationRequest {
        EnsureActivationRequest::new(test_actor_id(n)).create_if_not_exist("test-module")
    }

    async fn beat(registry: &MemoryRegistry, n: u32) {
        registry
            .heartbeat(&test_server_id(n), test_addr(9000 + n as u16), LoadSnapshot::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_self_registers() {
        let registry = MemoryRegistry::new();
        let result = registry
            .heartbeat(&test_server_id(1), test_addr(9001), LoadSnapshot::default())
            .await
            .unwrap();

        assert!(result.memory_usage_limit_bytes > 0);
        let servers = result.servers.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].server_id, test_server_id(1));
    }

    #[tokio::test]
    async fn test_ensure_activation_no_servers() {
        let registry = MemoryRegistry::new();
        let result = registry.ensure_activation(ensure_req(0)).await;
        assert!(matches!(result, Err(RegistryError::NoServersAvailable)));
    }

    #[tokio::test]
    async fn test_ensure_activation_unknown_actor() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;

        let result = registry
            .ensure_activation(EnsureActivationRequest::new(test_actor_id(0)))
            .await;
        assert!(matches!(result, Err(RegistryError::ActorNotFound { .. })));
    }

    #[tokio::test]
    async fn test_ensure_activation_is_stable() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;
        beat(&registry, 2).await;

        let first = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].generation, 0);

        // Repeated resolution reuses the same placement and generation.
        for _ in 0..5 {
            let again = registry.ensure_activation(ensure_req(0)).await.unwrap();
            assert_eq!(again[0].server_id, first[0].server_id);
            assert_eq!(again[0].generation, 0);
        }
    }

    #[tokio::test]
    async fn test_placement_spreads_least_assigned() {
        let registry = MemoryRegistry::new();
        for n in 1..=3 {
            beat(&registry, n).await;
        }

        let mut counts: HashMap<ServerId, u64> = HashMap::new();
        for i in 0..10 {
            let refs = registry.ensure_activation(ensure_req(i)).await.unwrap();
            *counts.entry(refs[0].server_id.clone()).or_default() += 1;
        }

        assert_eq!(counts.values().sum::<u64>(), 10);
        for count in counts.values() {
            assert!(*count == 3 || *count == 4, "unbalanced placement: {:?}", counts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_server_excluded_from_placement() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;

        // Expire server-1's heartbeat, then bring up server-2.
        tokio::time::sleep(Duration::from_millis(HEARTBEAT_TTL_MS + 100)).await;
        beat(&registry, 2).await;

        let refs = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(refs[0].server_id, test_server_id(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_server_triggers_reassignment_with_higher_generation() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;

        let first = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(first[0].generation, 0);

        // server-1 dies; server-2 keeps beating.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            beat(&registry, 2).await;
        }

        let second = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(second[0].server_id, test_server_id(2));
        assert_eq!(second[0].generation, 1);
    }

    #[tokio::test]
    async fn test_blacklist_moves_activation() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;
        beat(&registry, 2).await;

        let first = registry.ensure_activation(ensure_req(0)).await.unwrap();
        let original_server = first[0].server_id.clone();

        registry
            .blacklist_server(&original_server, &test_actor_id(0), Duration::from_secs(30))
            .await
            .unwrap();

        let second = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_ne!(second[0].server_id, original_server);
        assert_eq!(second[0].generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_expires() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;

        registry
            .blacklist_server(&test_server_id(1), &test_actor_id(0), Duration::from_secs(1))
            .await
            .unwrap();

        // While blacklisted, the only server is unusable.
        let result = registry.ensure_activation(ensure_req(0)).await;
        assert!(matches!(result, Err(RegistryError::NoServersAvailable)));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        beat(&registry, 1).await;

        let refs = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(refs[0].server_id, test_server_id(1));
    }

    #[tokio::test]
    async fn test_generation_monotonic_across_moves() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;
        beat(&registry, 2).await;

        let mut last_generation = None;
        for round in 0..4 {
            let refs = registry.ensure_activation(ensure_req(0)).await.unwrap();
            let generation = refs[0].generation;
            if let Some(prev) = last_generation {
                assert!(generation >= prev, "generation regressed at round {}", round);
            }
            last_generation = Some(generation);

            registry
                .blacklist_server(&refs[0].server_id, &test_actor_id(0), Duration::from_secs(30))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_memory_pressure_steers_placement() {
        let options = MemoryRegistryOptions {
            memory_usage_limit_bytes: 100,
            ..Default::default()
        };
        let registry = MemoryRegistry::with_options(options);

        // server-1 is over budget and has fewer assigned actors; server-2 is
        // under budget. Placement must prefer the one under budget anyway.
        registry
            .heartbeat(
                &test_server_id(1),
                test_addr(9001),
                LoadSnapshot {
                    num_activated_actors: 0,
                    used_memory_bytes: 500,
                    per_actor_memory: Vec::new(),
                },
            )
            .await
            .unwrap();
        registry
            .heartbeat(
                &test_server_id(2),
                test_addr(9002),
                LoadSnapshot {
                    num_activated_actors: 3,
                    used_memory_bytes: 50,
                    per_actor_memory: Vec::new(),
                },
            )
            .await
            .unwrap();

        let refs = registry.ensure_activation(ensure_req(0)).await.unwrap();
        assert_eq!(refs[0].server_id, test_server_id(2));
    }

    #[tokio::test]
    async fn test_module_roundtrip_and_immutability() {
        let registry = MemoryRegistry::new();

        let bytes = Bytes::from_static(b"module-bytes");
        let result = registry
            .register_module("ns", "m", bytes.clone(), ModuleOptions::default())
            .await
            .unwrap();
        assert_eq!(result.size_bytes, bytes.len());

        let (stored, _) = registry.get_module("ns", "m").await.unwrap().unwrap();
        assert_eq!(stored, bytes);

        let again = registry
            .register_module("ns", "m", Bytes::from_static(b"other"), ModuleOptions::default())
            .await;
        assert!(matches!(
            again,
            Err(RegistryError::ModuleAlreadyExists { .. })
        ));

        assert!(registry.get_module("ns", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_actor_requires_module() {
        let registry = MemoryRegistry::new();

        let result = registry
            .create_actor("ns", "a", "missing", ActorOptions::default())
            .await;
        assert!(matches!(result, Err(RegistryError::ModuleNotFound { .. })));

        registry
            .register_module("ns", "m", Bytes::new(), ModuleOptions::default())
            .await
            .unwrap();

        let result = registry
            .create_actor("ns", "a", "m", ActorOptions::default())
            .await
            .unwrap();
        assert_eq!(result.actor_id, "a");

        let dup = registry
            .create_actor("ns", "a", "m", ActorOptions::default())
            .await;
        assert!(matches!(dup, Err(RegistryError::ActorAlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_actor_kv_roundtrip() {
        let registry = MemoryRegistry::new();
        let actor = test_actor_id(0);

        assert!(registry.actor_kv_get(&actor, b"k").await.unwrap().is_none());

        registry
            .actor_kv_put(&actor, Bytes::from_static(b"k"), Bytes::from_static(b"v"))
            .await
            .unwrap();

        let value = registry.actor_kv_get(&actor, b"k").await.unwrap();
        assert_eq!(value.unwrap(), Bytes::from_static(b"v"));

        // Keys are scoped per actor.
        let other = test_actor_id(1);
        assert!(registry.actor_kv_get(&other, b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leave_removes_server() {
        let registry = MemoryRegistry::new();
        beat(&registry, 1).await;

        registry.leave(&test_server_id(1)).await.unwrap();

        let result = registry.ensure_activation(ensure_req(0)).await;
        assert!(matches!(result, Err(RegistryError::NoServersAvailable)));
    }
}
