//! Per-server activation cache
//!
//! The authoritative owner of live actor instances on one server. The
//! cache serializes per-actor invocations, collapses concurrent
//! instantiations, verifies reference generations, enforces the local
//! blacklist, and garbage-collects idle instances.
//!
//! Each actor entry carries an async mutex of capacity one: holding it is
//! both the invocation serialization token and the single-flight build
//! state (concurrent instantiations queue behind the builder).

use crate::hostfns::{HostCapabilities, HostFnEnv, TimerSet};
use crate::module::{ActorInstance, ModuleResolver};
use bytes::Bytes;
use selkie_core::hostcall::{SHUTDOWN_OPERATION, STARTUP_OPERATION};
use selkie_core::{
    ActorId, ActorMemory, ActorReference, Error, LoadSnapshot, Result, ServerId,
    ACTIVATIONS_SHARD_COUNT,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct LiveActor {
    instance: Box<dyn ActorInstance>,
    generation: u64,
    timers: Arc<TimerSet>,
}

struct ActorEntry {
    actor_id: ActorId,
    /// Serialization token and single-flight build state in one.
    slot: tokio::sync::Mutex<Option<LiveActor>>,
    /// Mirrors `slot.is_some()` for lock-free snapshots.
    has_instance: AtomicBool,
    memory_bytes: AtomicU64,
    last_used_ms: AtomicU64,
    /// Highest reference generation observed for this actor here.
    max_generation: AtomicU64,
    /// 0 = not blacklisted; otherwise cache-clock expiry in ms.
    blacklisted_until_ms: AtomicU64,
}

impl ActorEntry {
    fn new(actor_id: ActorId, now_ms: u64) -> Self {
        Self {
            actor_id,
            slot: tokio::sync::Mutex::new(None),
            has_instance: AtomicBool::new(false),
            memory_bytes: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(now_ms),
            max_generation: AtomicU64::new(0),
            blacklisted_until_ms: AtomicU64::new(0),
        }
    }

    fn blacklisted(&self, now_ms: u64) -> bool {
        let until = self.blacklisted_until_ms.load(Ordering::Acquire);
        until != 0 && now_ms < until
    }

    fn note_eviction(&self) {
        self.has_instance.store(false, Ordering::Release);
        self.memory_bytes.store(0, Ordering::Release);
    }
}

/// The per-server owner of live actor instances.
pub struct ActivationCache {
    server_id: ServerId,
    shards: Vec<Mutex<HashMap<ActorId, Arc<ActorEntry>>>>,
    modules: Arc<ModuleResolver>,
    host_env: Arc<HostFnEnv>,
    gc_after_idle: Duration,
    start: Instant,
    closed: AtomicBool,
}

impl ActivationCache {
    pub(crate) fn new(
        server_id: ServerId,
        modules: Arc<ModuleResolver>,
        host_env: Arc<HostFnEnv>,
        gc_after_idle: Duration,
    ) -> Self {
        let shards = (0..ACTIVATIONS_SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            server_id,
            shards,
            modules,
            host_env,
            gc_after_idle,
            start: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        // The cache clock starts at 1 so 0 can mean "not blacklisted".
        self.start.elapsed().as_millis() as u64 + 1
    }

    fn shard(&self, actor_id: &ActorId) -> &Mutex<HashMap<ActorId, Arc<ActorEntry>>> {
        let mut hasher = DefaultHasher::new();
        actor_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    fn entry(&self, actor_id: &ActorId) -> Arc<ActorEntry> {
        let mut shard = self.shard(actor_id).lock().unwrap();
        shard
            .entry(actor_id.clone())
            .or_insert_with(|| Arc::new(ActorEntry::new(actor_id.clone(), self.now_ms())))
            .clone()
    }

    fn lookup(&self, actor_id: &ActorId) -> Option<Arc<ActorEntry>> {
        self.shard(actor_id).lock().unwrap().get(actor_id).cloned()
    }

    /// Remove the entry from its shard if the map still holds this exact
    /// entry. Callers must hold the entry's slot lock.
    fn detach(&self, entry: &Arc<ActorEntry>) {
        let mut shard = self.shard(&entry.actor_id).lock().unwrap();
        if let Some(current) = shard.get(&entry.actor_id) {
            if Arc::ptr_eq(current, entry) {
                shard.remove(&entry.actor_id);
            }
        }
    }

    /// Invoke an operation on the referenced actor, instantiating it
    /// lazily.
    ///
    /// Precondition: the reference names this server. Invocations on one
    /// actor are strictly serialized; the caller's deadline (or drop)
    /// releases the serialization token.
    pub async fn invoke(
        &self,
        reference: &ActorReference,
        operation: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        if reference.server_id != self.server_id {
            return Err(Error::WrongServer {
                expected: reference.server_id.to_string(),
                received: self.server_id.to_string(),
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::internal("activation cache is closed"));
        }

        loop {
            let entry = self.entry(&reference.actor_id);

            if entry.blacklisted(self.now_ms()) {
                return Err(Error::BlacklistedActivation {
                    server_id: self.server_id.to_string(),
                });
            }

            let mut slot = entry.slot.lock().await;

            // The entry may have been detached (GC, eviction) while we
            // waited for the token; start over on the live map entry.
            match self.lookup(&reference.actor_id) {
                Some(current) if Arc::ptr_eq(&current, &entry) => {}
                _ => continue,
            }

            // Blacklisting may have landed while we waited.
            if entry.blacklisted(self.now_ms()) {
                return Err(Error::BlacklistedActivation {
                    server_id: self.server_id.to_string(),
                });
            }

            // Fencing: never build below a generation already observed
            // here.
            let max_seen = entry.max_generation.load(Ordering::Acquire);
            if reference.generation < max_seen {
                return Err(Error::internal(format!(
                    "stale reference for actor {}: generation {} < observed {}",
                    reference.actor_id, reference.generation, max_seen
                )));
            }
            entry
                .max_generation
                .store(reference.generation, Ordering::Release);

            let up_to_date = matches!(
                slot.as_ref(),
                Some(live) if live.generation >= reference.generation
            );

            if !up_to_date {
                if let Some(stale) = slot.take() {
                    info!(
                        actor_id = %reference.actor_id,
                        old_generation = stale.generation,
                        new_generation = reference.generation,
                        "discarding lower-generation instance"
                    );
                    entry.note_eviction();
                    self.shutdown_live(&reference.actor_id, stale).await;
                }

                let module = self
                    .modules
                    .resolve(reference.actor_id.namespace(), &reference.module_id)
                    .await?;

                let timers = Arc::new(TimerSet::default());
                let host = HostCapabilities::new(
                    self.host_env.clone(),
                    timers.clone(),
                    reference.actor_id.clone(),
                    reference.module_id.clone(),
                );

                let mut instance = module.instantiate(&reference.actor_id, host).await?;
                if let Err(e) = instance.invoke(STARTUP_OPERATION, Bytes::new()).await {
                    timers.close();
                    if let Err(close_err) = instance.close().await {
                        warn!(
                            actor_id = %reference.actor_id,
                            error = %close_err,
                            "instance close failed after startup error"
                        );
                    }
                    return Err(e);
                }

                debug!(
                    actor_id = %reference.actor_id,
                    generation = reference.generation,
                    "actor activated"
                );

                entry
                    .memory_bytes
                    .store(instance.memory_usage_bytes(), Ordering::Release);
                entry.has_instance.store(true, Ordering::Release);
                *slot = Some(LiveActor {
                    instance,
                    generation: reference.generation,
                    timers,
                });
            }

            let live = slot.as_mut().ok_or_else(|| {
                Error::internal(format!(
                    "no live instance for actor {} after activation",
                    reference.actor_id
                ))
            })?;

            let result = live.instance.invoke(operation, payload).await;

            entry.last_used_ms.store(self.now_ms(), Ordering::Release);
            entry
                .memory_bytes
                .store(live.instance.memory_usage_bytes(), Ordering::Release);

            return result;
        }
    }

    /// Blacklist an actor on this server: evict any live instance and
    /// refuse invocations until the duration elapses.
    pub async fn blacklist(&self, actor_id: &ActorId, for_duration: Duration) {
        let entry = self.entry(actor_id);
        let until = self.now_ms() + for_duration.as_millis() as u64;
        entry.blacklisted_until_ms.store(until, Ordering::Release);

        info!(
            actor_id = %actor_id,
            server_id = %self.server_id,
            for_millis = for_duration.as_millis() as u64,
            "blacklisting activation"
        );

        let mut slot = entry.slot.lock().await;
        if let Some(live) = slot.take() {
            entry.note_eviction();
            self.shutdown_live(actor_id, live).await;
        }
    }

    /// Drop any cached instance for the actor without blacklisting it.
    ///
    /// Used by the router after a peer reports the actor blacklisted
    /// elsewhere: whatever this server holds is stale.
    pub async fn drop_instance(&self, actor_id: &ActorId) {
        let Some(entry) = self.lookup(actor_id) else {
            return;
        };

        let mut slot = entry.slot.lock().await;
        if let Some(live) = slot.take() {
            entry.note_eviction();
            self.shutdown_live(actor_id, live).await;
        }
        if !entry.blacklisted(self.now_ms()) {
            self.detach(&entry);
        }
    }

    /// One idle-GC pass: shut down instances idle past the GC duration and
    /// drop expired blacklist markers.
    pub async fn sweep(&self) {
        let gc_after_ms = self.gc_after_idle.as_millis() as u64;

        let entries: Vec<Arc<ActorEntry>> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().unwrap().values().cloned().collect::<Vec<_>>())
            .collect();

        for entry in entries {
            let now = self.now_ms();
            let idle_ms = now.saturating_sub(entry.last_used_ms.load(Ordering::Acquire));
            let has_instance = entry.has_instance.load(Ordering::Acquire);

            if has_instance && idle_ms < gc_after_ms {
                continue;
            }

            // A busy actor is not idle; skip rather than wait.
            let Ok(mut slot) = entry.slot.try_lock() else {
                continue;
            };

            let now = self.now_ms();
            let idle_ms = now.saturating_sub(entry.last_used_ms.load(Ordering::Acquire));

            if slot.is_some() {
                if idle_ms < gc_after_ms {
                    continue;
                }
                if let Some(live) = slot.take() {
                    info!(
                        actor_id = %entry.actor_id,
                        idle_ms,
                        generation = live.generation,
                        "garbage collecting idle activation"
                    );
                    entry.note_eviction();
                    self.shutdown_live(&entry.actor_id, live).await;
                }
            }

            if !entry.blacklisted(now) {
                self.detach(&entry);
            }
        }
    }

    /// Number of live actor instances on this server.
    pub fn num_activated_actors(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|e| e.has_instance.load(Ordering::Acquire))
                    .count() as u64
            })
            .sum()
    }

    /// Total memory attributed to live instances, in bytes.
    pub fn used_memory_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|e| e.has_instance.load(Ordering::Acquire))
                    .map(|e| e.memory_bytes.load(Ordering::Acquire))
                    .sum::<u64>()
            })
            .sum()
    }

    /// The load report carried by heartbeats.
    pub fn load_snapshot(&self) -> LoadSnapshot {
        let mut per_actor = Vec::new();
        let mut used = 0u64;
        let mut count = 0u64;

        for shard in &self.shards {
            for entry in shard.lock().unwrap().values() {
                if !entry.has_instance.load(Ordering::Acquire) {
                    continue;
                }
                let memory_bytes = entry.memory_bytes.load(Ordering::Acquire);
                count += 1;
                used += memory_bytes;
                per_actor.push(ActorMemory {
                    actor_id: entry.actor_id.clone(),
                    memory_bytes,
                });
            }
        }

        LoadSnapshot {
            num_activated_actors: count,
            used_memory_bytes: used,
            per_actor_memory: per_actor,
        }
    }

    /// Shut down every live instance and refuse further invocations.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let entries: Vec<Arc<ActorEntry>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard.lock().unwrap().drain().map(|(_, e)| e).collect::<Vec<_>>()
            })
            .collect();

        for entry in entries {
            let mut slot = entry.slot.lock().await;
            if let Some(live) = slot.take() {
                entry.note_eviction();
                self.shutdown_live(&entry.actor_id, live).await;
            }
        }
    }

    async fn shutdown_live(&self, actor_id: &ActorId, mut live: LiveActor) {
        live.timers.close();

        if let Err(e) = live
            .instance
            .invoke(SHUTDOWN_OPERATION, Bytes::new())
            .await
        {
            warn!(
                server_id = %self.server_id,
                actor_id = %actor_id,
                error = %e,
                "shutdown operation failed"
            );
        }
        if let Err(e) = live.instance.close().await {
            warn!(
                server_id = %self.server_id,
                actor_id = %actor_id,
                error = %e,
                "instance close failed"
            );
        }
    }
}
