//! Host functions exposed to actor user code
//!
//! Actors reach back into the runtime through a small, string-keyed
//! surface: per-actor KV, creating and invoking other actors, and one-shot
//! scheduled invocations. The payload formats are fixed by
//! `selkie_core::hostcall` and shared with embedded-module ABIs.

use bytes::Bytes;
use futures::future::BoxFuture;
use selkie_core::hostcall::*;
use selkie_core::{ActorId, Error, Result};
use selkie_registry::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// Narrow dispatch capability handed to the host-function layer.
///
/// This is the invocation router's `invoke` as a closure; passing the
/// function rather than the environment breaks the environment ↔
/// activations cycle.
pub(crate) type DispatchFn =
    Arc<dyn Fn(ActorId, String, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// A custom host function registered on the environment.
pub type CustomHostFn = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

/// Shared, per-environment host-function dependencies.
pub(crate) struct HostFnEnv {
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) dispatch: DispatchFn,
    pub(crate) custom: HashMap<String, CustomHostFn>,
}

// =============================================================================
// Timer Ownership
// =============================================================================

/// One-shot timers owned by a live actor.
///
/// Timers must not outlive the actor that scheduled them: eviction closes
/// the set, aborting everything in flight and refusing late registrations.
#[derive(Default)]
pub(crate) struct TimerSet {
    inner: Mutex<TimerSetState>,
}

#[derive(Default)]
struct TimerSetState {
    handles: Vec<AbortHandle>,
    closed: bool,
}

impl TimerSet {
    /// Register a scheduled task. Returns false when the set is already
    /// closed; the caller must abort the task itself.
    fn register(&self, handle: AbortHandle) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return false;
        }
        state.handles.retain(|h| !h.is_finished());
        state.handles.push(handle);
        true
    }

    /// Abort all outstanding timers and refuse new ones.
    pub(crate) fn close(&self) {
        let mut state = self.inner.lock().unwrap();
        state.closed = true;
        for handle in state.handles.drain(..) {
            handle.abort();
        }
    }
}

// =============================================================================
// HostCapabilities
// =============================================================================

/// The host surface one actor instance sees.
///
/// Scoped to the actor's identity and module; KV keys cannot leak across
/// actors, and `actor.create` without a module forks the caller's module.
#[derive(Clone)]
pub struct HostCapabilities {
    env: Arc<HostFnEnv>,
    timers: Arc<TimerSet>,
    actor_id: ActorId,
    module_id: String,
}

impl HostCapabilities {
    pub(crate) fn new(
        env: Arc<HostFnEnv>,
        timers: Arc<TimerSet>,
        actor_id: ActorId,
        module_id: String,
    ) -> Self {
        Self {
            env,
            timers,
            actor_id,
            module_id,
        }
    }

    /// The identity of the actor holding these capabilities.
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Dispatch a host function by name with a raw payload.
    ///
    /// This is the single entry point embedded-module ABIs route through;
    /// the typed helpers below encode onto it.
    pub async fn call(&self, host_fn: &str, payload: Bytes) -> Result<Bytes> {
        match host_fn {
            KV_PUT_OPERATION => {
                let (key, value) = extract_kv_put(&payload)?;
                self.env
                    .registry
                    .actor_kv_put(
                        &self.actor_id,
                        Bytes::copy_from_slice(key),
                        Bytes::copy_from_slice(value),
                    )
                    .await
                    .map_err(Error::from)?;
                Ok(Bytes::new())
            }
            KV_GET_OPERATION => {
                let value = self
                    .env
                    .registry
                    .actor_kv_get(&self.actor_id, &payload)
                    .await
                    .map_err(Error::from)?;
                Ok(encode_kv_get_result(value.as_deref()))
            }
            ACTOR_CREATE_OPERATION => {
                let call: CreateActorCall =
                    serde_json::from_slice(&payload).map_err(|e| Error::MalformedPayload {
                        reason: format!("actor.create: {}", e),
                    })?;
                // An omitted module means the actor forks itself.
                let module_id = call
                    .module_id
                    .unwrap_or_else(|| self.module_id.clone());
                self.env
                    .registry
                    .create_actor(
                        self.actor_id.namespace(),
                        &call.actor_id,
                        &module_id,
                        Default::default(),
                    )
                    .await
                    .map_err(Error::from)?;
                Ok(Bytes::new())
            }
            ACTOR_INVOKE_OPERATION => {
                let call: InvokeActorCall =
                    serde_json::from_slice(&payload).map_err(|e| Error::MalformedPayload {
                        reason: format!("actor.invoke: {}", e),
                    })?;
                let target = ActorId::new(self.actor_id.namespace(), call.actor_id)?;
                (self.env.dispatch)(target, call.operation, call.payload).await
            }
            SCHEDULE_INVOKE_OPERATION => {
                let call: ScheduleInvokeCall =
                    serde_json::from_slice(&payload).map_err(|e| Error::MalformedPayload {
                        reason: format!("schedule.invoke: {}", e),
                    })?;
                self.schedule_invoke(call)
            }
            other => match self.env.custom.get(other) {
                Some(custom_fn) => custom_fn(payload),
                None => Err(Error::UnknownHostFunction {
                    name: other.to_string(),
                }),
            },
        }
    }

    /// Put a key/value pair into this actor's durable KV.
    pub async fn kv_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.call(KV_PUT_OPERATION, encode_kv_put(key, value))
            .await
            .map(|_| ())
    }

    /// Get a value from this actor's durable KV.
    pub async fn kv_get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let result = self
            .call(KV_GET_OPERATION, Bytes::copy_from_slice(key))
            .await?;
        match result.first() {
            Some(0) | None => Ok(None),
            Some(_) => Ok(Some(result.slice(1..))),
        }
    }

    /// Create another actor in this actor's namespace.
    pub async fn create_actor(&self, actor_id: &str, module_id: Option<&str>) -> Result<()> {
        let call = CreateActorCall {
            actor_id: actor_id.to_string(),
            module_id: module_id.map(|m| m.to_string()),
        };
        let payload = serde_json::to_vec(&call).map_err(internal_serde)?;
        self.call(ACTOR_CREATE_OPERATION, Bytes::from(payload))
            .await
            .map(|_| ())
    }

    /// Invoke another actor in this actor's namespace and return its
    /// result bytes.
    pub async fn invoke_actor(
        &self,
        actor_id: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let call = InvokeActorCall {
            actor_id: actor_id.to_string(),
            operation: operation.to_string(),
            payload,
        };
        let encoded = serde_json::to_vec(&call).map_err(internal_serde)?;
        self.call(ACTOR_INVOKE_OPERATION, Bytes::from(encoded)).await
    }

    /// Schedule a one-shot invocation. An empty target means self.
    pub async fn schedule_invoke_after(
        &self,
        after: Duration,
        actor_id: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<()> {
        let call = ScheduleInvokeCall {
            after_millis: after.as_millis() as u64,
            invoke: InvokeActorCall {
                actor_id: actor_id.to_string(),
                operation: operation.to_string(),
                payload,
            },
        };
        let encoded = serde_json::to_vec(&call).map_err(internal_serde)?;
        self.call(SCHEDULE_INVOKE_OPERATION, Bytes::from(encoded))
            .await
            .map(|_| ())
    }

    fn schedule_invoke(&self, call: ScheduleInvokeCall) -> Result<Bytes> {
        // An omitted target means the actor is scheduling a timer for
        // itself.
        let target = if call.invoke.actor_id.is_empty() {
            self.actor_id.clone()
        } else {
            ActorId::new(self.actor_id.namespace(), call.invoke.actor_id)?
        };

        let dispatch = self.env.dispatch.clone();
        let source = self.actor_id.clone();
        let operation = call.invoke.operation;
        let payload = call.invoke.payload;
        let delay = Duration::from_millis(call.after_millis);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(
                source = %source,
                target = %target,
                operation = %operation,
                "firing scheduled invocation"
            );
            // Re-enters through the router, so it takes a fresh
            // serialization turn like any other invocation.
            if let Err(e) = dispatch(target.clone(), operation.clone(), payload).await {
                error!(
                    source = %source,
                    target = %target,
                    operation = %operation,
                    error = %e,
                    "scheduled invocation failed"
                );
            }
        });

        // The timer dies with the actor: eviction aborts it.
        if !self.timers.register(task.abort_handle()) {
            task.abort();
        }

        Ok(Bytes::new())
    }
}

fn internal_serde(e: serde_json::Error) -> Error {
    Error::internal(format!("host call encoding: {}", e))
}
