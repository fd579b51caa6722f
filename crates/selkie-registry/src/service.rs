//! HTTP service exposing a registry to the rest of the cluster
//!
//! Mounted by whichever process currently acts as the leader. Each server
//! instance owns its own router; nothing registers into a process-wide mux.

use crate::error::RegistryError;
use crate::registry::Registry;
use crate::wire::*;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

type SharedRegistry = Arc<dyn Registry>;

/// Build the registry service router.
pub fn registry_router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/api/v1/registry/heartbeat", post(heartbeat))
        .route("/api/v1/registry/ensure-activation", post(ensure_activation))
        .route("/api/v1/registry/register-module", post(register_module))
        .route("/api/v1/registry/get-module", post(get_module))
        .route("/api/v1/registry/create-actor", post(create_actor))
        .route("/api/v1/registry/kv-get", post(kv_get))
        .route("/api/v1/registry/kv-put", post(kv_put))
        .route("/api/v1/registry/blacklist-server", post(blacklist_server))
        .route("/api/v1/registry/leave", post(leave))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

fn error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::NoServersAvailable => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::ActorNotFound { .. }
        | RegistryError::ModuleNotFound { .. }
        | RegistryError::ServerNotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::ActorAlreadyExists { .. } | RegistryError::ModuleAlreadyExists { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::from_error(&err))).into_response()
}

async fn heartbeat(
    State(registry): State<SharedRegistry>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    match registry
        .heartbeat(&req.server_id, req.address, req.load)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

async fn ensure_activation(
    State(registry): State<SharedRegistry>,
    Json(req): Json<selkie_core::EnsureActivationRequest>,
) -> Response {
    match registry.ensure_activation(req).await {
        Ok(references) => Json(EnsureActivationResponse { references }).into_response(),
        Err(err) => error_response(err),
    }
}

async fn register_module(
    State(registry): State<SharedRegistry>,
    Json(req): Json<RegisterModuleRequest>,
) -> Response {
    match registry
        .register_module(&req.namespace, &req.module_id, req.module_bytes, req.options)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_module(
    State(registry): State<SharedRegistry>,
    Json(req): Json<GetModuleRequest>,
) -> Response {
    match registry.get_module(&req.namespace, &req.module_id).await {
        Ok(module) => {
            let (module_bytes, options) = match module {
                Some((bytes, options)) => (Some(bytes), Some(options)),
                None => (None, None),
            };
            Json(GetModuleResponse {
                module_bytes,
                options,
            })
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn create_actor(
    State(registry): State<SharedRegistry>,
    Json(req): Json<CreateActorRegistryRequest>,
) -> Response {
    match registry
        .create_actor(&req.namespace, &req.actor_id, &req.module_id, req.options)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

async fn kv_get(State(registry): State<SharedRegistry>, Json(req): Json<KvGetRequest>) -> Response {
    match registry.actor_kv_get(&req.actor_id, &req.key).await {
        Ok(value) => Json(KvGetResponse { value }).into_response(),
        Err(err) => error_response(err),
    }
}

async fn kv_put(State(registry): State<SharedRegistry>, Json(req): Json<KvPutRequest>) -> Response {
    match registry.actor_kv_put(&req.actor_id, req.key, req.value).await {
        Ok(()) => Json(Ack::default()).into_response(),
        Err(err) => error_response(err),
    }
}

async fn blacklist_server(
    State(registry): State<SharedRegistry>,
    Json(req): Json<BlacklistServerRequest>,
) -> Response {
    match registry
        .blacklist_server(
            &req.server_id,
            &req.actor_id,
            Duration::from_millis(req.for_millis),
        )
        .await
    {
        Ok(()) => Json(Ack::default()).into_response(),
        Err(err) => error_response(err),
    }
}

async fn leave(State(registry): State<SharedRegistry>, Json(req): Json<LeaveRequest>) -> Response {
    match registry.leave(&req.server_id).await {
        Ok(()) => Json(Ack::default()).into_response(),
        Err(err) => error_response(err),
    }
}
