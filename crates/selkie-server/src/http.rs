//! HTTP handlers for the public wire surface
//!
//! | Path                      | Body limit | Timeout |
//! |---------------------------|-----------:|--------:|
//! | `/api/v1/register-module` |     16 MiB |     60s |
//! | `/api/v1/create-actor`    |      1 MiB |      5s |
//! | `/api/v1/invoke`          |     16 MiB |      5s |
//! | `/api/v1/invoke-direct`   |     16 MiB |      5s |
//!
//! Every server owns its own router so several servers can coexist in one
//! process.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use selkie_core::types::b64;
use selkie_core::{
    Error, CREATE_ACTOR_BODY_BYTES_MAX, INVOKE_BODY_BYTES_MAX, INVOKE_TIMEOUT_MS,
    MODULE_SIZE_BYTES_MAX, MODULE_UPLOAD_TIMEOUT_MS,
};
use selkie_registry::Registry;
use selkie_runtime::{Environment, InvokeDirectRequest};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    registry: Arc<dyn Registry>,
    environment: Environment,
}

/// The HTTP server for one Selkie environment.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(registry: Arc<dyn Registry>, environment: Environment) -> Self {
        Self {
            state: AppState {
                registry,
                environment,
            },
        }
    }

    /// Build this server's router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/v1/register-module",
                post(register_module).route_layer(DefaultBodyLimit::max(MODULE_SIZE_BYTES_MAX)),
            )
            .route(
                "/api/v1/create-actor",
                post(create_actor).route_layer(DefaultBodyLimit::max(CREATE_ACTOR_BODY_BYTES_MAX)),
            )
            .route(
                "/api/v1/invoke",
                post(invoke).route_layer(DefaultBodyLimit::max(INVOKE_BODY_BYTES_MAX)),
            )
            .route(
                "/api/v1/invoke-direct",
                post(invoke_direct).route_layer(DefaultBodyLimit::max(INVOKE_BODY_BYTES_MAX)),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind an ephemeral or fixed address and serve in the background.
    ///
    /// Returns the bound address; the task runs until aborted or the
    /// process exits.
    pub async fn bind(&self, addr: SocketAddr) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Error> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::internal(e.to_string()))?;
        let router = self.router();

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "server terminated");
            }
        });

        info!(addr = %local_addr, "server listening");
        Ok((local_addr, task))
    }

    /// Serve on the given port until the process exits.
    pub async fn start(&self, port: u16) -> Result<(), Error> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("bind {}: {}", addr, e)))?;

        info!(port, "server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::internal(e.to_string()))
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct InvokeRequest {
    namespace: String,
    actor_id: String,
    operation: String,
    #[serde(default = "Bytes::new", with = "b64")]
    payload: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateActorRequest {
    namespace: String,
    actor_id: String,
    module_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

fn error_response(err: Error) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// Run a handler body under its wire deadline.
async fn with_deadline<F>(operation: &str, timeout: Duration, fut: F) -> Result<Response, Error>
where
    F: Future<Output = Result<Response, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::OperationTimedOut {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn register_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let namespace = match required_header(&headers, "namespace") {
        Ok(value) => value,
        Err(err) => return error_response(err),
    };
    let module_id = match required_header(&headers, "module_id") {
        Ok(value) => value,
        Err(err) => return error_response(err),
    };

    let result = with_deadline(
        "register-module",
        Duration::from_millis(MODULE_UPLOAD_TIMEOUT_MS),
        async {
            let result = state
                .registry
                .register_module(&namespace, &module_id, body, Default::default())
                .await
                .map_err(Error::from)?;
            Ok(Json(result).into_response())
        },
    )
    .await;

    result.unwrap_or_else(error_response)
}

async fn create_actor(
    State(state): State<AppState>,
    Json(request): Json<CreateActorRequest>,
) -> Response {
    let result = with_deadline(
        "create-actor",
        Duration::from_millis(INVOKE_TIMEOUT_MS),
        async {
            let result = state
                .registry
                .create_actor(
                    &request.namespace,
                    &request.actor_id,
                    &request.module_id,
                    Default::default(),
                )
                .await
                .map_err(Error::from)?;
            Ok(Json(result).into_response())
        },
    )
    .await;

    result.unwrap_or_else(error_response)
}

async fn invoke(State(state): State<AppState>, Json(request): Json<InvokeRequest>) -> Response {
    let result = with_deadline("invoke", Duration::from_millis(INVOKE_TIMEOUT_MS), async {
        let body = state
            .environment
            .invoke(
                &request.namespace,
                &request.actor_id,
                &request.operation,
                request.payload,
            )
            .await?;
        Ok(body.into_response())
    })
    .await;

    result.unwrap_or_else(error_response)
}

async fn invoke_direct(
    State(state): State<AppState>,
    Json(request): Json<InvokeDirectRequest>,
) -> Response {
    let result = with_deadline(
        "invoke-direct",
        Duration::from_millis(INVOKE_TIMEOUT_MS),
        async {
            let body = state.environment.invoke_direct(request).await?;
            Ok(body.into_response())
        },
    )
    .await;

    result.unwrap_or_else(error_response)
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, Error> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| Error::internal(format!("missing required header: {}", name)))
}
