//! Single-node end-to-end tests over the real HTTP surface

mod common;

use common::*;
use selkie_core::MODULE_SIZE_BYTES_MAX;
use selkie_registry::{MemoryRegistry, Registry};
use selkie_runtime::EnvironmentOptions;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

async fn boot_single() -> (Booted, Arc<MemoryRegistry>, reqwest::Client) {
    let registry = Arc::new(MemoryRegistry::new());
    let booted = boot("server-1", registry.clone(), EnvironmentOptions::default()).await;
    (booted, registry, reqwest::Client::new())
}

#[tokio::test]
async fn test_create_and_invoke() {
    let (booted, _registry, client) = boot_single().await;

    // Register the module bytes, then the actor record against it.
    let response = client
        .post(booted.url("/api/v1/register-module"))
        .header("namespace", NS)
        .header("module_id", MODULE)
        .body(vec![1u8, 2, 3])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let result: serde_json::Value = response.json().await.unwrap();
    assert_eq!(result["module_id"], MODULE);
    assert_eq!(result["size_bytes"], 3);

    let response = client
        .post(booted.url("/api/v1/create-actor"))
        .json(&serde_json::json!({
            "namespace": NS,
            "actor_id": "a",
            "module_id": MODULE,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = client
        .post(booted.url("/api/v1/invoke"))
        .json(&invoke_body("a", "keep-alive", b""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.bytes().await.unwrap().is_empty());

    assert_eq!(booted.env.num_activated_actors(), 1);
    assert_eq!(booted.lifecycle.startups.load(Ordering::SeqCst), 1);

    booted.shutdown().await;
}

#[tokio::test]
async fn test_invoke_returns_raw_result_bytes() {
    let (booted, _registry, client) = boot_single().await;

    register_and_create(&booted, &client, "echo-actor").await;

    let response = client
        .post(booted.url("/api/v1/invoke"))
        .json(&invoke_body("echo-actor", "echo", b"round and round"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), b"round and round");

    booted.shutdown().await;
}

#[tokio::test]
async fn test_module_bytes_roundtrip() {
    let (booted, registry, client) = boot_single().await;

    let module_bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let response = client
        .post(booted.url("/api/v1/register-module"))
        .header("namespace", NS)
        .header("module_id", "roundtrip")
        .body(module_bytes.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let (stored, _) = registry
        .get_module(NS, "roundtrip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.as_ref(), module_bytes.as_slice());

    booted.shutdown().await;
}

#[tokio::test]
async fn test_module_upload_body_limits() {
    let (booted, _registry, client) = boot_single().await;

    // Exactly at the limit: accepted.
    let response = client
        .post(booted.url("/api/v1/register-module"))
        .header("namespace", NS)
        .header("module_id", "at-limit")
        .body(vec![0u8; MODULE_SIZE_BYTES_MAX])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // One byte over: rejected.
    let response = client
        .post(booted.url("/api/v1/register-module"))
        .header("namespace", NS)
        .header("module_id", "over-limit")
        .body(vec![0u8; MODULE_SIZE_BYTES_MAX + 1])
        .send()
        .await
        .unwrap();
    assert_ne!(response.status().as_u16(), 200);

    booted.shutdown().await;
}

#[tokio::test]
async fn test_unknown_actor_and_operation_are_500() {
    let (booted, _registry, client) = boot_single().await;

    let response = client
        .post(booted.url("/api/v1/invoke"))
        .json(&invoke_body("never-created", "keep-alive", b""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);

    register_and_create(&booted, &client, "a").await;
    let response = client
        .post(booted.url("/api/v1/invoke"))
        .json(&invoke_body("a", "no-such-operation", b""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body = response.text().await.unwrap();
    assert!(body.contains("no-such-operation"));

    booted.shutdown().await;
}

#[tokio::test]
async fn test_invoke_direct_rejects_wrong_server() {
    let (booted, _registry, client) = boot_single().await;

    let response = client
        .post(booted.url("/api/v1/invoke-direct"))
        .json(&serde_json::json!({
            "server_id": "someone-else",
            "actor_id": {"namespace": NS, "id": "a"},
            "module_id": MODULE,
            "generation": 0,
            "operation": "keep-alive",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);

    booted.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_invocation_over_http() {
    let (booted, _registry, client) = boot_single().await;

    register_and_create(&booted, &client, "timer-actor").await;

    let response = client
        .post(booted.url("/api/v1/invoke"))
        .json(&invoke_body("timer-actor", "schedule-tick", b"x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The tick lands on a fresh serialization turn shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        if booted.lifecycle.ticks.load(Ordering::SeqCst) == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "scheduled tick never arrived"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    booted.shutdown().await;
}

async fn register_and_create(booted: &Booted, client: &reqwest::Client, actor_id: &str) {
    let response = client
        .post(booted.url("/api/v1/register-module"))
        .header("namespace", NS)
        .header("module_id", MODULE)
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    // The module may already be registered by an earlier helper call.
    assert!(response.status().as_u16() == 200 || response.status().as_u16() == 500);

    let response = client
        .post(booted.url("/api/v1/create-actor"))
        .json(&serde_json::json!({
            "namespace": NS,
            "actor_id": actor_id,
            "module_id": MODULE,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}
