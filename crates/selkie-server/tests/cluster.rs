//! Multi-node end-to-end tests: three servers sharing a leader-backed
//! registry, forced onto the real remote invocation path.

mod common;

use bytes::Bytes;
use common::*;
use selkie_registry::{FixedLeaderProvider, LeaderRegistry, MemoryRegistryOptions, Registry};
use selkie_runtime::{EnvironmentOptions, InvokeOptions};
use std::sync::Arc;
use std::time::Duration;

const NUM_ACTORS: usize = 10;

async fn cluster(registry_options: MemoryRegistryOptions) -> Vec<Booted> {
    let provider = Arc::new(FixedLeaderProvider::new("127.0.0.1:1".parse().unwrap()));

    let mut servers = Vec::new();
    for idx in 0..3 {
        let registry = Arc::new(
            LeaderRegistry::bind(
                provider.clone(),
                "127.0.0.1:0".parse().unwrap(),
                registry_options.clone(),
            )
            .await
            .unwrap(),
        );
        if idx == 0 {
            // Every replica forwards to the first server's registry.
            provider.set_leader(registry.local_addr());
        }

        let registry: Arc<dyn Registry> = registry;
        let booted = boot(
            &format!("env-server-{}", idx),
            registry,
            EnvironmentOptions {
                // Exercise the real remote path even for local placements.
                force_remote_procedure_calls: true,
                gc_actors_after_duration_with_no_invocations: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await;
        servers.push(booted);
    }

    servers
}

fn actor_id(idx: usize) -> String {
    format!("actor-{}", idx)
}

fn create() -> InvokeOptions {
    InvokeOptions::create_if_not_exist(MODULE)
}

async fn invoke_from(server: &Booted, actor: &str, operation: &str) {
    server
        .env
        .invoke_with_options(NS, actor, operation, Bytes::new(), create())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_balancing() {
    let servers = cluster(MemoryRegistryOptions::default()).await;

    for i in 0..NUM_ACTORS {
        invoke_from(&servers[0], &actor_id(i), "keep-alive").await;
    }

    let counts: Vec<u64> = servers.iter().map(|s| s.env.num_activated_actors()).collect();
    assert_eq!(counts.iter().sum::<u64>(), NUM_ACTORS as u64, "{:?}", counts);
    for count in &counts {
        assert!(
            *count == 3 || *count == 4,
            "unbalanced distribution: {:?}",
            counts
        );
    }

    for server in servers {
        server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_memory_rebalancing_drains_heavy_server() {
    let servers = cluster(MemoryRegistryOptions {
        memory_usage_limit_bytes: 8 * 1024 * 1024,
        ..Default::default()
    })
    .await;

    for i in 0..NUM_ACTORS {
        invoke_from(&servers[0], &actor_id(i), "keep-alive").await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut first_round = true;

    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster never converged"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Keep making actor-0 heavier.
        invoke_from(&servers[0], &actor_id(0), "inc-memory-usage").await;

        for j in 0..NUM_ACTORS {
            if first_round {
                // Rebalancing only runs when more than one actor on the
                // overloaded server has nonzero memory usage; a server
                // whose only nonzero-memory actor is the heavy one would
                // just move the problem elsewhere. Give every actor some
                // memory so the balancer is allowed to act.
                invoke_from(&servers[0], &actor_id(j), "inc-memory-usage").await;
            }
            invoke_from(&servers[0], &actor_id(j), "keep-alive").await;
        }
        first_round = false;

        let counts: Vec<u64> = servers.iter().map(|s| s.env.num_activated_actors()).collect();
        let memory: Vec<u64> = servers.iter().map(|s| s.env.used_memory_bytes()).collect();

        // The server hosting the heavy actor should drain down to just the
        // heavy actor as the low-memory actors are migrated away.
        let heavy = (0..servers.len())
            .max_by_key(|&i| memory[i])
            .unwrap_or(0);
        if counts[heavy] != 1 {
            continue;
        }

        // The other two servers should stabilize within one actor of each
        // other.
        let others: Vec<u64> = (0..servers.len())
            .filter(|&i| i != heavy)
            .map(|i| counts[i])
            .collect();
        if others[0].abs_diff(others[1]) > 1 {
            continue;
        }

        // And every actor should be activated somewhere.
        if counts.iter().sum::<u64>() != NUM_ACTORS as u64 {
            continue;
        }

        break;
    }

    for server in servers {
        server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blacklist_reroutes_transparently() {
    let servers = cluster(MemoryRegistryOptions::default()).await;

    invoke_from(&servers[0], "actor-5", "keep-alive").await;

    let host = (0..servers.len())
        .find(|&i| servers[i].env.num_activated_actors() == 1)
        .expect("actor-5 activated nowhere");

    servers[host]
        .env
        .blacklist_actor(NS, "actor-5", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(servers[host].env.num_activated_actors(), 0);

    // The caller sees plain success; the router absorbs the 410 and the
    // re-route.
    invoke_from(&servers[0], "actor-5", "keep-alive").await;

    assert_eq!(servers[host].env.num_activated_actors(), 0);
    let total: u64 = servers.iter().map(|s| s.env.num_activated_actors()).sum();
    assert_eq!(total, 1);

    for server in servers {
        server.shutdown().await;
    }
}
