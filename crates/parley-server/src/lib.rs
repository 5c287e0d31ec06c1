//! # parley-server
//!
//! Group-chat node for the Parley network.
//!
//! This crate provides:
//! - **Room authority** owning rooms, members, roles, block flags and
//!   invite codes, persisted through `parley-store`
//! - **Connection hub** fanning signed messages out to WebSocket clients
//!   with bounded per-connection queues and ping/pong liveness
//! - **Sessions** running the JSON control plane (`auth`, `create_room`,
//!   `join_room`, `leave_room`, `send_message`, `get_messages`) and slash
//!   commands
//! - **Peer node** with a peer directory and a signed heartbeat loop
//! - **REST API** (axum) for health, node identity and public rooms, plus
//!   per-IP rate limiting

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod keyring;
pub mod node;
pub mod rate_limit;
pub mod rooms;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use parley_shared::Identity;
use parley_store::{MemoryStorage, SqliteStorage, Storage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::config::{ServerConfig, StorageBackend};
use crate::hub::{ConnectionHub, HubConfig};
use crate::keyring::Keyring;
use crate::node::{Node, StubTransport};
use crate::rate_limit::RateLimiter;
use crate::rooms::RoomAuthority;
use crate::session::ChatContext;

/// File name of the node identity inside the data directory.
const NODE_IDENTITY_FILE: &str = "identity.json";

/// Open storage, load rooms and wire every subsystem together.
pub fn bootstrap(config: ServerConfig) -> anyhow::Result<AppState> {
    let (storage, keyring, identity): (Arc<dyn Storage>, Keyring, Identity) = match config.storage {
        StorageBackend::Sqlite => (
            Arc::new(SqliteStorage::open_in_dir(&config.data_dir)?) as Arc<dyn Storage>,
            Keyring::persistent(config.data_dir.clone()),
            Identity::load_or_generate(
                &config.data_dir.join(NODE_IDENTITY_FILE),
                &config.node_nickname,
            )?,
        ),
        StorageBackend::Memory => (
            Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
            Keyring::ephemeral(),
            Identity::generate(config.node_nickname.clone()),
        ),
    };

    let rooms = Arc::new(RoomAuthority::new(storage.clone()));
    let loaded = rooms.load()?;
    info!(rooms = loaded, "Rooms loaded");

    let hub = Arc::new(ConnectionHub::new(
        rooms.clone(),
        HubConfig {
            queue_capacity: config.outbound_queue_capacity,
            ping_interval: config.ping_interval,
            liveness_timeout: config.liveness_timeout,
        },
    ));

    let chat = Arc::new(ChatContext {
        hub: hub.clone(),
        rooms,
        storage,
        keyring: Arc::new(keyring),
        send_limiter: RateLimiter::per_minute(config.send_rate_per_minute),
        write_timeout: config.write_timeout,
    });

    if config.i2p_enabled {
        warn!(sam = %config.sam_address, "I2P transport is not available, peer traffic is only logged");
    }
    let transport = Arc::new(StubTransport {
        sam_address: config.sam_address.clone(),
    });
    let node = Arc::new(Node::new(identity, String::new(), transport, hub));

    for peer in &config.peers {
        if let Err(e) = node.add_peer(&peer.public_key, &peer.address) {
            warn!(peer = %peer.public_key, error = %e, "Skipping bootstrap peer");
        }
    }

    info!(
        fingerprint = %node.identity().fingerprint(),
        peers = node.peers().len(),
        "Node identity ready"
    );

    Ok(AppState {
        chat,
        node,
        rate_limiter: RateLimiter::default(),
        config: Arc::new(config),
    })
}

/// Start the liveness sweep, the peer heartbeat and rate-limiter cleanup.
/// Every task stops when `shutdown` is cancelled.
pub fn spawn_background(state: &AppState, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![
        state.chat.hub.clone().spawn_liveness(shutdown.clone()),
        state
            .node
            .clone()
            .spawn_heartbeat(state.config.heartbeat_interval, shutdown.clone()),
    ];

    // Every 5 minutes, evict buckets idle for more than 10.
    let http_limiter = state.rate_limiter.clone();
    let send_limiter = state.chat.send_limiter.clone();
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    http_limiter.purge_stale(600.0).await;
                    send_limiter.purge_stale(600.0).await;
                }
            }
        }
    }));

    tasks
}
