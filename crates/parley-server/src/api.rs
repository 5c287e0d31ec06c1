use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::Method,
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::RoomId;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ServerConfig, StorageBackend};
use crate::error::ServerError;
use crate::node::Node;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::rooms::Room;
use crate::session::{run_session, ChatContext};
use crate::transport;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatContext>,
    pub node: Arc<Node>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/api/identity", get(node_identity))
        .route("/api/rooms", get(public_rooms))
        .route("/api/rooms/:id", get(public_room))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerInfoResponse {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub storage: String,
    pub rooms: usize,
    pub connections: usize,
    pub peers: usize,
    pub i2p_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub nickname: String,
    /// Base64url public key.
    pub public_key: String,
    pub fingerprint: String,
}

/// Listing entry for a public room.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublicRoom {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub invite_code: String,
    pub members: usize,
    pub online: usize,
    pub created_at: DateTime<Utc>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    let storage = match state.config.storage {
        StorageBackend::Sqlite => "sqlite",
        StorageBackend::Memory => "memory",
    };
    Json(ServerInfoResponse {
        name: state.node.identity().nickname().to_string(),
        version: env!("CARGO_PKG_VERSION").into(),
        protocol_version: PROTOCOL_VERSION.into(),
        storage: storage.into(),
        rooms: state.chat.rooms.room_count(),
        connections: state.chat.hub.connection_count(),
        peers: state.node.peers().len(),
        i2p_enabled: state.config.i2p_enabled,
    })
}

async fn node_identity(State(state): State<AppState>) -> Json<IdentityResponse> {
    let identity = state.node.identity();
    Json(IdentityResponse {
        nickname: identity.nickname().to_string(),
        public_key: identity.encoded_public_key(),
        fingerprint: identity.fingerprint(),
    })
}

async fn public_rooms(State(state): State<AppState>) -> Json<Vec<PublicRoom>> {
    let rooms = state
        .chat
        .rooms
        .list_rooms()
        .iter()
        .filter(|room| !room.is_private)
        .map(|room| public_room_entry(&state, room))
        .collect();
    Json(rooms)
}

async fn public_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PublicRoom>, ServerError> {
    let id: RoomId = id
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid room id: {id}")))?;
    let room = state.chat.rooms.get_room(id)?;
    if room.is_private {
        return Err(ServerError::NotFound("room".into()));
    }
    Ok(Json(public_room_entry(&state, &room)))
}

fn public_room_entry(state: &AppState, room: &Room) -> PublicRoom {
    PublicRoom {
        id: room.id,
        name: room.name.clone(),
        description: room.description.clone(),
        invite_code: room.invite_code.clone(),
        members: room.members.len(),
        online: state.chat.hub.subscriber_count(room.id),
        created_at: room.created_at,
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let chat = state.chat.clone();
    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = transport::websocket(socket);
            run_session(chat, sink, stream).await;
        })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already bound listener.
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
