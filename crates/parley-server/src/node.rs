//! This node's place in the peer overlay.
//!
//! Peers are known by their hex Ed25519 public key. The node periodically
//! signs a `heartbeat` envelope and hands it to a [`PeerTransport`] for every
//! unblocked peer, and checks envelopes arriving from peers before anything
//! else sees them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use parley_shared::codec;
use parley_shared::constants::PUBKEY_SIZE;
use parley_shared::error::{CodecError, ProtocolError};
use parley_shared::protocol::HeartbeatPayload;
use parley_shared::{EnvelopeType, Identity, Payload, ProtocolEnvelope};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::ConnectionHub;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("cannot add this node as its own peer")]
    SelfPeer,

    #[error("invalid peer key: {0}")]
    InvalidKey(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("envelope sender does not match the peer it came from")]
    SenderMismatch,

    #[error("envelope signature does not verify")]
    BadSignature,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub public_key: String,
    pub address: String,
    pub nickname: String,
    pub is_blocked: bool,
    pub added_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Known peers keyed by public key. Never contains this node's own key.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    self_key: String,
    peers: HashMap<String, PeerInfo>,
}

impl PeerDirectory {
    pub fn new(self_key: impl Into<String>) -> Self {
        Self {
            self_key: self_key.into().to_lowercase(),
            peers: HashMap::new(),
        }
    }

    /// Add or re-address a peer. Returns `true` if it was new.
    pub fn add(&mut self, public_key: &str, address: &str) -> Result<bool, PeerError> {
        let key = normalize_key(public_key)?;
        if key == self.self_key {
            return Err(PeerError::SelfPeer);
        }

        if let Some(existing) = self.peers.get_mut(&key) {
            existing.address = address.to_string();
            return Ok(false);
        }

        debug!(peer = %key, addr = %address, "Tracking new peer");
        self.peers.insert(
            key.clone(),
            PeerInfo {
                public_key: key,
                address: address.to_string(),
                nickname: String::new(),
                is_blocked: false,
                added_at: Utc::now(),
                last_seen: None,
            },
        );
        Ok(true)
    }

    pub fn remove(&mut self, public_key: &str) -> Option<PeerInfo> {
        self.peers.remove(&public_key.to_lowercase())
    }

    pub fn block(&mut self, public_key: &str) -> Result<(), PeerError> {
        self.set_blocked(public_key, true)
    }

    pub fn unblock(&mut self, public_key: &str) -> Result<(), PeerError> {
        self.set_blocked(public_key, false)
    }

    fn set_blocked(&mut self, public_key: &str, blocked: bool) -> Result<(), PeerError> {
        let key = public_key.to_lowercase();
        let peer = self
            .peers
            .get_mut(&key)
            .ok_or(PeerError::UnknownPeer(key))?;
        peer.is_blocked = blocked;
        Ok(())
    }

    pub fn get(&self, public_key: &str) -> Option<&PeerInfo> {
        self.peers.get(&public_key.to_lowercase())
    }

    /// Snapshot of every peer, ordered by key.
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn normalize_key(public_key: &str) -> Result<String, PeerError> {
    let bytes = hex::decode(public_key.trim())
        .map_err(|e| PeerError::InvalidKey(e.to_string()))?;
    if bytes.len() != PUBKEY_SIZE {
        return Err(PeerError::InvalidKey(format!(
            "expected {PUBKEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(hex::encode(bytes))
}

/// Carries signed envelopes to a peer address.
pub trait PeerTransport: Send + Sync {
    fn send(&self, address: &str, envelope: &[u8]) -> Result<(), PeerError>;
}

/// Placeholder until an I2P (SAM) transport exists: logs and drops.
#[derive(Debug, Default)]
pub struct StubTransport {
    pub sam_address: String,
}

impl PeerTransport for StubTransport {
    fn send(&self, address: &str, envelope: &[u8]) -> Result<(), PeerError> {
        debug!(
            sam = %self.sam_address,
            to = %address,
            bytes = envelope.len(),
            "No peer transport, dropping envelope"
        );
        Ok(())
    }
}

pub struct Node {
    identity: Identity,
    i2p_address: String,
    peers: RwLock<PeerDirectory>,
    transport: Arc<dyn PeerTransport>,
    hub: Arc<ConnectionHub>,
}

impl Node {
    pub fn new(
        identity: Identity,
        i2p_address: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        let peers = PeerDirectory::new(identity.public_key_hex());
        Self {
            identity,
            i2p_address: i2p_address.into(),
            peers: RwLock::new(peers),
            transport,
            hub,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn add_peer(&self, public_key: &str, address: &str) -> Result<bool, PeerError> {
        self.peers.write().add(public_key, address)
    }

    pub fn remove_peer(&self, public_key: &str) -> Option<PeerInfo> {
        self.peers.write().remove(public_key)
    }

    pub fn block_peer(&self, public_key: &str) -> Result<(), PeerError> {
        self.peers.write().block(public_key)
    }

    pub fn unblock_peer(&self, public_key: &str) -> Result<(), PeerError> {
        self.peers.write().unblock(public_key)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().list()
    }

    /// Signed `heartbeat` announcing this node and its active rooms.
    pub fn heartbeat_envelope(&self) -> Result<ProtocolEnvelope, PeerError> {
        let active_rooms = self
            .hub
            .active_rooms()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        let mut envelope = ProtocolEnvelope::new(EnvelopeType::Heartbeat, self.identity.public_key_hex())
            .with_payload(Payload::Heartbeat(HeartbeatPayload {
                nickname: self.identity.nickname().to_string(),
                public_key: self.identity.public_key_hex(),
                i2p_address: self.i2p_address.clone(),
                active_rooms,
            }))?;
        codec::sign_with(&mut envelope, &self.identity)?;
        Ok(envelope)
    }

    /// Send one heartbeat to every unblocked peer. Returns how many took it.
    pub fn send_heartbeat(&self) -> Result<usize, PeerError> {
        let bytes = self.heartbeat_envelope()?.to_bytes()?;
        let targets: Vec<PeerInfo> = self
            .peers
            .read()
            .list()
            .into_iter()
            .filter(|p| !p.is_blocked)
            .collect();

        let mut sent = 0;
        for peer in targets {
            match self.transport.send(&peer.address, &bytes) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer.public_key, error = %e, "Heartbeat not sent"),
            }
        }
        Ok(sent)
    }

    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match self.send_heartbeat() {
                        Ok(sent) => debug!(sent, "Heartbeat"),
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    },
                }
            }
        })
    }

    /// Check an envelope received from the peer `from`.
    ///
    /// Returns `Ok(None)` for a blocked peer, whose traffic is dropped
    /// silently.
    pub fn process_incoming(&self, bytes: &[u8], from: &str) -> Result<Option<ProtocolEnvelope>, PeerError> {
        let envelope = ProtocolEnvelope::parse(bytes)?;
        let from = from.to_lowercase();

        let peer = self
            .peers
            .read()
            .get(&from)
            .cloned()
            .ok_or_else(|| PeerError::UnknownPeer(from.clone()))?;
        if peer.is_blocked {
            debug!(peer = %from, "Ignoring envelope from blocked peer");
            return Ok(None);
        }
        if envelope.from.to_lowercase() != peer.public_key {
            return Err(PeerError::SenderMismatch);
        }
        if !codec::verify_hex(&envelope, &peer.public_key) {
            warn!(peer = %from, kind = %envelope.kind, "Rejecting envelope with bad signature");
            return Err(PeerError::BadSignature);
        }

        let nickname = match envelope.resolve_payload()? {
            Payload::Heartbeat(heartbeat) => Some(heartbeat.nickname),
            _ => None,
        };
        if let Some(peer) = self.peers.write().peers.get_mut(&from) {
            peer.last_seen = Some(Utc::now());
            if let Some(nickname) = nickname {
                if peer.nickname != nickname {
                    info!(peer = %from, nickname = %nickname, "Peer nickname updated");
                    peer.nickname = nickname;
                }
            }
        }

        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use parley_store::MemoryStorage;

    use super::*;
    use crate::hub::{HubConfig, SessionUser};
    use crate::rooms::RoomAuthority;

    #[derive(Default)]
    struct Recorder {
        sent: parking_lot::Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl PeerTransport for Recorder {
        fn send(&self, address: &str, envelope: &[u8]) -> Result<(), PeerError> {
            self.sent.lock().push((address.to_string(), envelope.to_vec()));
            Ok(())
        }
    }

    fn node() -> (Node, Arc<Recorder>, Arc<ConnectionHub>, Arc<RoomAuthority>) {
        let rooms = Arc::new(RoomAuthority::new(Arc::new(MemoryStorage::new())));
        let hub = Arc::new(ConnectionHub::new(rooms.clone(), HubConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let node = Node::new(
            Identity::generate("node"),
            "node.b32.i2p",
            recorder.clone(),
            hub.clone(),
        );
        (node, recorder, hub, rooms)
    }

    #[test]
    fn directory_rejects_self_and_bad_keys() {
        let me = Identity::generate("me");
        let other = Identity::generate("other");
        let mut directory = PeerDirectory::new(me.public_key_hex());

        assert!(matches!(
            directory.add(&me.public_key_hex().to_uppercase(), "a"),
            Err(PeerError::SelfPeer)
        ));
        assert!(matches!(directory.add("abcd", "a"), Err(PeerError::InvalidKey(_))));

        assert!(directory.add(&other.public_key_hex(), "a").unwrap());
        assert!(!directory.add(&other.public_key_hex(), "b").unwrap());
        assert_eq!(directory.list()[0].address, "b");

        directory.block(&other.public_key_hex()).unwrap();
        assert!(directory.get(&other.public_key_hex()).unwrap().is_blocked);
        directory.unblock(&other.public_key_hex()).unwrap();
        assert!(!directory.get(&other.public_key_hex()).unwrap().is_blocked);

        assert!(directory.remove(&other.public_key_hex()).is_some());
        assert!(directory.is_empty());
        assert!(matches!(
            directory.block(&other.public_key_hex()),
            Err(PeerError::UnknownPeer(_))
        ));
    }

    #[test]
    fn heartbeat_is_signed_and_lists_active_rooms() {
        let (node, recorder, hub, rooms) = node();
        let room = rooms.create_room("General", "", false, "u1", "alice", "k1").unwrap();
        let (handle, _rx) = hub.open();
        hub.authenticate(
            handle.id(),
            SessionUser {
                user_id: "u1".into(),
                username: "alice".into(),
            },
        )
        .unwrap();
        hub.join_room(handle.id(), room.id).unwrap();

        let envelope = node.heartbeat_envelope().unwrap();
        assert_eq!(envelope.kind, EnvelopeType::Heartbeat);
        assert!(codec::verify_hex(&envelope, &node.identity().public_key_hex()));
        match envelope.resolve_payload().unwrap() {
            Payload::Heartbeat(payload) => {
                assert_eq!(payload.active_rooms, vec![room.id.to_string()]);
                assert_eq!(payload.i2p_address, "node.b32.i2p");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let a = Identity::generate("a");
        let b = Identity::generate("b");
        node.add_peer(&a.public_key_hex(), "addr-a").unwrap();
        node.add_peer(&b.public_key_hex(), "addr-b").unwrap();
        node.block_peer(&b.public_key_hex()).unwrap();

        assert_eq!(node.send_heartbeat().unwrap(), 1);
        let sent = recorder.sent.lock();
        assert_eq!(sent[0].0, "addr-a");
        assert!(ProtocolEnvelope::parse(&sent[0].1).is_ok());
    }

    #[test]
    fn incoming_envelopes_are_checked() {
        let (node, _recorder, _hub, _rooms) = node();
        let peer = Identity::generate("peer");
        let stranger = Identity::generate("stranger");

        let mut envelope = ProtocolEnvelope::new(EnvelopeType::Heartbeat, peer.public_key_hex())
            .with_payload(Payload::Heartbeat(HeartbeatPayload {
                nickname: "peer-nick".into(),
                public_key: peer.public_key_hex(),
                i2p_address: String::new(),
                active_rooms: vec![],
            }))
            .unwrap();
        codec::sign_with(&mut envelope, &peer).unwrap();
        let bytes = envelope.to_bytes().unwrap();

        assert!(matches!(
            node.process_incoming(&bytes, &peer.public_key_hex()),
            Err(PeerError::UnknownPeer(_))
        ));

        node.add_peer(&peer.public_key_hex(), "addr").unwrap();
        let accepted = node
            .process_incoming(&bytes, &peer.public_key_hex())
            .unwrap()
            .unwrap();
        assert_eq!(accepted, envelope);
        let info = node.peers().remove(0);
        assert_eq!(info.nickname, "peer-nick");
        assert!(info.last_seen.is_some());

        let mut forged = envelope.clone();
        forged.payload["nickname"] = "mallory".into();
        assert!(matches!(
            node.process_incoming(&forged.to_bytes().unwrap(), &peer.public_key_hex()),
            Err(PeerError::BadSignature)
        ));

        let mut resigned = envelope.clone();
        codec::sign_with(&mut resigned, &stranger).unwrap();
        assert!(matches!(
            node.process_incoming(&resigned.to_bytes().unwrap(), &peer.public_key_hex()),
            Err(PeerError::BadSignature)
        ));

        assert!(matches!(
            node.process_incoming(b"not json", &peer.public_key_hex()),
            Err(PeerError::Protocol(_))
        ));

        node.block_peer(&peer.public_key_hex()).unwrap();
        assert!(node
            .process_incoming(&bytes, &peer.public_key_hex())
            .unwrap()
            .is_none());
    }
}
