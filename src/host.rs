//! The seam between this crate and the actual peer-to-peer stack.
//!
//! Everything the discovery engine and connection pool need from the
//! underlying overlay — dial by address, dial by PeerID, open/accept a
//! typed byte stream, read the cached address book, observe discovery
//! events, publish listen addresses — is captured here as the `PeerHost`
//! trait. `Libp2pHost` is the concrete implementation; `FakeHost` is an
//! in-memory stand-in used by the pool/discovery unit tests so they do not
//! need a real network.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::{muxing::StreamMuxerBox, upgrade};
use libp2p::swarm::{Config as SwarmConfig, NetworkBehaviour, SwarmEvent};
use libp2p::{identity, kad, mdns, noise, relay, swarm::Swarm, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::DrpcError;

/// A trait object can only name one non-auto-trait, so `AsyncRead` and
/// `AsyncWrite` are folded into a single marker trait here with a blanket
/// impl over anything that is both.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An open, bidirectional byte stream to a remote peer. Concrete streams
/// (real libp2p streams, or the in-memory duplex halves `FakeHost` hands
/// out) are boxed behind this so the pool and bridge never depend on the
/// host implementation.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A stream of inbound peer connections for one registered stream-protocol,
/// as handed to [`crate::bridge::listener`]'s synthetic `hyper` listener.
pub type BoxedIncoming = std::pin::Pin<Box<dyn futures::Stream<Item = (PeerId, BoxedStream)> + Send>>;

/// Events the discovery engine's event-driven track subscribes to.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerDiscovered { peer: PeerId, addrs: Vec<Multiaddr> },
    PeerExpired { peer: PeerId },
}

/// The capability surface the core consumes from the underlying
/// peer-to-peer stack. Everything here is either a read of cached state or
/// a fire-and-observe-later action; the host owns all cryptographic
/// handshaking, transport selection, and wire-level peer discovery.
#[async_trait]
pub trait PeerHost: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this host is currently listening on.
    async fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Open an outbound stream to `peer` speaking `protocol`, dialing
    /// `addr` first if the host is not already connected.
    async fn open_stream(
        &self,
        peer: PeerId,
        addr: Option<Multiaddr>,
        protocol: StreamProtocol,
    ) -> Result<BoxedStream, DrpcError>;

    /// Dial an address directly, without opening a stream. Used by the
    /// fast-path and circuit-relay tracks, which only need a connection to
    /// exist before handing off to `open_stream`.
    async fn dial(&self, addr: Multiaddr) -> Result<(), DrpcError>;

    /// Dial by PeerID alone, letting the host resolve an address from its
    /// own address book (and, as a side effect, kick the DHT/mDNS search
    /// services for that peer).
    async fn dial_peer(&self, peer: PeerId) -> Result<(), DrpcError>;

    /// Addresses the host currently has cached for `peer` (identify
    /// exchanges, DHT lookups, mDNS announcements). Read-only.
    async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr>;

    /// Subscribe to peer-discovery events for the event-driven track.
    fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Evict the stale peer-store entry for `peer`, restart mDNS, and
    /// refresh the DHT routing table. Called by the event-driven track
    /// after an unexpected dial failure.
    async fn restart_discovery_services(&self, peer: PeerId);

    /// Register `protocol` as one this host accepts inbound streams for,
    /// returning the stream of connections as they arrive. Used by the E1
    /// peer-stream-to-listener adapter to feed an HTTP/2 server.
    async fn accept_protocol(&self, protocol: StreamProtocol) -> Result<BoxedIncoming, DrpcError>;
}

// ── Libp2pHost ────────────────────────────────────────────────────────────

#[derive(NetworkBehaviour)]
struct HostBehaviourInner {
    relay_client: relay::client::Behaviour,
    identify: libp2p::identify::Behaviour,
    ping: libp2p::ping::Behaviour,
    dcutr: libp2p::dcutr::Behaviour,
    autonat: libp2p::autonat::v2::client::Behaviour<rand::rngs::OsRng>,
    kad: kad::Behaviour<kad::store::MemoryStore>,
    mdns: mdns::tokio::Behaviour,
    stream: libp2p::stream::Behaviour,
}

enum HostCommand {
    Dial { addr: Multiaddr, reply: oneshot::Sender<Result<(), DrpcError>> },
    DialPeer { peer: PeerId, reply: oneshot::Sender<Result<(), DrpcError>> },
    OpenStream {
        peer: PeerId,
        addr: Option<Multiaddr>,
        protocol: StreamProtocol,
        reply: oneshot::Sender<Result<BoxedStream, DrpcError>>,
    },
    CachedAddresses { peer: PeerId, reply: oneshot::Sender<Vec<Multiaddr>> },
    RestartDiscovery { peer: PeerId },
    AcceptControl { reply: oneshot::Sender<libp2p::stream::Control> },
    ListenAddrs { reply: oneshot::Sender<Vec<Multiaddr>> },
}

/// Concrete `PeerHost` backed by a real libp2p swarm, driven on a
/// dedicated task so the public API can be plain async methods rather than
/// requiring callers to poll the swarm themselves.
pub struct Libp2pHost {
    local_peer_id: PeerId,
    commands: mpsc::Sender<HostCommand>,
    discovery_tx: broadcast::Sender<DiscoveryEvent>,
}

impl Libp2pHost {
    /// Build and spawn a host listening on `listen_addr`, loading (or
    /// creating) its identity keypair at `keypair_path`.
    pub fn spawn(listen_addr: Multiaddr, keypair_path: &Path) -> Result<Arc<Self>, DrpcError> {
        let keypair = load_or_create_keypair(keypair_path)?;
        let local_peer_id = PeerId::from(keypair.public());

        let transport = build_transport(&keypair)?;
        let (relay_transport, relay_client) = relay::client::new(local_peer_id);
        let transport = relay_transport
            .or_transport(transport)
            .map(|either, _| match either {
                futures::future::Either::Left((peer_id, conn)) => (peer_id, StreamMuxerBox::new(conn)),
                futures::future::Either::Right((peer_id, conn)) => (peer_id, StreamMuxerBox::new(conn)),
            })
            .boxed();

        let behaviour = HostBehaviourInner {
            relay_client,
            identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                "/drpc/1.0.0".into(),
                keypair.public(),
            )),
            ping: libp2p::ping::Behaviour::new(
                libp2p::ping::Config::new().with_interval(Duration::from_secs(15)),
            ),
            dcutr: libp2p::dcutr::Behaviour::new(local_peer_id),
            autonat: libp2p::autonat::v2::client::Behaviour::new(
                rand::rngs::OsRng,
                Default::default(),
            ),
            kad: kad::Behaviour::new(local_peer_id, kad::store::MemoryStore::new(local_peer_id)),
            mdns: mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                .map_err(|e| DrpcError::Internal(e.to_string()))?,
            stream: libp2p::stream::Behaviour::new(),
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(30)),
        );
        swarm
            .listen_on(listen_addr)
            .map_err(|e| DrpcError::Internal(e.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (discovery_tx, _) = broadcast::channel(256);

        let host = Arc::new(Libp2pHost { local_peer_id, commands: commands_tx, discovery_tx: discovery_tx.clone() });

        tokio::spawn(run_swarm(swarm, commands_rx, discovery_tx));

        Ok(host)
    }
}

#[async_trait]
impl PeerHost for Libp2pHost {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn listen_addrs(&self) -> Vec<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HostCommand::ListenAddrs { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        addr: Option<Multiaddr>,
        protocol: StreamProtocol,
    ) -> Result<BoxedStream, DrpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::OpenStream { peer, addr, protocol, reply })
            .await
            .map_err(|_| DrpcError::Internal("host task gone".into()))?;
        rx.await.map_err(|_| DrpcError::Internal("host task dropped reply".into()))?
    }

    async fn dial(&self, addr: Multiaddr) -> Result<(), DrpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Dial { addr, reply })
            .await
            .map_err(|_| DrpcError::Internal("host task gone".into()))?;
        rx.await.map_err(|_| DrpcError::Internal("host task dropped reply".into()))?
    }

    async fn dial_peer(&self, peer: PeerId) -> Result<(), DrpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::DialPeer { peer, reply })
            .await
            .map_err(|_| DrpcError::Internal("host task gone".into()))?;
        rx.await.map_err(|_| DrpcError::Internal("host task dropped reply".into()))?
    }

    async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HostCommand::CachedAddresses { peer, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery_tx.subscribe()
    }

    async fn restart_discovery_services(&self, peer: PeerId) {
        let _ = self.commands.send(HostCommand::RestartDiscovery { peer }).await;
    }

    async fn accept_protocol(&self, protocol: StreamProtocol) -> Result<BoxedIncoming, DrpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::AcceptControl { reply })
            .await
            .map_err(|_| DrpcError::Internal("host task gone".into()))?;
        let mut control = rx.await.map_err(|_| DrpcError::Internal("host task dropped reply".into()))?;
        let incoming = control
            .accept(protocol)
            .map_err(|e| DrpcError::Internal(e.to_string()))?;
        Ok(Box::pin(incoming.map(|(peer, stream)| (peer, Box::new(stream) as BoxedStream))))
    }
}

async fn run_swarm(
    mut swarm: Swarm<HostBehaviourInner>,
    mut commands: mpsc::Receiver<HostCommand>,
    discovery_tx: broadcast::Sender<DiscoveryEvent>,
) {
    // Pending dial/open-stream replies keyed by the peer they are waiting
    // on; `sven-p2p::node`'s `pending_outbound`/`pending_inbound` maps are
    // the template for this bookkeeping, generalized from a fixed
    // request-response protocol to arbitrary stream opens.
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), DrpcError>>>> = HashMap::new();
    let mut listen_addrs: Vec<Multiaddr> = Vec::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(HostCommand::Dial { addr, reply }) => {
                        match swarm.dial(addr.clone()) {
                            Ok(()) => {
                                if let Some(peer) = crate::address::peer_id_from_addr(&addr) {
                                    pending_dials.entry(peer).or_default().push(reply);
                                } else {
                                    let _ = reply.send(Ok(()));
                                }
                            }
                            Err(e) => { let _ = reply.send(Err(DrpcError::NoReachablePeer(e.to_string()))); }
                        }
                    }
                    Some(HostCommand::DialPeer { peer, reply }) => {
                        swarm.behaviour_mut().kad.get_closest_peers(peer);
                        match swarm.dial(peer) {
                            Ok(()) => pending_dials.entry(peer).or_default().push(reply),
                            Err(e) => { let _ = reply.send(Err(DrpcError::NoReachablePeer(e.to_string()))); }
                        }
                    }
                    Some(HostCommand::OpenStream { peer, addr, protocol, reply }) => {
                        if let Some(addr) = addr {
                            let _ = swarm.dial(addr);
                        }
                        let mut control = swarm.behaviour().stream.new_control();
                        tokio::spawn(async move {
                            let result = control
                                .open_stream(peer, protocol)
                                .await
                                .map(|s| Box::new(s) as BoxedStream)
                                .map_err(|e| DrpcError::NoReachablePeer(e.to_string()));
                            let _ = reply.send(result);
                        });
                    }
                    Some(HostCommand::CachedAddresses { peer, reply }) => {
                        let addrs = swarm.behaviour_mut().kad.kbucket(peer)
                            .map(|bucket| {
                                bucket.iter()
                                    .flat_map(|entry| entry.node.value.iter().cloned().collect::<Vec<_>>())
                                    .collect()
                            })
                            .unwrap_or_default();
                        let _ = reply.send(addrs);
                    }
                    Some(HostCommand::RestartDiscovery { peer }) => {
                        tracing::debug!(%peer, "restarting discovery services after dial failure");
                        swarm.behaviour_mut().kad.get_closest_peers(peer);
                    }
                    Some(HostCommand::AcceptControl { reply }) => {
                        let _ = reply.send(swarm.behaviour().stream.new_control());
                    }
                    Some(HostCommand::ListenAddrs { reply }) => {
                        let _ = reply.send(listen_addrs.clone());
                    }
                    None => break,
                }
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &mut pending_dials, &discovery_tx, &mut listen_addrs);
            }
        }
    }
}

fn handle_swarm_event(
    event: SwarmEvent<HostBehaviourInnerEvent>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), DrpcError>>>>,
    discovery_tx: &broadcast::Sender<DiscoveryEvent>,
    listen_addrs: &mut Vec<Multiaddr>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            if !listen_addrs.contains(&address) {
                listen_addrs.push(address);
            }
        }
        SwarmEvent::ExpiredListenAddr { address, .. } => {
            listen_addrs.retain(|a| *a != address);
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for w in waiters {
                    let _ = w.send(Ok(()));
                }
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for w in waiters {
                    let _ = w.send(Err(DrpcError::NoReachablePeer(error.to_string())));
                }
            }
        }
        SwarmEvent::Behaviour(HostBehaviourInnerEvent::Mdns(mdns::Event::Discovered(list))) => {
            let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
            for (peer, addr) in list {
                by_peer.entry(peer).or_default().push(addr);
            }
            for (peer, addrs) in by_peer {
                let _ = discovery_tx.send(DiscoveryEvent::PeerDiscovered { peer, addrs });
            }
        }
        SwarmEvent::Behaviour(HostBehaviourInnerEvent::Mdns(mdns::Event::Expired(list))) => {
            for (peer, _) in list {
                let _ = discovery_tx.send(DiscoveryEvent::PeerExpired { peer });
            }
        }
        SwarmEvent::Behaviour(HostBehaviourInnerEvent::Identify(libp2p::identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            let _ = discovery_tx.send(DiscoveryEvent::PeerDiscovered { peer: peer_id, addrs: info.listen_addrs });
        }
        _ => {}
    }
}

fn build_transport(
    key: &identity::Keypair,
) -> Result<libp2p::core::transport::Boxed<(PeerId, StreamMuxerBox)>, DrpcError> {
    let noise_config = noise::Config::new(key).map_err(|e| DrpcError::Internal(e.to_string()))?;
    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
        .boxed();
    Ok(transport)
}

/// Load a persisted keypair, or generate and persist a fresh one. Refuses
/// to silently rotate identity on a corrupt or unrecognized file.
fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, DrpcError> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| DrpcError::Internal(e.to_string()))?;

        if let Ok(key) = identity::Keypair::from_protobuf_encoding(&raw) {
            return Ok(key);
        }

        if raw.len() == 32 {
            if let Ok(secret) = identity::ed25519::SecretKey::try_from_bytes(&mut raw.clone()) {
                let key = identity::Keypair::from(identity::ed25519::Keypair::from(secret));
                tracing::info!(path = %path.display(), "migrating legacy raw-ed25519 keypair to protobuf encoding");
                let encoded = key.to_protobuf_encoding().map_err(|e| DrpcError::Internal(e.to_string()))?;
                fs::write(path, &encoded).map_err(|e| DrpcError::Internal(e.to_string()))?;
                return Ok(key);
            }
        }

        return Err(DrpcError::Internal(format!(
            "keypair file '{}' ({} bytes) is neither protobuf nor legacy raw-ed25519; delete it to generate a fresh identity",
            path.display(),
            raw.len()
        )));
    }

    let key = identity::Keypair::generate_ed25519();
    let raw = key.to_protobuf_encoding().map_err(|e| DrpcError::Internal(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DrpcError::Internal(e.to_string()))?;
    }
    fs::write(path, &raw).map_err(|e| DrpcError::Internal(e.to_string()))?;
    tracing::info!(path = %path.display(), "generated new host identity");
    Ok(key)
}

// ── FakeHost ──────────────────────────────────────────────────────────────

/// In-memory `PeerHost` for unit tests: no networking, addresses are
/// whatever the test registers, streams are in-process duplex pipes.
pub struct FakeHost {
    local_peer_id: PeerId,
    addresses: std::sync::Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
    reachable: std::sync::Mutex<HashMap<PeerId, bool>>,
    discovery_tx: broadcast::Sender<DiscoveryEvent>,
    dial_attempts: std::sync::atomic::AtomicUsize,
    incoming_tx: mpsc::UnboundedSender<(PeerId, BoxedStream)>,
    incoming_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(PeerId, BoxedStream)>>>,
    listen: std::sync::Mutex<Vec<Multiaddr>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        let (discovery_tx, _) = broadcast::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(FakeHost {
            local_peer_id: PeerId::random(),
            addresses: std::sync::Mutex::new(HashMap::new()),
            reachable: std::sync::Mutex::new(HashMap::new()),
            discovery_tx,
            dial_attempts: std::sync::atomic::AtomicUsize::new(0),
            incoming_tx,
            incoming_rx: std::sync::Mutex::new(Some(incoming_rx)),
            listen: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Feed a fake inbound connection to whoever calls `accept_protocol`.
    pub fn push_incoming(&self, peer: PeerId, stream: BoxedStream) {
        let _ = self.incoming_tx.send((peer, stream));
    }

    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        self.reachable.lock().unwrap().insert(peer, reachable);
    }

    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.listen.lock().unwrap() = addrs;
    }

    pub fn set_cached_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.addresses.lock().unwrap().insert(peer, addrs);
    }

    pub fn announce(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let _ = self.discovery_tx.send(DiscoveryEvent::PeerDiscovered { peer, addrs });
    }

    pub fn dial_attempts(&self) -> usize {
        self.dial_attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn is_reachable(&self, peer: &PeerId) -> bool {
        *self.reachable.lock().unwrap().get(peer).unwrap_or(&false)
    }
}

#[cfg(test)]
mod keypair_tests {
    use super::*;

    #[test]
    fn generates_and_persists_a_fresh_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        assert!(!path.exists());

        let key = load_or_create_keypair(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_create_keypair(&path).unwrap();
        assert_eq!(PeerId::from(key.public()), PeerId::from(reloaded.public()));
    }

    #[test]
    fn migrates_a_legacy_raw_ed25519_keypair_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let secret_bytes = [7u8; 32];
        std::fs::write(&path, secret_bytes).unwrap();

        let loaded = load_or_create_keypair(&path).unwrap();

        let expected_secret = identity::ed25519::SecretKey::try_from_bytes(&mut secret_bytes.clone()).unwrap();
        let expected = identity::Keypair::from(identity::ed25519::Keypair::from(expected_secret));
        assert_eq!(PeerId::from(loaded.public()), PeerId::from(expected.public()));

        // migration rewrites the file to protobuf encoding in place
        let raw = std::fs::read(&path).unwrap();
        assert!(identity::Keypair::from_protobuf_encoding(&raw).is_ok());
    }

    #[test]
    fn rejects_an_unrecognized_keypair_file_rather_than_silently_rotating_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"not a keypair").unwrap();

        let err = load_or_create_keypair(&path).unwrap_err();
        assert!(matches!(err, DrpcError::Internal(_)));
    }
}

#[async_trait]
impl PeerHost for FakeHost {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.lock().unwrap().clone()
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        _addr: Option<Multiaddr>,
        _protocol: StreamProtocol,
    ) -> Result<BoxedStream, DrpcError> {
        self.dial_attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.is_reachable(&peer) {
            return Err(DrpcError::NoReachablePeer(peer.to_string()));
        }
        let (a, _b) = tokio::io::duplex(4096);
        Ok(Box::new(a))
    }

    async fn dial(&self, addr: Multiaddr) -> Result<(), DrpcError> {
        self.dial_attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let peer = crate::address::peer_id_from_addr(&addr)
            .ok_or_else(|| DrpcError::InvalidAddress(addr.to_string()))?;
        if self.is_reachable(&peer) {
            Ok(())
        } else {
            Err(DrpcError::NoReachablePeer(peer.to_string()))
        }
    }

    async fn dial_peer(&self, peer: PeerId) -> Result<(), DrpcError> {
        self.dial_attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.is_reachable(&peer) {
            Ok(())
        } else {
            Err(DrpcError::NoReachablePeer(peer.to_string()))
        }
    }

    async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr> {
        self.addresses.lock().unwrap().get(&peer).cloned().unwrap_or_default()
    }

    fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery_tx.subscribe()
    }

    async fn restart_discovery_services(&self, _peer: PeerId) {}

    async fn accept_protocol(&self, _protocol: StreamProtocol) -> Result<BoxedIncoming, DrpcError> {
        let rx = self
            .incoming_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DrpcError::Internal("accept_protocol called twice on FakeHost".into()))?;
        Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
    }
}
