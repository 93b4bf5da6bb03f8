//! Races five concurrent strategies ("tracks") to resolve a target peer to
//! an open connection as fast as possible. The first track to succeed wins
//! and the rest are dropped; `tokio::select!` inside [`resolve_peer`] is
//! the cancellation point for every sibling.
//!
//! Grounded on `sven-p2p::node::NodeState::event_loop`'s `tokio::select!`
//! over swarm events / poll interval / relay-poll interval / command
//! channel / ctrl_c — the same shape, generalized from "keep room
//! membership fresh" to "resolve exactly one target peer".

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::time::{interval, MissedTickBehavior};

use crate::address;
use crate::error::DrpcError;
use crate::host::{DiscoveryEvent, PeerHost};
use crate::pool::{ConnectionPool, Leased};

/// Which of the five tracks produced (or is attempting) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Track {
    FastPath,
    PeerStore,
    ActiveSearch,
    CircuitRelay,
    EventDriven,
}

/// Not persisted; exists for tie-breaking (§4.D "Ordering and tie-break")
/// and for structured logging of which strategy resolved a given call.
#[derive(Debug, Clone)]
pub struct DiscoveryAttempt {
    pub target_peer: PeerId,
    pub method: Track,
    pub start_time: Instant,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success { connect_time: Duration },
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub standard_interval: Duration,
    pub total_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            standard_interval: Duration::from_millis(400),
            total_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of [`resolve`]: either a connected peer (with the leased stream
/// already opened through the pool) or a timeout, mirroring S6's
/// `{status:"timeout", addr:null, method:"peer-discovery"}`.
pub enum Resolution {
    Connected { peer: PeerId, leased: Leased, attempt: DiscoveryAttempt },
    Timeout,
}

/// Resolve an address-parser output (possibly naming several candidate
/// peers, e.g. from a gateway comma-list) to an open stream. Every
/// candidate peer races independently; the first to connect wins and the
/// rest are abandoned.
pub async fn resolve<H: PeerHost + 'static>(
    pool: &ConnectionPool<H>,
    host: &H,
    targets: BTreeMap<PeerId, Vec<Multiaddr>>,
    protocol: StreamProtocol,
    config: &DiscoveryConfig,
) -> Result<Resolution, DrpcError> {
    if targets.is_empty() {
        return Err(DrpcError::InvalidAddress("no target peers".into()));
    }

    let mut races = futures::stream::FuturesUnordered::new();
    for (peer, addrs) in targets {
        let protocol = protocol.clone();
        races.push(async move {
            match resolve_peer(host, peer, addrs, config).await {
                Ok(attempt) => {
                    let leased = pool.get_stream(peer, None, protocol).await?;
                    Ok(Resolution::Connected { peer, leased, attempt })
                }
                Err(e) => Err(e),
            }
        });
    }

    let total = tokio::time::timeout(config.total_timeout, async {
        use futures::StreamExt;
        let mut last_err = None;
        while let Some(result) = races.next().await {
            match result {
                Ok(resolution) => return Ok(resolution),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| DrpcError::NoReachablePeer("no candidate peer resolved".into())))
    })
    .await;

    match total {
        Ok(result) => result,
        Err(_) => Ok(Resolution::Timeout),
    }
}

/// Race the five tracks for a single target peer. Returns once any track
/// connects or errors; `resolve`'s outer `tokio::time::timeout` is the sole
/// owner of the `total_timeout` deadline (an inner deadline here would race
/// the outer one and could surface `DeadlineExceeded` instead of S6's
/// `{status:"timeout"}` shape under scheduling jitter).
pub async fn resolve_peer<H: PeerHost>(
    host: &H,
    peer: PeerId,
    input_addrs: Vec<Multiaddr>,
    config: &DiscoveryConfig,
) -> Result<DiscoveryAttempt, DrpcError> {
    let start = Instant::now();
    let fast_path_addr = input_addrs.iter().find(|a| !address::is_circuit_address(a)).cloned();
    let circuit_addr = input_addrs.iter().find(|a| address::is_circuit_address(a)).cloned();

    tokio::select! {
        r = track_fast_path(host, fast_path_addr) => finish(peer, Track::FastPath, start, r),
        r = track_peer_store(host, peer, config.standard_interval) => finish(peer, Track::PeerStore, start, r),
        r = track_active_search(host, peer, config.standard_interval) => finish(peer, Track::ActiveSearch, start, r),
        r = track_circuit_relay(host, circuit_addr, config.standard_interval) => finish(peer, Track::CircuitRelay, start, r),
        r = track_event_driven(host, peer, config.standard_interval) => finish(peer, Track::EventDriven, start, r),
    }
}

fn finish(
    peer: PeerId,
    method: Track,
    start: Instant,
    result: Result<(), DrpcError>,
) -> Result<DiscoveryAttempt, DrpcError> {
    match result {
        Ok(()) => {
            tracing::info!(%peer, ?method, elapsed = ?start.elapsed(), "peer resolved");
            Ok(DiscoveryAttempt {
                target_peer: peer,
                method,
                start_time: start,
                outcome: Outcome::Success { connect_time: start.elapsed() },
            })
        }
        Err(e) => Err(e),
    }
}

/// Track 1: one-shot direct dial of a carried non-circuit multiaddress. No
/// retries — if this is the only track provided an address at all and it
/// fails, the remaining tracks (peer-store, active-search) still run.
async fn track_fast_path<H: PeerHost>(host: &H, addr: Option<Multiaddr>) -> Result<(), DrpcError> {
    let Some(addr) = addr else {
        return std::future::pending().await;
    };
    tracing::debug!(%addr, "fast-path: dialing carried address");
    host.dial(addr).await
}

/// Track 2: every `standard_interval`, try every address currently cached
/// for the peer in parallel. Terminates on first success.
async fn track_peer_store<H: PeerHost>(host: &H, peer: PeerId, interval_dur: Duration) -> Result<(), DrpcError> {
    let mut ticker = interval(interval_dur);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let addrs = host.cached_addresses(peer).await;
        if addrs.is_empty() {
            continue;
        }
        tracing::debug!(%peer, count = addrs.len(), "peer-store: trying cached addresses");
        let mut attempts = futures::stream::FuturesUnordered::new();
        for addr in addrs {
            attempts.push(host.dial(addr));
        }
        use futures::StreamExt;
        while let Some(result) = attempts.next().await {
            if result.is_ok() {
                return Ok(());
            }
        }
    }
}

/// Track 3: every `standard_interval`, dial by PeerID alone (the host
/// resolves the address and kicks its own DHT/mDNS search).
async fn track_active_search<H: PeerHost>(host: &H, peer: PeerId, interval_dur: Duration) -> Result<(), DrpcError> {
    let mut ticker = interval(interval_dur);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tracing::debug!(%peer, "active-search: raw dial by peer id");
        if host.dial_peer(peer).await.is_ok() {
            return Ok(());
        }
    }
}

/// Track 4: only runs when the input carried a circuit address. Re-attempts
/// the circuit dial every `standard_interval`; a `NoReservation` failure is
/// swallowed and simply retried, everything else propagates.
async fn track_circuit_relay<H: PeerHost>(
    host: &H,
    addr: Option<Multiaddr>,
    interval_dur: Duration,
) -> Result<(), DrpcError> {
    let Some(addr) = addr else {
        return std::future::pending().await;
    };
    let mut ticker = interval(interval_dur);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match host.dial(addr.clone()).await {
            Ok(()) => return Ok(()),
            Err(DrpcError::NoReservation) => {
                tracing::debug!(%addr, "circuit-relay: no reservation yet, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Track 5: subscribes to discovery events; on a matching event with at
/// least one address, dials all of them in parallel. On a dial failure,
/// restarts the host's discovery services and backs off by one interval.
async fn track_event_driven<H: PeerHost>(host: &H, peer: PeerId, interval_dur: Duration) -> Result<(), DrpcError> {
    let mut events = host.subscribe_discovery();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return std::future::pending().await,
        };

        let DiscoveryEvent::PeerDiscovered { peer: discovered, addrs } = event else {
            continue;
        };
        if discovered != peer || addrs.is_empty() {
            continue;
        }

        tracing::debug!(%peer, count = addrs.len(), "event-driven: dialing newly discovered addresses");
        let mut attempts = futures::stream::FuturesUnordered::new();
        for addr in addrs {
            attempts.push(host.dial(addr));
        }
        use futures::StreamExt;
        let mut any_ok = false;
        while let Some(result) = attempts.next().await {
            if result.is_ok() {
                any_ok = true;
                break;
            }
        }
        if any_ok {
            return Ok(());
        }

        tracing::warn!(%peer, "event-driven: dial failed for all discovered addresses, restarting discovery services");
        host.restart_discovery_services(peer).await;
        tokio::time::sleep(interval_dur).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use libp2p::identity::Keypair;
    use std::time::Duration;

    fn new_peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolves_immediately_when_peer_is_already_reachable() {
        let host = FakeHost::new();
        let peer = new_peer();
        host.set_reachable(peer, true);
        let pool = ConnectionPool::new(host.clone(), Duration::from_secs(1));

        let mut targets = BTreeMap::new();
        targets.insert(peer, vec![]);
        let config = DiscoveryConfig { standard_interval: Duration::from_millis(20), ..Default::default() };

        let resolution = resolve(&pool, &*host, targets, StreamProtocol::new("/drpc/1.0.0"), &config)
            .await
            .unwrap();
        match resolution {
            Resolution::Connected { peer: resolved, .. } => assert_eq!(resolved, peer),
            Resolution::Timeout => panic!("expected a connection, got timeout"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_peer_times_out_within_total_timeout() {
        let host = FakeHost::new();
        let peer = new_peer();
        let pool = ConnectionPool::new(host.clone(), Duration::from_millis(50));

        let mut targets = BTreeMap::new();
        targets.insert(peer, vec![]);
        let config = DiscoveryConfig {
            standard_interval: Duration::from_millis(20),
            total_timeout: Duration::from_millis(150),
            dial_timeout: Duration::from_millis(50),
        };

        let resolution = resolve(&pool, &*host, targets, StreamProtocol::new("/drpc/1.0.0"), &config)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Timeout));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_driven_track_resolves_on_late_announcement() {
        let host = FakeHost::new();
        let peer = new_peer();
        let pool = ConnectionPool::new(host.clone(), Duration::from_secs(1));

        let announce_host = host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            announce_host.set_reachable(peer, true);
            announce_host.announce(peer, vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()]);
        });

        let mut targets = BTreeMap::new();
        targets.insert(peer, vec![]);
        let config = DiscoveryConfig {
            standard_interval: Duration::from_millis(500),
            total_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(1),
        };

        let resolution = resolve(&pool, &*host, targets, StreamProtocol::new("/drpc/1.0.0"), &config)
            .await
            .unwrap();
        match resolution {
            Resolution::Connected { peer: resolved, .. } => assert_eq!(resolved, peer),
            Resolution::Timeout => panic!("event-driven track should have resolved this"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_resolves_within_one_standard_interval() {
        let host = FakeHost::new();
        let peer = new_peer();
        let pool = ConnectionPool::new(host.clone(), Duration::from_millis(10));

        let mut targets = BTreeMap::new();
        targets.insert(peer, vec![]);
        let config = DiscoveryConfig {
            standard_interval: Duration::from_millis(30),
            total_timeout: Duration::from_millis(60),
            dial_timeout: Duration::from_millis(10),
        };

        let started = Instant::now();
        let resolution = resolve(&pool, &*host, targets, StreamProtocol::new("/drpc/1.0.0"), &config)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Timeout));
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
