//! Shares outgoing byte streams across callers targeting the same
//! `(peer, protocol)` pair, with single-lease semantics: a slot is either
//! idle and reusable or leased to exactly one caller, never both.
//!
//! Grounded on `sven-p2p::node::NodeState`'s connection bookkeeping
//! (`dialed`, `relay_connection_ids`, per-peer dial de-duplication),
//! generalized from one fixed application protocol to an arbitrary
//! `StreamProtocol` parameter and exposed as a standalone type instead of
//! being folded into the swarm event loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::error::DrpcError;
use crate::host::{BoxedStream, PeerHost};

type SlotKey = (PeerId, StreamProtocol);

/// Slot state. Dial de-duplication is not a third variant here: it comes
/// from holding the `AsyncMutex` guard across the dial in `get_stream`, so a
/// second caller for the same key blocks on the same lock rather than
/// starting a redundant dial.
enum Slot {
    Idle(BoxedStream),
    Empty,
}

struct SlotEntry {
    slot: AsyncMutex<Slot>,
}

/// A stream leased out of the pool. Must be returned via
/// [`ConnectionPool::release`] when the caller is done with it; dropping it
/// without releasing leaks the slot as permanently leased, matching the
/// teacher's "caller is trusted to give streams back" discipline (no
/// `Drop` magic, since knowing whether the connection is still healthy
/// requires the caller's own protocol-level judgment).
pub struct Leased {
    pub peer: PeerId,
    pub protocol: StreamProtocol,
    pub stream: BoxedStream,
}

pub struct ConnectionPool<H: PeerHost> {
    host: Arc<H>,
    slots: DashMap<SlotKey, Arc<SlotEntry>>,
    dial_timeout: Duration,
}

impl<H: PeerHost + 'static> ConnectionPool<H> {
    pub fn new(host: Arc<H>, dial_timeout: Duration) -> Self {
        ConnectionPool { host, slots: DashMap::new(), dial_timeout }
    }

    fn entry(&self, key: &SlotKey) -> Arc<SlotEntry> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SlotEntry { slot: AsyncMutex::new(Slot::Empty) }))
            .clone()
    }

    /// Return an idle reusable slot if one exists, else dial a fresh
    /// stream. Blocks (respecting `dial_timeout`) until either a stream is
    /// available or the dial fails. At most one dial is ever in flight per
    /// `(peer, protocol)`: the `AsyncMutex` guard held across the dial
    /// serializes concurrent callers onto the same attempt.
    pub async fn get_stream(
        &self,
        peer: PeerId,
        addr: Option<Multiaddr>,
        protocol: StreamProtocol,
    ) -> Result<Leased, DrpcError> {
        let key = (peer, protocol.clone());
        let entry = self.entry(&key);
        let mut guard = entry.slot.lock().await;

        let stream = match std::mem::replace(&mut *guard, Slot::Empty) {
            Slot::Idle(stream) => stream,
            Slot::Empty => {
                timeout(self.dial_timeout, self.host.open_stream(peer, addr, protocol))
                    .await
                    .map_err(|_| DrpcError::DeadlineExceeded)??
            }
        };

        // The slot is now leased: leave it `Empty` in the map (an idle
        // slot is only ever put back on `release`).
        drop(guard);
        Ok(Leased { peer, protocol: key.1, stream })
    }

    /// Return a leased stream. A healthy stream becomes idle and reusable;
    /// this pool has no way to probe liveness itself, so the caller is
    /// expected to pass back only streams it still believes are open —
    /// anything else should simply be dropped instead of released.
    pub async fn release(&self, leased: Leased) {
        let key = (leased.peer, leased.protocol);
        let entry = self.entry(&key);
        let mut guard = entry.slot.lock().await;
        *guard = Slot::Idle(leased.stream);
    }

    /// Close and discard every slot for `peer`, across all protocols.
    /// Called on peer disconnect.
    pub fn drop_peer(&self, peer: PeerId) {
        self.slots.retain(|(p, _), _| *p != peer);
    }

    /// Launch a concurrent dial to every peer in `targets`, returning the
    /// first one whose connection completes; the rest are left to resolve
    /// or fail on their own (no explicit cancellation token is threaded
    /// through `open_stream`, so "cancelled" here means "result ignored").
    pub async fn connect_to_first_available(
        &self,
        targets: BTreeMap<PeerId, Vec<Multiaddr>>,
        protocol: StreamProtocol,
    ) -> Result<Leased, DrpcError> {
        if targets.is_empty() {
            return Err(DrpcError::NoReachablePeer("no candidate peers".into()));
        }

        let mut futures = futures::stream::FuturesUnordered::new();
        for (peer, addrs) in targets {
            let addr = addrs.into_iter().next();
            let protocol = protocol.clone();
            futures.push(async move { self.get_stream(peer, addr, protocol).await });
        }

        use futures::StreamExt;
        let mut last_err = None;
        while let Some(result) = futures.next().await {
            match result {
                Ok(leased) => return Ok(leased),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| DrpcError::NoReachablePeer("all dial attempts failed".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use libp2p::identity::Keypair;

    fn new_peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    fn proto() -> StreamProtocol {
        StreamProtocol::new("/drpc/1.0.0")
    }

    #[tokio::test]
    async fn get_then_release_makes_the_slot_reusable() {
        let host = FakeHost::new();
        let peer = new_peer();
        host.set_reachable(peer, true);
        let pool = ConnectionPool::new(host.clone(), Duration::from_secs(1));

        let leased = pool.get_stream(peer, None, proto()).await.unwrap();
        pool.release(leased).await;

        // second call reuses the idle slot instead of dialing again
        let _leased2 = pool.get_stream(peer, None, proto()).await.unwrap();
        assert_eq!(host.dial_attempts(), 1, "second get_stream must reuse the idle slot");
    }

    #[tokio::test]
    async fn unreachable_peer_fails_without_blocking_forever() {
        let host = FakeHost::new();
        let peer = new_peer();
        let pool = ConnectionPool::new(host, Duration::from_millis(200));

        let err = pool.get_stream(peer, None, proto()).await.unwrap_err();
        assert!(matches!(err, DrpcError::NoReachablePeer(_)));
    }

    #[tokio::test]
    async fn drop_peer_discards_its_idle_slot() {
        let host = FakeHost::new();
        let peer = new_peer();
        host.set_reachable(peer, true);
        let pool = ConnectionPool::new(host.clone(), Duration::from_secs(1));

        let leased = pool.get_stream(peer, None, proto()).await.unwrap();
        pool.release(leased).await;
        pool.drop_peer(peer);

        let _leased2 = pool.get_stream(peer, None, proto()).await.unwrap();
        assert_eq!(host.dial_attempts(), 2, "drop_peer must force a fresh dial");
    }

    #[tokio::test]
    async fn connect_to_first_available_picks_the_reachable_peer() {
        let host = FakeHost::new();
        let unreachable = new_peer();
        let reachable = new_peer();
        host.set_reachable(reachable, true);

        let pool = ConnectionPool::new(host, Duration::from_secs(1));
        let mut targets = BTreeMap::new();
        targets.insert(unreachable, vec![]);
        targets.insert(reachable, vec![]);

        let leased = pool.connect_to_first_available(targets, proto()).await.unwrap();
        assert_eq!(leased.peer, reachable);
    }

    #[tokio::test]
    async fn connect_to_first_available_fails_when_nothing_is_reachable() {
        let host = FakeHost::new();
        let pool = ConnectionPool::new(host, Duration::from_secs(1));
        let mut targets = BTreeMap::new();
        targets.insert(new_peer(), vec![]);

        let err = pool.connect_to_first_available(targets, proto()).await.unwrap_err();
        assert!(matches!(err, DrpcError::NoReachablePeer(_)));
    }
}
