//! E4: the client-side "smart" transport that picks HTTP or peer delivery
//! per call, resolving which one is needed lazily and caching the answer
//! for the rest of the transport's lifetime.
//!
//! Grounded on `sven-gateway`'s overall client-construction posture (build
//! one long-lived `hyper_util` client, reuse it for every call) and on
//! [`super::webstream`]'s server-side wire behavior, which this module is
//! the mirror image of: preamble, then raw envelope bytes in both
//! directions, with no HTTP status line ever crossing the peer stream
//! itself (the in-memory HTTP/2 exchange on the server side is a purely
//! local implementation detail).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::address;
use crate::discovery::{self, DiscoveryConfig, Resolution};
use crate::error::DrpcError;
use crate::host::PeerHost;
use crate::pool::ConnectionPool;

use super::DRPC_WEBSTREAM_PROTOCOL;

/// Which RPC shape a call has. Per §4.E.4, only unary and server-streaming
/// calls can stay on a conventional HTTP/2 transport when the target is an
/// HTTP URL — the other two need to keep writing after the server has
/// started responding, which a one-shot HTTP request/response cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallKind {
    fn needs_duplex_transport(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::BidiStreaming)
    }
}

/// A call's progress, per §4.E.4's state machine. Logged at each
/// transition; nothing in this module branches on it.
#[derive(Debug, Clone, Copy)]
enum CallState {
    Idle,
    Dispatching,
    Http,
    PeerResolving,
    PeerDialing,
    PeerStreaming,
    Cancelling,
    Completed,
    Failed,
}

fn log_transition(call_id: u64, from: CallState, to: CallState) {
    tracing::debug!(call_id, ?from, ?to, "smart transport call state transition");
}

/// The result of either delivery path. Peer-stream delivery has no status
/// line or headers of its own — see module docs — so both are `None`/empty
/// in that case; callers that need a Connect-level status should look for
/// it in `body` (the callee's handler is responsible for putting it there
/// the same way it would on an error trailer over plain HTTP).
pub struct CallResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Deserialize)]
struct P2pInfo {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addrs")]
    addrs: Vec<String>,
}

/// Client-side adapter implementing §4.E.4. Meant to be built once (behind
/// an `Arc`) and shared by every call a host application makes through this
/// crate.
pub struct SmartTransport<H: PeerHost> {
    http: Client<HttpConnector, Full<Bytes>>,
    pool: Arc<ConnectionPool<H>>,
    host: Arc<H>,
    discovery: DiscoveryConfig,
    /// URL → chosen peer multiaddress. Persists for the transport's
    /// lifetime; never invalidated (§4.E.4: "cached mapping persists for
    /// the lifetime of the transport").
    p2pinfo_cache: DashMap<String, Multiaddr>,
    call_ids: AtomicU64,
}

impl<H: PeerHost + 'static> SmartTransport<H> {
    pub fn new(pool: Arc<ConnectionPool<H>>, host: Arc<H>, discovery: DiscoveryConfig) -> Self {
        let http = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        SmartTransport { http, pool, host, discovery, p2pinfo_cache: DashMap::new(), call_ids: AtomicU64::new(0) }
    }

    /// Issue one call. `target` is any of the four address-input shapes
    /// (§3); `path` is the RPC's service path (e.g.
    /// `/greeter.v1.GreeterService/SayHello`); `content_type` is one of the
    /// eight registered Connect content types.
    pub async fn call(
        &self,
        target: &str,
        kind: CallKind,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<CallResponse, DrpcError> {
        let call_id = self.call_ids.fetch_add(1, Ordering::Relaxed);
        log_transition(call_id, CallState::Idle, CallState::Dispatching);

        let is_http = target.starts_with("http://") || target.starts_with("https://");

        let result = if is_http && !kind.needs_duplex_transport() {
            log_transition(call_id, CallState::Dispatching, CallState::Http);
            self.call_http(target, path, content_type, body).await
        } else if is_http {
            log_transition(call_id, CallState::Dispatching, CallState::PeerResolving);
            match self.resolve_via_p2pinfo(target).await {
                Ok(addr) => {
                    log_transition(call_id, CallState::PeerResolving, CallState::PeerDialing);
                    self.call_peer_addr(addr, path, content_type, body, call_id).await
                }
                Err(e) => Err(e),
            }
        } else {
            log_transition(call_id, CallState::Dispatching, CallState::PeerResolving);
            match address::parse(target) {
                Ok((targets, parsed_path)) => {
                    let effective_path = parsed_path.as_deref().unwrap_or(path);
                    log_transition(call_id, CallState::PeerResolving, CallState::PeerDialing);
                    self.call_peer_targets(targets, effective_path, content_type, body, call_id).await
                }
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(_) => log_transition(call_id, CallState::PeerStreaming, CallState::Completed),
            Err(DrpcError::Cancelled) => {
                log_transition(call_id, CallState::PeerStreaming, CallState::Cancelling);
                log_transition(call_id, CallState::Cancelling, CallState::Completed);
            }
            Err(_) => log_transition(call_id, CallState::Dispatching, CallState::Failed),
        }

        result
    }

    async fn call_http(&self, target: &str, path: &str, content_type: &str, body: Bytes) -> Result<CallResponse, DrpcError> {
        let uri: hyper::Uri = format!("{}{path}", target.trim_end_matches('/'))
            .parse()
            .map_err(|e| DrpcError::InvalidAddress(format!("{target}{path}: {e}")))?;

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, content_type)
            .header("Connect-Protocol-Version", "1")
            .body(Full::new(body))
            .map_err(|e| DrpcError::Internal(format!("failed to build request: {e}")))?;

        let response = self.http.request(request).await.map_err(|e| DrpcError::Unavailable(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = BodyExt::collect(response.into_body())
            .await
            .map_err(|e| DrpcError::Unavailable(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok(CallResponse { status: Some(status), headers, body })
    }

    async fn resolve_via_p2pinfo(&self, target: &str) -> Result<Multiaddr, DrpcError> {
        if let Some(cached) = self.p2pinfo_cache.get(target) {
            return Ok(cached.clone());
        }

        let uri: hyper::Uri = format!("{}/p2pinfo", target.trim_end_matches('/'))
            .parse()
            .map_err(|e| DrpcError::InvalidAddress(format!("{target}: {e}")))?;
        let request = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| DrpcError::Internal(format!("failed to build /p2pinfo request: {e}")))?;

        let response = self.http.request(request).await.map_err(|e| DrpcError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DrpcError::Unavailable(format!("/p2pinfo returned {}", response.status())));
        }
        let body = BodyExt::collect(response.into_body())
            .await
            .map_err(|e| DrpcError::Unavailable(format!("failed to read /p2pinfo response: {e}")))?
            .to_bytes();
        let info: P2pInfo = serde_json::from_slice(&body)
            .map_err(|e| DrpcError::ProtocolError(format!("malformed /p2pinfo response: {e}")))?;

        let addr = choose_multiaddr(&info)?;
        self.p2pinfo_cache.insert(target.to_string(), addr.clone());
        Ok(addr)
    }

    async fn call_peer_addr(
        &self,
        addr: Multiaddr,
        path: &str,
        content_type: &str,
        body: Bytes,
        call_id: u64,
    ) -> Result<CallResponse, DrpcError> {
        let peer = address::peer_id_from_addr(&addr)
            .ok_or_else(|| DrpcError::InvalidAddress("resolved /p2pinfo address carries no /p2p component".into()))?;
        let mut targets = BTreeMap::new();
        targets.insert(peer, vec![addr]);
        self.call_peer_targets(targets, path, content_type, body, call_id).await
    }

    /// Race discovery (§4.D) for `targets`, then speak the web-stream
    /// envelope protocol over the winning stream: write the preamble and
    /// the request body, close the write half, and read back whatever the
    /// peer writes until it closes its own write half.
    async fn call_peer_targets(
        &self,
        targets: BTreeMap<PeerId, Vec<Multiaddr>>,
        path: &str,
        content_type: &str,
        body: Bytes,
        call_id: u64,
    ) -> Result<CallResponse, DrpcError> {
        let resolution =
            discovery::resolve(&self.pool, &*self.host, targets, DRPC_WEBSTREAM_PROTOCOL, &self.discovery).await?;
        let Resolution::Connected { mut leased, .. } = resolution else {
            return Err(DrpcError::DeadlineExceeded);
        };
        log_transition(call_id, CallState::PeerDialing, CallState::PeerStreaming);

        let stream = &mut leased.stream;
        stream.write_u32(path.len() as u32).await?;
        stream.write_all(path.as_bytes()).await?;
        stream.write_u8(content_type.len() as u8).await?;
        stream.write_all(content_type.as_bytes()).await?;
        stream.write_all(&body).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        // The peer stream is consumed start-to-finish by one call; it is
        // never a reusable idle connection the way a pooled HTTP/2 stream
        // to the same content-addressed path might be, so `leased` is left
        // to drop here rather than being returned via `release`.
        Ok(CallResponse { status: None, headers: HeaderMap::new(), body: Bytes::from(response) })
    }
}

fn choose_multiaddr(info: &P2pInfo) -> Result<Multiaddr, DrpcError> {
    let peer: PeerId = info.id.parse().map_err(|e| DrpcError::InvalidAddress(format!("{}: {e}", info.id)))?;

    let parsed: Vec<Multiaddr> = info.addrs.iter().filter_map(|a| a.parse().ok()).collect();
    let chosen = parsed
        .iter()
        .find(|a| is_loopback(a))
        .or_else(|| parsed.first())
        .cloned()
        .ok_or_else(|| DrpcError::Unavailable("/p2pinfo returned no usable addresses".into()))?;

    Ok(ensure_peer_component(chosen, peer))
}

fn is_loopback(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => ip.is_loopback(),
        Protocol::Ip6(ip) => ip.is_loopback(),
        _ => false,
    })
}

fn ensure_peer_component(addr: Multiaddr, peer: PeerId) -> Multiaddr {
    if address::peer_id_from_addr(&addr).is_some() {
        addr
    } else {
        let mut addr = addr;
        addr.push(Protocol::P2p(peer.into()));
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn new_peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    #[test]
    fn client_streaming_and_bidi_need_a_duplex_transport() {
        assert!(CallKind::ClientStreaming.needs_duplex_transport());
        assert!(CallKind::BidiStreaming.needs_duplex_transport());
        assert!(!CallKind::Unary.needs_duplex_transport());
        assert!(!CallKind::ServerStreaming.needs_duplex_transport());
    }

    #[test]
    fn choose_multiaddr_prefers_loopback_over_first_address() {
        let peer = new_peer();
        let info = P2pInfo {
            id: peer.to_string(),
            addrs: vec!["/ip4/203.0.113.5/tcp/4001".into(), "/ip4/127.0.0.1/tcp/4001".into()],
        };
        let addr = choose_multiaddr(&info).unwrap();
        assert!(is_loopback(&addr));
        assert_eq!(address::peer_id_from_addr(&addr), Some(peer));
    }

    #[test]
    fn choose_multiaddr_falls_back_to_first_when_no_loopback() {
        let peer = new_peer();
        let info = P2pInfo {
            id: peer.to_string(),
            addrs: vec!["/ip4/203.0.113.5/tcp/4001".into(), "/ip4/198.51.100.9/tcp/4001".into()],
        };
        let addr = choose_multiaddr(&info).unwrap();
        assert!(addr.to_string().starts_with("/ip4/203.0.113.5"));
    }

    #[test]
    fn choose_multiaddr_rejects_empty_address_list() {
        let peer = new_peer();
        let info = P2pInfo { id: peer.to_string(), addrs: vec![] };
        let err = choose_multiaddr(&info).unwrap_err();
        assert!(matches!(err, DrpcError::Unavailable(_)));
    }

    #[test]
    fn ensure_peer_component_appends_only_when_missing() {
        let peer = new_peer();
        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let with_peer = ensure_peer_component(bare.clone(), peer);
        assert_eq!(address::peer_id_from_addr(&with_peer), Some(peer));

        let already_tagged: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap();
        let unchanged = ensure_peer_component(already_tagged.clone(), peer);
        assert_eq!(already_tagged, unchanged);
    }
}
