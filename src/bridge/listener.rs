//! E1: adapts an accepted peer stream into an HTTP/2 connection, so the
//! same axum router that serves ordinary HTTP traffic can serve RPCs that
//! arrived over the peer-to-peer fabric without knowing the difference.
//!
//! There is no real "listener" object on the peer side — `accept_protocol`
//! just hands back a stream of already-open duplex streams — so this is a
//! synthetic accept loop: each accepted stream gets its own HTTP/2
//! connection, same as a TCP listener handing a socket to
//! `hyper::server::conn::http2`.

use bytes::Bytes;
use futures::StreamExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use libp2p::{PeerId, StreamProtocol};
use tower::Service;

use crate::host::PeerHost;

/// Accept peer streams for `protocol` forever, serving each one as its own
/// HTTP/2 connection against `make_service(peer)`. Returns only once the
/// host's incoming-stream channel closes (host shut down).
///
/// `make_service` is invoked once per accepted connection so the service
/// can close over which peer it is talking to (e.g. to tag logs or enforce
/// a peer allowlist) without this function needing to know about either.
pub async fn serve_peer_listener<H, F, S, B>(host: std::sync::Arc<H>, protocol: StreamProtocol, mut make_service: F)
where
    H: PeerHost + 'static,
    F: FnMut(PeerId) -> S,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut incoming = match host.accept_protocol(protocol).await {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::error!(error = %e, "failed to register peer-stream listener");
            return;
        }
    };

    while let Some((peer, stream)) = incoming.next().await {
        let service = TowerToHyperService::new(make_service(peer));
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let result = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await;
            if let Err(err) = result {
                tracing::debug!(%peer, error = %err, "peer-stream http/2 connection ended");
            }
        });
    }

    tracing::info!("peer-stream listener closed: host's incoming-stream channel ended");
}
