//! Server assembly: wires the peer host, connection pool, and the three
//! inbound surfaces (E1 peer-stream listener, E2 web-stream listener, E3
//! HTTP gateway) into the "server instance" §3 describes — created on
//! startup, torn down on shutdown, owning one peer host, one optional HTTP
//! listener, and the two registered stream-protocol handlers.
//!
//! Grounded on `sven-gateway::gateway::run`'s startup sequencing: construct
//! the pieces, spawn the background tasks, then (optionally) bind and serve
//! HTTP.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Request, Response};
use libp2p::PeerId;
use tokio::net::TcpListener;
use tower::Service;

use crate::bridge::{gateway, listener, webstream, DRPC_PROTOCOL, DRPC_WEBSTREAM_PROTOCOL};
use crate::config::DrpcConfig;
use crate::error::DrpcError;
use crate::host::PeerHost;
use crate::pool::ConnectionPool;

/// Owns the peer host and the connection pool every other piece of the
/// bridge shares. Built once per process via [`DrpcServer::spawn`].
pub struct DrpcServer<H: PeerHost> {
    pub host: Arc<H>,
    pub pool: Arc<ConnectionPool<H>>,
}

impl<H: PeerHost + 'static> DrpcServer<H> {
    /// Start the server instance:
    /// - spawn the E1 peer-stream listener and E2 web-stream listener, both
    ///   serving `make_service(peer)` per accepted connection;
    /// - unless `config.http_port < 0`, bind `config.http_host:http_port`
    ///   and serve the E3 gateway router, falling through to `app_router`
    ///   for everything outside `/gateway/*` and `/p2pinfo`.
    ///
    /// Returns once every listener is spawned (the HTTP server, if any,
    /// runs in its own background task rather than blocking the caller —
    /// unlike `sven-gateway::gateway::run`, which blocks, this crate is a
    /// library and leaves "block until shutdown" to the host application).
    pub async fn spawn<F, S, B>(
        config: DrpcConfig,
        host: Arc<H>,
        dial_timeout: Duration,
        make_service: F,
        app_router: Router,
    ) -> Result<Arc<Self>, DrpcError>
    where
        F: FnMut(PeerId) -> S + Clone + Send + 'static,
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let pool = Arc::new(ConnectionPool::new(host.clone(), dial_timeout));
        let server = Arc::new(DrpcServer { host: host.clone(), pool: pool.clone() });

        {
            let host = host.clone();
            let make_service = make_service.clone();
            tokio::spawn(async move {
                listener::serve_peer_listener(host, DRPC_PROTOCOL, make_service).await;
            });
        }
        {
            let host = host.clone();
            tokio::spawn(async move {
                webstream::serve_webstream_listener(host, DRPC_WEBSTREAM_PROTOCOL, make_service).await;
            });
        }

        if config.http_port >= 0 {
            let state = Arc::new(gateway::GatewayState {
                host: host.clone(),
                pool: pool.clone(),
                http_port: Some(config.http_port as u16),
            });
            let router = gateway::router(state, config.cors.clone(), app_router);
            let addr = format!("{}:{}", config.http_host, config.http_port);
            let tcp_listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| DrpcError::Internal(format!("failed to bind {addr}: {e}")))?;
            tracing::info!(%addr, "http gateway listening");

            tokio::spawn(async move {
                if let Err(err) = axum::serve(tcp_listener, router).await {
                    tracing::error!(error = %err, "http gateway server ended");
                }
            });
        }

        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use http_body_util::Full;

    #[tokio::test]
    async fn spawn_with_http_disabled_skips_the_listener() {
        let host = FakeHost::new();
        let config = DrpcConfig { http_port: -1, ..Default::default() };

        let server = DrpcServer::spawn(
            config,
            host,
            Duration::from_secs(1),
            |_peer: PeerId| {
                tower::service_fn(|_req: Request<Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::new())))
                })
            },
            Router::new(),
        )
        .await;

        assert!(server.is_ok());
    }
}
