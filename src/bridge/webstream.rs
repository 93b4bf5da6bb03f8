//! E2: the browser-facing web-stream envelope bridge.
//!
//! Browser-constrained clients cannot open an HTTP/2 connection directly
//! over a peer stream (browsers do not expose raw multiplexed streams), so
//! they instead open `/drpc-webstream/1.0.0`, write a small preamble naming
//! the RPC path and content type, then write ordinary envelope frames. This
//! module reads that preamble and splices the remainder of the stream into
//! an in-memory HTTP/2 exchange against the same user handler [`super::listener`]
//! serves for native peers.
//!
//! Grounded on `sven-gateway`'s overall "spawn a task per accepted
//! connection, log and move on if it fails" posture (`gateway.rs`), adapted
//! to the in-memory duplex-pipe splice this bridge needs instead of a plain
//! TCP accept loop.

use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use libp2p::{PeerId, StreamProtocol};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::Service;

use crate::buffer_pool::BufferPool;
use crate::error::DrpcError;
use crate::host::PeerHost;

use super::WEBSTREAM_AUTHORITY;

const MAX_PATH_LEN: u32 = 4096;
const MAX_CONTENT_TYPE_LEN: u8 = 255;

/// The decoded preamble: the RPC path and the negotiated content type.
#[derive(Debug, Clone)]
pub struct Preamble {
    pub path: String,
    pub content_type: String,
}

/// Read the fixed-shape preamble off the front of a web-stream connection:
/// `{pathLen:u32 BE}{path:utf8}{ctLen:u8}{contentType:ascii}`. Any bound
/// violation is a `ProtocolError` — the caller resets the stream rather than
/// trying to recover.
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Preamble, DrpcError> {
    let path_len = reader.read_u32().await?;
    if path_len == 0 || path_len > MAX_PATH_LEN {
        return Err(DrpcError::ProtocolError(format!(
            "web-stream preamble path length {path_len} out of bounds (1..={MAX_PATH_LEN})"
        )));
    }

    let mut path_buf = vec![0u8; path_len as usize];
    reader.read_exact(&mut path_buf).await?;
    let path = String::from_utf8(path_buf)
        .map_err(|e| DrpcError::ProtocolError(format!("preamble path is not utf8: {e}")))?;
    if !path.starts_with('/') {
        return Err(DrpcError::ProtocolError("preamble path must start with '/'".into()));
    }

    let ct_len = reader.read_u8().await?;
    if ct_len == 0 || ct_len > MAX_CONTENT_TYPE_LEN {
        return Err(DrpcError::ProtocolError(format!(
            "web-stream preamble content-type length {ct_len} out of bounds (1..={MAX_CONTENT_TYPE_LEN})"
        )));
    }

    let mut ct_buf = vec![0u8; ct_len as usize];
    reader.read_exact(&mut ct_buf).await?;
    let content_type = String::from_utf8(ct_buf)
        .map_err(|e| DrpcError::ProtocolError(format!("preamble content-type is not ascii: {e}")))?;

    Ok(Preamble { path, content_type })
}

/// Accept web-stream connections for `protocol` forever, bridging each one
/// into its own in-memory HTTP/2 exchange against `make_service(peer)`. A
/// panic while handling one connection resets that stream and is logged;
/// the listener itself keeps running (§4.E.2 panic policy).
pub async fn serve_webstream_listener<H, F, S, B>(
    host: std::sync::Arc<H>,
    protocol: StreamProtocol,
    mut make_service: F,
) where
    H: PeerHost + 'static,
    F: FnMut(PeerId) -> S,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    use futures::StreamExt;

    let mut incoming = match host.accept_protocol(protocol).await {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::error!(error = %e, "failed to register web-stream listener");
            return;
        }
    };

    let buffers = std::sync::Arc::new(BufferPool::new());

    while let Some((peer, stream)) = incoming.next().await {
        let service = make_service(peer);
        let buffers = buffers.clone();
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(handle_connection(peer, stream, service, buffers))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(%peer, error = %e, "web-stream connection ended with an error"),
                Err(_) => tracing::error!(%peer, "web-stream handler panicked; stream reset"),
            }
        });
    }

    tracing::info!("web-stream listener closed: host's incoming-stream channel ended");
}

async fn handle_connection<S, B>(
    peer: PeerId,
    mut stream: crate::host::BoxedStream,
    service: S,
    buffers: std::sync::Arc<BufferPool>,
) -> Result<(), DrpcError>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let preamble = read_preamble(&mut stream).await?;
    tracing::debug!(%peer, path = %preamble.path, content_type = %preamble.content_type, "web-stream preamble read");

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let tower_service = TowerToHyperService::new(service);
        if let Err(err) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(server_io), tower_service)
            .await
        {
            tracing::debug!(error = %err, "web-stream in-memory http/2 server connection ended");
        }
    });

    let (mut send_request, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .handshake(TokioIo::new(client_io))
        .await
        .map_err(|e| DrpcError::Internal(format!("web-stream http/2 client handshake failed: {e}")))?;
    let conn_task = tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(error = %err, "web-stream in-memory http/2 client connection ended");
        }
    });

    let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
    let (mut peer_read, mut peer_write) = tokio::io::split(stream);

    let pump_in = tokio::spawn(async move {
        loop {
            let mut buf = buffers.acquire();
            match peer_read.read(&mut buf[..]).await {
                Ok(0) => break,
                Ok(n) => {
                    if body_tx.send(Ok(Frame::data(Bytes::copy_from_slice(&buf[..n])))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "web-stream: error reading request body from peer stream");
                    break;
                }
            }
        }
    });

    let request = Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("http://{WEBSTREAM_AUTHORITY}{}", preamble.path))
        .header(CONTENT_TYPE, preamble.content_type.clone())
        .header(ACCEPT, preamble.content_type.clone())
        .header("Connect-Protocol-Version", "1")
        .body(StreamBody::new(ReceiverStream::new(body_rx)))
        .map_err(|e| DrpcError::Internal(format!("failed to build web-stream request: {e}")))?;

    let response = send_request
        .send_request(request)
        .await
        .map_err(|e| DrpcError::Internal(format!("web-stream request failed: {e}")))?;

    let mut body = response.into_body();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if let Err(e) = peer_write.write_all(data).await {
                        tracing::debug!(error = %e, "web-stream: error writing response to peer stream");
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "web-stream: response body error");
                break;
            }
            None => break,
        }
    }
    let _ = peer_write.shutdown().await;

    pump_in.abort();
    conn_task.abort();
    server_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_well_formed_preamble() {
        let path = "/greeter.v1.GreeterService/BidiStreamingEcho";
        let ct = "application/connect+proto";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(&[ct.len() as u8]);
        buf.extend_from_slice(ct.as_bytes());

        let mut reader = &buf[..];
        let preamble = read_preamble(&mut reader).await.unwrap();
        assert_eq!(preamble.path, path);
        assert_eq!(preamble.content_type, ct);
    }

    #[tokio::test]
    async fn rejects_zero_length_path() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = &buf[..];
        let err = read_preamble(&mut reader).await.unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn rejects_path_len_over_bound() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_PATH_LEN + 1).to_be_bytes());
        let mut reader = &buf[..];
        let err = read_preamble(&mut reader).await.unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn rejects_zero_length_content_type() {
        let path = "/svc/Method";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(&[0u8]);
        let mut reader = &buf[..];
        let err = read_preamble(&mut reader).await.unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn rejects_path_missing_leading_slash() {
        let path = "greeter.v1.GreeterService/SayHello";
        let ct = "application/connect+proto";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(&[ct.len() as u8]);
        buf.extend_from_slice(ct.as_bytes());
        let mut reader = &buf[..];
        let err = read_preamble(&mut reader).await.unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }
}
