//! Everything that moves HTTP/2-framed Connect RPC traffic across the
//! peer-to-peer fabric: E1 adapts an accepted peer stream into something an
//! unmodified HTTP/2 server can serve connections from, E2 bridges a
//! browser's length-prefixed envelope stream to that same server over an
//! in-memory pipe, E3 is the axum HTTP front door (CORS, `/p2pinfo`,
//! `/gateway/<addr>` forwarding), and E4 is the client-side transport that
//! picks HTTP or peer delivery per call and remembers the choice.

pub mod client;
pub mod gateway;
pub mod listener;
pub mod webstream;

use libp2p::StreamProtocol;

/// Stream protocol peers speak for ordinary Connect RPC traffic (E1).
pub const DRPC_PROTOCOL: StreamProtocol = StreamProtocol::new("/drpc/1.0.0");
/// Stream protocol used for the browser-facing envelope bridge (E2).
pub const DRPC_WEBSTREAM_PROTOCOL: StreamProtocol = StreamProtocol::new("/drpc-webstream/1.0.0");

/// Authority the E2 bridge's internal HTTP/2 client issues requests
/// against; never touches the network, just satisfies `hyper`'s need for a
/// URI with a host.
pub const WEBSTREAM_AUTHORITY: &str = "drpc-webstream";
