//! `drpc-bridge`: the transport fabric and address/discovery engine that let
//! a Connect RPC client reach a server over either plain HTTP or a
//! circuit-relay-capable peer-to-peer overlay without the caller knowing
//! which one was used.
//!
//! This crate is deliberately silent about the RPC wire codec itself
//! (serialization is the caller's problem — see [`envelope`] for the only
//! framing this crate imposes) and about the peer-to-peer stack's internals
//! (see [`host::PeerHost`] for the seam).
//!
//! Module map, leaves first:
//! - [`envelope`] — length-prefixed frame codec (§4.A)
//! - [`address`] — address-input parser (§4.B)
//! - [`host`] — the `PeerHost` seam and its libp2p-backed implementation
//! - [`pool`] — per-(peer, protocol) connection pool (§4.C)
//! - [`discovery`] — five-track discovery engine (§4.D)
//! - [`bridge`] — HTTP/2-over-peer-stream bridge, gateway, and smart client
//!   transport (§4.E)
//! - [`config`] — ambient configuration knobs (§6)
//! - [`error`] — crate-wide error taxonomy (§7)
//! - [`log_layer`] — optional log-capture tap for host applications
//! - [`buffer_pool`] — per-instance 32 KiB copy buffers used by the bridge
//! - [`server`] — assembles the above into the "server instance" lifecycle
//!   object (§3): one peer host, one optional HTTP listener, the two
//!   registered stream-protocol handlers

pub mod address;
pub mod bridge;
pub mod buffer_pool;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod host;
pub mod log_layer;
pub mod pool;
pub mod server;

pub use error::{DrpcError, Result};
