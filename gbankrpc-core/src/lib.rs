//! GBankRPC: a small framed RPC framework, in the spirit of Go's
//! `net/rpc`. A connection carries a handshake option once, then any
//! number of header+body request/response pairs; services are registered
//! ahead of time and dispatched by `Service.Method` name.
//!
//! - [`codec`] — wire framing, handshake negotiation, pluggable JSON/bincode bodies.
//! - [`transport`] — TCP/Unix connections and the HTTP CONNECT tunnel.
//! - [`service`] — the method registry a [`server::Server`] dispatches against.
//! - [`client`] — one connection, many concurrent in-flight calls.
//! - [`server`] — accepts connections and dispatches requests to registered services.
//! - [`discovery`] — pluggable address lists for a fleet of servers.
//! - [`registry`] — a standalone heartbeat/lookup service implementing [`discovery::PullDiscovery`]'s other half.
//! - [`xclient`] — load-balances and broadcasts calls across whatever [`discovery::Discovery`] reports.
//! - [`debug`] — a read-only HTML dump of a server's registered methods and call counts.

pub mod client;
pub mod codec;
pub mod debug;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;
pub mod xclient;

pub use client::{Call, Client};
pub use codec::{CodecId, Header, HandshakeOption, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH, MAGIC_NUMBER};
pub use discovery::{Discovery, PullDiscovery, SelectMode, StaticDiscovery};
pub use error::{Result, RpcError};
pub use registry::{spawn_heartbeat, GBankRegistry};
pub use server::{serve_conn, Server};
pub use service::{ServiceBuilder, ServiceEntry, ServiceTable};
pub use transport::Conn;
pub use xclient::XClient;
