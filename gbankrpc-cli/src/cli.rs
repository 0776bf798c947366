use std::time::Duration;

use clap::{Parser, Subcommand};

/// Operator CLI for GBankRPC: start a server, fire one call, or run a
/// registry, all from the command line.
///
/// The 'address' for `serve`/`call` is a bare host:port for TCP, a socket
/// path for --network unix, or a host:port for --network http (dialed via
/// an HTTP CONNECT tunnel to the server's RPC path).
#[derive(Parser, Debug)]
#[command(
    name = "gbankrpc",
    version,
    after_help = "Example usage:\n  \
        gbankrpc serve 127.0.0.1:0\n  \
        gbankrpc call 127.0.0.1:12345 Echo.Call -d '{\"msg\": \"hi\"}'\n  \
        gbankrpc registry 127.0.0.1:6666"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a server hosting the built-in Echo service, for manual
    /// smoke-testing of the wire protocol and discovery plumbing.
    Serve(ServeArgs),

    /// Dial a server and make a single call, printing the JSON reply.
    Call(CallArgs),

    /// Start a standalone registry service (heartbeat sink + address list).
    Registry(RegistryArgs),
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
    Http,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on: "host:port" for tcp/http, a socket path for unix.
    pub address: String,

    /// Transport to listen on.
    #[arg(long, value_enum, default_value_t = Network::Tcp)]
    pub network: Network,

    /// Registry URL to send heartbeats to, e.g. http://127.0.0.1:6666/registry.
    #[arg(long, value_name = "URL")]
    pub registry: Option<String>,

    /// Heartbeat interval in seconds. 0 uses the registry's default.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub heartbeat_interval: u64,

    /// Also serve the read-only debug page on this address, e.g. 127.0.0.1:0.
    #[arg(long, value_name = "ADDRESS")]
    pub debug_address: Option<String>,
}

impl ServeArgs {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Server address to dial.
    pub address: String,

    /// "Service.Method" to invoke.
    pub service_method: String,

    /// Transport to dial over.
    #[arg(long, value_enum, default_value_t = Network::Tcp)]
    pub network: Network,

    /// JSON request body. If '@', read the body from stdin.
    #[arg(short = 'd', long = "data", value_name = "JSON", default_value = "null")]
    pub data: String,

    /// Abort the call after this many seconds. 0 means no timeout.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub timeout: u64,

    /// Server-side handle timeout in seconds, negotiated at dial time and
    /// enforced by the server on every request made over this connection.
    /// 0 disables it.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub handle_timeout: u64,
}

impl CallArgs {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout))
        }
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_secs(self.handle_timeout)
    }
}

#[derive(Parser, Debug)]
pub struct RegistryArgs {
    /// Address to listen on, e.g. 127.0.0.1:6666.
    pub address: String,

    /// How long a server can go without a heartbeat before it's dropped.
    /// 0 means a server is never dropped.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub timeout: u64,
}

impl RegistryArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
