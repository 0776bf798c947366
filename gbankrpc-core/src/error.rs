use std::fmt;

/// All error types produced by the RPC framework.
///
/// Maps to the design-level error kinds of the original Go implementation:
/// - `TransportError` -> [`RpcError::Transport`]
/// - bad magic / unknown codec / ill-formed or unresolved service.method -> [`RpcError::Protocol`]
/// - `ErrShutdown` -> [`RpcError::Shutdown`]
/// - server-side request timeout -> [`RpcError::HandleTimeout`]
/// - dial-side timeout -> [`RpcError::ConnectTimeout`]
/// - caller context cancellation -> [`RpcError::Canceled`]
/// - the string a remote handler reports in `Header.err` -> [`RpcError::User`]
#[derive(Debug)]
pub enum RpcError {
    /// Any read/write/dial failure against the underlying stream.
    Transport(std::io::Error),

    /// Bad magic, unknown codec id, ill-formed service-method, or unknown
    /// service/method.
    Protocol(String),

    /// Operation attempted on a `Client` that is `UserClosed` or `Shutdown`.
    Shutdown,

    /// Server-side per-request dispatch exceeded its handle-timeout.
    HandleTimeout,

    /// Dial-side connect-timeout elapsed before the handshake completed.
    ConnectTimeout,

    /// The caller's cancellation was observed before a reply arrived.
    Canceled(String),

    /// The error string reported by the remote handler.
    User(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(err) => write!(f, "rpc transport error: {err}"),
            RpcError::Protocol(msg) => write!(f, "rpc protocol error: {msg}"),
            RpcError::Shutdown => write!(f, "connection is shut down"),
            RpcError::HandleTimeout => write!(f, "rpc server: request handle timeout"),
            RpcError::ConnectTimeout => write!(f, "rpc client: connect timeout"),
            RpcError::Canceled(cause) => write!(f, "rpc client: call canceled: {cause}"),
            RpcError::User(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(format!("json codec error: {err}"))
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Protocol(format!("bincode codec error: {err}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Builds an equivalent error. `std::io::Error` isn't `Clone`, so this
    /// is needed anywhere the same failure has to be reported to more than
    /// one pending call (e.g. terminating every outstanding call after one
    /// read failure).
    pub fn duplicate(&self) -> RpcError {
        match self {
            RpcError::Transport(err) => {
                RpcError::Transport(std::io::Error::new(err.kind(), err.to_string()))
            }
            RpcError::Protocol(msg) => RpcError::Protocol(msg.clone()),
            RpcError::Shutdown => RpcError::Shutdown,
            RpcError::HandleTimeout => RpcError::HandleTimeout,
            RpcError::ConnectTimeout => RpcError::ConnectTimeout,
            RpcError::Canceled(msg) => RpcError::Canceled(msg.clone()),
            RpcError::User(msg) => RpcError::User(msg.clone()),
        }
    }
}
