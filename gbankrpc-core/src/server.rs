//! Server-side request dispatcher: validates the handshake, then serves an
//! unbounded stream of framed requests over one connection, dispatching each
//! to a spawned task so one slow handler never blocks the rest.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{oneshot, Mutex as TokioMutex};

use crate::codec::{self, CodecId, FrameWriter, Header, MAGIC_NUMBER};
use crate::error::{Result, RpcError};
use crate::service::ServiceEntry;
use crate::service::ServiceTable;
use crate::transport::Conn;

/// Holds the registered services and accepts connections for them. One
/// `Server` can be shared across as many listeners (TCP, Unix, HTTP-CONNECT)
/// as the caller wants to expose it on.
#[derive(Clone)]
pub struct Server {
    table: Arc<ServiceTable>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Server {
            table: Arc::new(ServiceTable::new()),
        }
    }

    pub fn register(&self, entry: ServiceEntry) -> Result<()> {
        self.table.register(entry)
    }

    pub fn service_table(&self) -> Arc<ServiceTable> {
        Arc::clone(&self.table)
    }

    /// Accepts connections on `listener` until it errors, serving each on
    /// its own task.
    pub async fn accept_tcp(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let table = Arc::clone(&self.table);
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(Conn::Tcp(stream), table).await {
                            tracing::debug!(error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "tcp accept failed");
                    return;
                }
            }
        }
    }

    pub async fn accept_unix(&self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let table = Arc::clone(&self.table);
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(Conn::Unix(stream), table).await {
                            tracing::debug!(error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "unix accept failed");
                    return;
                }
            }
        }
    }

    /// Accepts plain TCP connections that begin with an HTTP `CONNECT
    /// /gbankrpc/` preamble rather than the handshake `Option` directly, for
    /// servers multiplexed behind an HTTP front door.
    pub async fn accept_http(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let table = Arc::clone(&self.table);
                    tokio::spawn(async move {
                        if let Err(e) = serve_http_connect(stream, table).await {
                            tracing::debug!(error = %e, "http-connect session ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "http accept failed");
                    return;
                }
            }
        }
    }

    /// Serves the read-only debug page (ported from `debug.go`) on
    /// `listener` until it errors. Meant for a separate, plain-HTTP
    /// listener, not multiplexed onto the RPC port.
    pub async fn accept_debug(&self, listener: TcpListener) {
        crate::debug::serve_debug(listener, self.service_table()).await
    }
}

fn validate_option(opt: &crate::codec::HandshakeOption) -> Result<CodecId> {
    if opt.magic != MAGIC_NUMBER {
        return Err(RpcError::Protocol(format!(
            "invalid magic number {:#x}",
            opt.magic
        )));
    }
    opt.codec_id()
        .ok_or_else(|| RpcError::Protocol(format!("invalid codec type {}", opt.codec)))
}

/// Reads and validates the handshake, then serves requests with the
/// handle-timeout the handshake negotiated. This is the entry point
/// listeners use.
pub async fn serve_conn(mut conn: Conn, table: Arc<ServiceTable>) -> Result<()> {
    let opt = codec::read_option(&mut conn).await?;
    let codec_id = validate_option(&opt)?;
    serve_codec(conn, codec_id, table, opt.handle_timeout).await
}

/// Like [`serve_conn`], but `handle_timeout` overrides whatever the
/// handshake negotiated. Exists mainly so tests can pin down server-side
/// timeout behavior deterministically instead of threading it through a
/// client-side `HandshakeOption`.
pub async fn serve_one(mut conn: Conn, table: Arc<ServiceTable>, handle_timeout: Duration) -> Result<()> {
    let opt = codec::read_option(&mut conn).await?;
    let codec_id = validate_option(&opt)?;
    serve_codec(conn, codec_id, table, handle_timeout).await
}

const CONNECTED_STATUS: &[u8] = b"HTTP/1.0 200 Connected to Gbank RPC\n\n";

async fn serve_http_connect(mut stream: tokio::net::TcpStream, table: Arc<ServiceTable>) -> Result<()> {
    {
        let mut reader = BufReader::new(&mut stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
        }
        if !request_line.starts_with("CONNECT") {
            drop(reader);
            stream
                .write_all(b"HTTP/1.0 405 Method not allowed\n\n405 Method not allowed")
                .await?;
            return Ok(());
        }
    }
    stream.write_all(CONNECTED_STATUS).await?;
    serve_conn(Conn::Tcp(stream), table).await
}

async fn serve_codec(
    conn: Conn,
    codec_id: CodecId,
    table: Arc<ServiceTable>,
    handle_timeout: Duration,
) -> Result<()> {
    let (mut reader, writer) = codec::split(conn, codec_id);
    let writer = Arc::new(TokioMutex::new(writer));

    loop {
        let header = match reader.read_header().await {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        let arg_bytes = match reader.read_body_raw().await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };

        match table.lookup(&header.service_method) {
            Ok((_service, method)) => {
                tokio::spawn(handle_request(
                    Arc::clone(&writer),
                    method,
                    codec_id,
                    header,
                    arg_bytes,
                    handle_timeout,
                ));
            }
            Err(e) => {
                send_error(&writer, codec_id, header, e).await;
            }
        }
    }
}

/// Races the handler against `handle_timeout`. Only one of the two select
/// arms below ever calls `send_*`, so exactly one response is ever written
/// per request: if the timer wins, the handler's result (whenever it
/// eventually arrives) is simply dropped along with the receiver, and the
/// handler task's send on a closed channel is a harmless no-op.
async fn handle_request(
    writer: Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    method: Arc<dyn crate::service::ErasedMethod>,
    codec_id: CodecId,
    header: Header,
    arg_bytes: Vec<u8>,
    handle_timeout: Duration,
) {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = method.invoke(codec_id, &arg_bytes).await;
        let _ = tx.send(result);
    });

    if handle_timeout.is_zero() {
        match rx.await {
            Ok(Ok(reply_bytes)) => send_ok(&writer, header, reply_bytes).await,
            Ok(Err(e)) => send_error(&writer, codec_id, header, e).await,
            Err(_) => send_error(&writer, codec_id, header, RpcError::Shutdown).await,
        }
        return;
    }

    tokio::select! {
        result = rx => {
            match result {
                Ok(Ok(reply_bytes)) => send_ok(&writer, header, reply_bytes).await,
                Ok(Err(e)) => send_error(&writer, codec_id, header, e).await,
                Err(_) => send_error(&writer, codec_id, header, RpcError::Shutdown).await,
            }
        }
        _ = tokio::time::sleep(handle_timeout) => {
            send_error(&writer, codec_id, header, RpcError::HandleTimeout).await;
        }
    }
}

async fn send_ok(
    writer: &Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    header: Header,
    reply_bytes: Vec<u8>,
) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_raw(&header, &reply_bytes).await {
        tracing::debug!(error = %e, "response write failed");
    }
}

async fn send_error(
    writer: &Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    codec_id: CodecId,
    mut header: Header,
    err: RpcError,
) {
    header.err = err.to_string();
    let body = codec::encode(codec_id, &()).unwrap_or_default();
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_raw(&header, &body).await {
        tracing::debug!(error = %e, "error response write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::codec::HandshakeOption;
    use crate::service::ServiceBuilder;
    use std::sync::Arc as StdArc;

    struct Adder;

    fn adder_service() -> ServiceEntry {
        #[derive(serde::Deserialize)]
        struct Args {
            a: i64,
            b: i64,
        }
        #[derive(serde::Serialize, Default)]
        struct Reply(i64);

        ServiceBuilder::new("Adder", Adder)
            .method("Sum", |_h: StdArc<Adder>, arg: Args| async move {
                Ok::<_, String>(Reply(arg.a + arg.b))
            })
            .build()
    }

    #[tokio::test]
    async fn unknown_method_gets_a_header_error_not_a_disconnect() {
        let server = Server::new();
        server.register(adder_service()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let table = server.service_table();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_conn(Conn::Tcp(stream), table).await;
        });

        let client = Client::dial("tcp", &addr, HandshakeOption::default())
            .await
            .unwrap();

        #[derive(serde::Serialize)]
        struct Args {
            a: i64,
            b: i64,
        }
        #[derive(serde::Deserialize, Default)]
        struct Reply(i64);

        let err: Result<Reply> = client.call("Adder.Missing", &Args { a: 1, b: 2 }).await;
        assert!(matches!(err, Err(RpcError::User(_))));

        // the connection must still be usable afterward
        let reply: Reply = client.call("Adder.Sum", &Args { a: 4, b: 5 }).await.unwrap();
        assert_eq!(reply.0, 9);
    }

    #[tokio::test]
    async fn handle_timeout_returns_error_and_drops_late_result() {
        struct Slow;
        let table = Arc::new(ServiceTable::new());
        table
            .register(
                ServiceBuilder::new("Slow", Slow)
                    .method("Wait", |_h: StdArc<Slow>, _arg: ()| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(1i64)
                    })
                    .build(),
            )
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_one(Conn::Tcp(stream), table, Duration::from_millis(10)).await;
        });

        let client = Client::dial("tcp", &addr, HandshakeOption::default())
            .await
            .unwrap();
        let result: Result<i64> = client.call("Slow.Wait", &()).await;
        assert!(matches!(result, Err(RpcError::User(msg)) if msg.contains("handle timeout")));
    }

    #[tokio::test]
    async fn http_connect_tunnel_serves_requests() {
        let server = Server::new();
        server.register(adder_service()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            server.accept_http(listener).await;
        });

        let client = Client::dial_http("tcp", &addr, HandshakeOption::default())
            .await
            .unwrap();

        #[derive(serde::Serialize)]
        struct Args {
            a: i64,
            b: i64,
        }
        #[derive(serde::Deserialize)]
        struct Reply(i64);

        let reply: Reply = client.call("Adder.Sum", &Args { a: 20, b: 22 }).await.unwrap();
        assert_eq!(reply.0, 42);
    }
}
