//! Transport-level connection helpers: TCP, Unix domain sockets, and the
//! HTTP CONNECT tunnel used to multiplex the wire protocol over an ordinary
//! HTTP port.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::codec::DEFAULT_RPC_PATH;
use crate::error::{Result, RpcError};

/// A connected duplex stream, either TCP or Unix domain socket.
///
/// A small hand-rolled enum rather than a boxed trait object: there are only
/// two transports, the set is closed, and implementing `AsyncRead`/
/// `AsyncWrite` by matching on the variant avoids the extra indirection a
/// `Box<dyn ...>` would need.
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connects a raw transport, no handshake. `network` is `"tcp"` or `"unix"`.
pub async fn connect_raw(network: &str, address: &str) -> Result<Conn> {
    match network {
        "tcp" => Ok(Conn::Tcp(TcpStream::connect(address).await?)),
        "unix" => Ok(Conn::Unix(UnixStream::connect(address).await?)),
        other => Err(RpcError::Protocol(format!("unsupported network {other}"))),
    }
}

const CONNECTED_STATUS: &str = "200 Connected to Gbank RPC";

/// Sends `CONNECT /gbankrpc/ HTTP/1.0` and validates the server's response
/// status line before handing the raw connection back for the usual wire
/// handshake.
pub async fn http_connect(mut conn: Conn) -> Result<Conn> {
    let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n");
    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut reader = BufReader::new(conn);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    // Drain the rest of the (empty) header block up to the blank line.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    if !status_line.contains(CONNECTED_STATUS) {
        return Err(RpcError::Protocol(format!(
            "unexpected HTTP response: {}",
            status_line.trim()
        )));
    }

    // BufReader may have buffered bytes past the blank line (pipelined wire
    // traffic); since we only ever read exactly through the header block
    // above, and the client does not send anything before the server's
    // handshake response, there is nothing left buffered to lose here.
    Ok(reader.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UnixListener};

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let conn = connect_raw("tcp", &addr.to_string()).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn connects_over_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gbankrpc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let path_str = path.to_str().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let conn = connect_raw("unix", &path_str).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn unsupported_network_is_rejected() {
        let err = connect_raw("quic", "127.0.0.1:0").await;
        assert!(matches!(err, Err(RpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn http_connect_validates_status_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.0 200 Connected to Gbank RPC\n\n")
                .await
                .unwrap();
            sock
        });

        let conn = Conn::Tcp(TcpStream::connect(addr).await.unwrap());
        let result = http_connect(conn).await;
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_rejects_bad_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.0 405 Method Not Allowed\n\n")
                .await
                .unwrap();
        });

        let conn = Conn::Tcp(TcpStream::connect(addr).await.unwrap());
        let result = http_connect(conn).await;
        assert!(matches!(result, Err(RpcError::Protocol(_))));
    }
}
