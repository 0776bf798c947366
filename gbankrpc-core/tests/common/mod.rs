#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gbankrpc_core::service::{ServiceBuilder, ServiceEntry, ServiceTable};
use gbankrpc_core::transport::Conn;
use gbankrpc_core::{server, Server};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UnixListener};

#[derive(Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
pub struct Reply(pub i64);

pub struct Foo;

pub fn foo_service() -> ServiceEntry {
    ServiceBuilder::new("Foo", Foo)
        .method("Sum", |_h: Arc<Foo>, arg: Args| async move {
            Ok::<_, String>(Reply(arg.num1 + arg.num2))
        })
        .method("Sleep", |_h: Arc<Foo>, arg: Args| async move {
            tokio::time::sleep(Duration::from_secs(arg.num1 as u64)).await;
            Ok::<_, String>(Reply(arg.num1 + arg.num2))
        })
        .build()
}

pub fn foo_table() -> Arc<ServiceTable> {
    let table = Arc::new(ServiceTable::new());
    table.register(foo_service()).unwrap();
    table
}

/// Starts a TCP server hosting `Foo` and returns its `tcp@host:port` address.
pub async fn spawn_tcp_server() -> String {
    let table = foo_table();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = Server::new();
    srv.register(foo_service()).unwrap();
    tokio::spawn(async move { srv.accept_tcp(listener).await });
    format!("tcp@{addr}")
}

/// Starts a server on an ephemeral Unix socket and returns its path.
pub async fn spawn_unix_server() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gbankrpc.sock");
    // Keep the tempdir alive for the process lifetime of the test binary.
    std::mem::forget(dir);
    let listener = UnixListener::bind(&path).unwrap();
    let srv = Server::new();
    srv.register(foo_service()).unwrap();
    tokio::spawn(async move { srv.accept_unix(listener).await });
    path
}

/// Starts a TCP listener that accepts exactly one connection, serves it with
/// a caller-supplied handle timeout, then stops.
pub async fn spawn_one_shot_server(handle_timeout: Duration) -> String {
    let table = foo_table();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = server::serve_one(Conn::Tcp(stream), table, handle_timeout).await;
    });
    format!("tcp@{addr}")
}

pub fn split_network_addr(rpc_addr: &str) -> (&str, &str) {
    rpc_addr.split_once('@').expect("address must be network@addr")
}
