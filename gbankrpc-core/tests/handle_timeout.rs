mod common;

use std::time::Duration;

use common::{spawn_one_shot_server, split_network_addr, Args, Reply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::error::RpcError;
use gbankrpc_core::Client;

#[tokio::test]
async fn server_side_handle_timeout_surfaces_as_a_header_error() {
    let rpc_addr = spawn_one_shot_server(Duration::from_millis(100)).await;
    let (network, addr) = split_network_addr(&rpc_addr);
    let client = Client::dial(network, addr, HandshakeOption::default()).await.unwrap();

    let result: Result<Reply, _> = client.call("Foo.Sleep", &Args { num1: 2, num2: 0 }).await;
    match result {
        Err(RpcError::User(msg)) => assert!(msg.contains("handle timeout")),
        other => panic!("expected a handle-timeout user error, got {other:?}"),
    }
}
