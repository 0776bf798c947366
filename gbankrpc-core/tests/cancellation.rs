mod common;

use std::time::Duration;

use common::{spawn_tcp_server, split_network_addr, Args, Reply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::error::RpcError;
use gbankrpc_core::Client;

#[tokio::test]
async fn context_cancel_aborts_a_sleeping_call() {
    let rpc_addr = spawn_tcp_server().await;
    let (network, addr) = split_network_addr(&rpc_addr);
    let client = Client::dial(network, addr, HandshakeOption::default()).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result: Result<Reply, _> = client
        .call_with_token("Foo.Sleep", &Args { num1: 5, num2: 0 }, cancel)
        .await;

    assert!(matches!(result, Err(RpcError::Canceled(_))));
}

#[tokio::test]
async fn a_late_reply_to_a_canceled_call_is_discarded() {
    let rpc_addr = spawn_tcp_server().await;
    let (network, addr) = split_network_addr(&rpc_addr);
    let client = Client::dial(network, addr, HandshakeOption::default()).await.unwrap();

    let result: Result<Reply, _> = client
        .call_timeout("Foo.Sleep", &Args { num1: 1, num2: 1 }, Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(RpcError::Canceled(_))));

    // The connection stays usable for the next call once the late reply
    // for the canceled one eventually arrives and is dropped.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let reply: Reply = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await.unwrap();
    assert_eq!(reply.0, 5);
}
