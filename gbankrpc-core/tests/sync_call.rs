mod common;

use common::{spawn_tcp_server, split_network_addr, Args, Reply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::Client;

#[tokio::test]
async fn sum_round_trips_over_tcp() {
    let rpc_addr = spawn_tcp_server().await;
    let (network, addr) = split_network_addr(&rpc_addr);
    let client = Client::dial(network, addr, HandshakeOption::default()).await.unwrap();

    let reply: Reply = client.call("Foo.Sum", &Args { num1: 4, num2: 5 }).await.unwrap();
    assert_eq!(reply.0, 9);

    client.close().await.unwrap();
}

#[tokio::test]
async fn many_concurrent_calls_share_one_connection() {
    let rpc_addr = spawn_tcp_server().await;
    let (network, addr) = split_network_addr(&rpc_addr);
    let client = std::sync::Arc::new(Client::dial(network, addr, HandshakeOption::default()).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = std::sync::Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let reply: Reply = client
                .call("Foo.Sum", &Args { num1: i, num2: i * i })
                .await
                .unwrap();
            assert_eq!(reply.0, i + i * i);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}
