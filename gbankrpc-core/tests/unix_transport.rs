mod common;

use common::{spawn_unix_server, Args, Reply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::Client;

#[tokio::test]
async fn sum_round_trips_over_a_unix_socket() {
    let path = spawn_unix_server().await;
    let client = Client::dial("unix", path.to_str().unwrap(), HandshakeOption::default())
        .await
        .unwrap();

    let reply: Reply = client.call("Foo.Sum", &Args { num1: 7, num2: 8 }).await.unwrap();
    assert_eq!(reply.0, 15);

    client.close().await.unwrap();
}
