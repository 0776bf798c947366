mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_tcp_server, Args, Reply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::discovery::{Discovery, SelectMode, StaticDiscovery};
use gbankrpc_core::error::RpcError;
use gbankrpc_core::XClient;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn broadcast_fails_as_soon_as_one_server_is_unreachable() {
    let good = spawn_tcp_server().await;
    let bad = "tcp@127.0.0.1:1".to_string();

    let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::new(vec![good, bad]));
    let xc = XClient::new(discovery, SelectMode::Random, HandshakeOption::default());

    let result: Result<Reply, _> = xc
        .broadcast("Foo.Sum", &Args { num1: 1, num2: 2 }, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RpcError::Transport(_)) | Err(RpcError::Canceled(_))));
}

/// spec.md §8 scenario 6: a broadcast bounded by a caller deadline must be
/// able to give up on a server that is still alive but too slow, not just
/// one that is unreachable. `Foo.Sleep` sleeps for `num1` seconds, so a 5s
/// sleep against a 200ms deadline must surface as a canceled call.
#[tokio::test]
async fn broadcast_with_a_caller_deadline_cancels_a_slow_server() {
    let addr = spawn_tcp_server().await;
    let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::new(vec![addr]));
    let xc = XClient::new(discovery, SelectMode::Random, HandshakeOption::default());

    let result: Result<Reply, _> = xc
        .broadcast_timeout("Foo.Sleep", &Args { num1: 5, num2: 0 }, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(RpcError::Canceled(_))));
}
