use std::time::Duration;

use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::error::RpcError;
use gbankrpc_core::Client;

#[tokio::test]
async fn dial_against_an_unroutable_address_times_out() {
    let opt = HandshakeOption {
        connect_timeout: Duration::from_millis(200),
        ..HandshakeOption::default()
    };
    // TEST-NET-1 (RFC 5737) reserved address; never completes a TCP handshake.
    let result = Client::dial("tcp", "10.255.255.1:9", opt).await;
    assert!(matches!(result, Err(RpcError::ConnectTimeout)));
}
