//! Fleet client: load-balances single calls across a [`Discovery`] set and
//! fans a call out to every known server at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::codec::HandshakeOption;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Result, RpcError};

/// Load-balances calls across whatever [`Discovery`] currently reports,
/// keeping one [`Client`] connection alive per address it has dialed.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opt: HandshakeOption,
    clients: TokioMutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opt: HandshakeOption) -> Self {
        XClient {
            discovery,
            mode,
            opt,
            clients: TokioMutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            let _ = client.close().await;
            clients.remove(rpc_addr);
        }

        let client = Arc::new(Client::xdial(rpc_addr, self.opt.clone()).await?);
        clients.insert(rpc_addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn call_one<Arg, Reply>(
        &self,
        addr: &str,
        service_method: &str,
        args: &Arg,
    ) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        let client = self.client_for(addr).await?;
        client.call(service_method, args).await
    }

    /// Picks one address via the configured [`SelectMode`] and calls it.
    pub async fn call<Arg, Reply>(&self, service_method: impl Into<String>, args: &Arg) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        let service_method = service_method.into();
        let addr = self.discovery.get(self.mode).await?;
        self.call_one(&addr, &service_method, args).await
    }

    /// Calls every known server concurrently, under a token derived from
    /// `token` (so canceling `token` — e.g. a caller-imposed deadline —
    /// cancels every call still in flight, not just the ones this method
    /// cancels internally on first failure). The first successful reply is
    /// returned; the first error cancels every call still in flight. All
    /// calls are awaited to completion regardless of outcome, matching a
    /// true broadcast rather than a race that abandons stragglers.
    pub async fn broadcast<Arg, Reply>(
        &self,
        service_method: impl Into<String>,
        args: &Arg,
        token: CancellationToken,
    ) -> Result<Reply>
    where
        Arg: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        let service_method = service_method.into();
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::Protocol("xclient: no servers available".into()));
        }

        let cancel = token.child_token();
        let reply_slot: StdMutex<Option<Reply>> = StdMutex::new(None);
        let error_slot: StdMutex<Option<RpcError>> = StdMutex::new(None);

        let calls = servers.iter().map(|addr| {
            let cancel = cancel.clone();
            let service_method = &service_method;
            async {
                let result: Result<Reply> = async {
                    let client = self.client_for(addr).await?;
                    client
                        .call_with_token(service_method.as_str(), args, cancel.clone())
                        .await
                }
                .await;

                match result {
                    Ok(reply) => {
                        let mut slot = reply_slot.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(reply);
                        }
                    }
                    Err(e) => {
                        let mut slot = error_slot.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                            cancel.cancel();
                        }
                    }
                }
            }
        });

        futures_util::future::join_all(calls).await;

        if let Some(e) = error_slot.into_inner().unwrap() {
            return Err(e);
        }
        reply_slot
            .into_inner()
            .unwrap()
            .ok_or_else(|| RpcError::Protocol("xclient: broadcast produced no reply".into()))
    }

    /// Like [`XClient::broadcast`], bounded by an overall deadline rather
    /// than a caller-supplied token: the whole fleet-wide call is canceled
    /// once `timeout` elapses, even if every server is still responding.
    pub async fn broadcast_timeout<Arg, Reply>(
        &self,
        service_method: impl Into<String>,
        args: &Arg,
        timeout: Duration,
    ) -> Result<Reply>
    where
        Arg: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        let token = CancellationToken::new();
        let deadline = token.clone();
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });
        let result = self.broadcast(service_method, args, token).await;
        sleeper.abort();
        result
    }

    /// Closes every cached connection.
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
        Ok(())
    }
}
