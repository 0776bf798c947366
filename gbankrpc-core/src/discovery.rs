//! Service discovery: a pluggable way for [`crate::xclient::XClient`] to
//! learn which addresses currently back a service.
//!
//! The original interface's `Get`/`GetAll` refresh synchronously before
//! reading; that doesn't translate to async Rust (a sync method can't await
//! an HTTP call without blocking the runtime), so here every method is
//! async and [`PullDiscovery`] awaits its own refresh before reading,
//! exactly where the original did the same work inline.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use rand::Rng;

use crate::error::{Result, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// A source of live service addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Updates the address list from whatever backs this discovery source.
    /// A no-op for [`StaticDiscovery`].
    async fn refresh(&self) -> Result<()>;

    /// Replaces the address list directly.
    async fn update(&self, servers: Vec<String>);

    /// Picks one address by `mode`. Fails if the list is empty.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns every known address.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct StaticInner {
    servers: Vec<String>,
    index: usize,
}

/// An in-memory, manually-updated address list with random or round-robin
/// selection.
pub struct StaticDiscovery {
    inner: StdMutex<StaticInner>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        StaticDiscovery {
            inner: StdMutex::new(StaticInner { servers, index }),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.inner.lock().unwrap().servers = servers;
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.servers.len();
        if n == 0 {
            return Err(RpcError::Protocol("discovery: server list is empty".into()));
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let s = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(s)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(inner_servers(&self.inner))
    }
}

fn inner_servers(inner: &StdMutex<StaticInner>) -> Vec<String> {
    inner.lock().unwrap().servers.clone()
}

const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps [`StaticDiscovery`] with a registry URL: `get`/`get_all` first
/// pull a fresh address list from the registry if `timeout` has elapsed
/// since the last pull.
pub struct PullDiscovery {
    static_disc: StaticDiscovery,
    registry_addr: String,
    timeout: Duration,
    last_update: StdMutex<Option<Instant>>,
    http: HyperClient<HttpConnector, Empty<Bytes>>,
}

impl PullDiscovery {
    pub fn new(registry_addr: impl Into<String>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_PULL_TIMEOUT
        } else {
            timeout
        };
        PullDiscovery {
            static_disc: StaticDiscovery::new(Vec::new()),
            registry_addr: registry_addr.into(),
            timeout,
            last_update: StdMutex::new(None),
            http: HyperClient::builder(TokioExecutor::new()).build_http(),
        }
    }
}

#[async_trait]
impl Discovery for PullDiscovery {
    async fn refresh(&self) -> Result<()> {
        {
            let last = *self.last_update.lock().unwrap();
            if let Some(last) = last {
                if last.elapsed() < self.timeout {
                    return Ok(());
                }
            }
        }

        tracing::debug!(registry = %self.registry_addr, "refreshing servers from registry");
        let uri: hyper::Uri = self
            .registry_addr
            .parse()
            .map_err(|e| RpcError::Protocol(format!("invalid registry address: {e}")))?;
        let resp = self.http.get(uri).await.map_err(|e| {
            RpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let servers = resp
            .headers()
            .get("X-GBankRPC-servers")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        self.static_disc.update(servers).await;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.static_disc.update(servers).await;
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.static_disc.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.static_disc.get_all().await
    }
}
