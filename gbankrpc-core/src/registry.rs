//! Registry: a tiny standalone HTTP service that tracks which server
//! addresses are currently alive via POSTed heartbeats, and hands the list
//! back out on GET. [`crate::discovery::PullDiscovery`] is the client side
//! of this same protocol.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};

const HEADER_SERVERS: &str = "X-GBankRPC-servers";
const HEADER_SERVER: &str = "X-GBankRPC-server";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Tracks live servers by the time they last sent a heartbeat; anything
/// that hasn't POSTed within `timeout` is dropped the next time the list is
/// read. `timeout == Duration::ZERO` means "never expire", retained for
/// tests that want a deterministic server list.
pub struct GBankRegistry {
    timeout: Duration,
    servers: StdMutex<HashMap<String, Instant>>,
}

impl GBankRegistry {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(GBankRegistry {
            timeout,
            servers: StdMutex::new(HashMap::new()),
        })
    }

    fn put_server(&self, addr: String) {
        self.servers.lock().unwrap().insert(addr, Instant::now());
    }

    /// Sweeps expired entries (unless `timeout` is zero, meaning "never
    /// expire") and returns the remaining addresses, sorted.
    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        if !self.timeout.is_zero() {
            let now = Instant::now();
            servers.retain(|_, start| now.duration_since(*start) < self.timeout);
        }
        let mut res: Vec<String> = servers.keys().cloned().collect();
        res.sort();
        res
    }

    /// Accepts connections on `listener` and serves the registry protocol
    /// on every one of them until the listener errors.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let registry = Arc::clone(&registry);
                            async move { registry.handle(req).await }
                        });
                        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::debug!(error = %e, "registry connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "registry accept failed");
                    return;
                }
            }
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match *req.method() {
            Method::GET => Response::builder()
                .header(HEADER_SERVERS, self.alive_servers().join(","))
                .body(Full::new(Bytes::new()))
                .unwrap(),
            Method::POST => {
                let addr = req
                    .headers()
                    .get(HEADER_SERVER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                match addr {
                    Some(addr) => {
                        self.put_server(addr);
                        Response::new(Full::new(Bytes::new()))
                    }
                    None => Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::new(Bytes::new()))
                        .unwrap(),
                }
            }
            _ => Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        };
        Ok(response)
    }
}

async fn send_heartbeat(
    client: &HyperClient<HttpConnector, Empty<Bytes>>,
    registry_addr: &str,
    server_addr: &str,
) -> Result<()> {
    let uri: hyper::Uri = registry_addr
        .parse()
        .map_err(|e| RpcError::Protocol(format!("invalid registry address: {e}")))?;
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(HEADER_SERVER, server_addr)
        .body(Empty::<Bytes>::new())
        .map_err(|e| RpcError::Protocol(format!("invalid heartbeat request: {e}")))?;
    client.request(req).await.map_err(|e| {
        RpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    Ok(())
}

/// Sends one heartbeat immediately, then spawns a background task that
/// repeats it every `interval` until a send fails, matching the original's
/// "log and stop" behavior rather than retrying forever.
pub async fn spawn_heartbeat(
    registry_addr: impl Into<String>,
    server_addr: impl Into<String>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    let registry_addr = registry_addr.into();
    let server_addr = server_addr.into();
    let interval = if interval.is_zero() {
        DEFAULT_TIMEOUT.saturating_sub(Duration::from_secs(60))
    } else {
        interval
    };

    let client = HyperClient::builder(TokioExecutor::new()).build_http();
    send_heartbeat(&client, &registry_addr, &server_addr).await?;

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&client, &registry_addr, &server_addr).await {
                tracing::warn!(error = %e, "heartbeat failed, stopping");
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Discovery, PullDiscovery};

    #[tokio::test]
    async fn heartbeat_then_get_reports_the_server() {
        let registry = GBankRegistry::new(Duration::from_secs(60));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry_url = format!("http://{addr}/registry");
        tokio::spawn(Arc::clone(&registry).serve(listener));

        spawn_heartbeat(registry_url.clone(), "tcp@127.0.0.1:9999", Duration::from_secs(30))
            .await
            .unwrap();

        let discovery = PullDiscovery::new(registry_url, Duration::from_millis(1));
        let servers = discovery.get_all().await.unwrap();
        assert_eq!(servers, vec!["tcp@127.0.0.1:9999".to_string()]);
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_read() {
        let registry = GBankRegistry::new(Duration::from_millis(20));
        registry.put_server("tcp@127.0.0.1:1".to_string());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.alive_servers().is_empty());
    }

    #[tokio::test]
    async fn zero_timeout_means_servers_never_expire() {
        let registry = GBankRegistry::new(Duration::ZERO);
        registry.put_server("tcp@127.0.0.1:1".to_string());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:1".to_string()]);
    }

    #[tokio::test]
    async fn post_without_header_reports_a_server_error() {
        let registry = GBankRegistry::new(Duration::from_secs(60));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&registry).serve(listener));

        let client: HyperClient<HttpConnector, Empty<Bytes>> =
            HyperClient::builder(TokioExecutor::new()).build_http();
        let uri: hyper::Uri = format!("http://{addr}/registry").parse().unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = client.request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
