//! Client-side call multiplexer: one connection, many concurrent in-flight
//! calls correlated by sequence number.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::WriteHalf;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecId, FrameReader, FrameWriter, Header, HandshakeOption};
use crate::error::{Result, RpcError};
use crate::transport::{self, Conn};

type PendingResult = Result<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    UserClosed,
    Shutdown,
}

struct Inner {
    mode: Mode,
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<PendingResult>>,
}

struct SharedState {
    codec: CodecId,
    inner: StdMutex<Inner>,
}

impl SharedState {
    fn register(
        &self,
        tx: oneshot::Sender<PendingResult>,
    ) -> std::result::Result<u64, (RpcError, oneshot::Sender<PendingResult>)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Open {
            return Err((RpcError::Shutdown, tx));
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove(&self, seq: u64) -> Option<oneshot::Sender<PendingResult>> {
        self.inner.lock().unwrap().pending.remove(&seq)
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().mode == Mode::Open
    }
}

/// A pending asynchronous call. Produced by [`Client::go`]; awaiting
/// [`Call::done`] blocks until the reply arrives, the connection fails, or
/// the call is dropped via cancellation.
pub struct Call<Reply> {
    pub seq: u64,
    pub service_method: String,
    receiver: oneshot::Receiver<PendingResult>,
    codec: CodecId,
    _marker: PhantomData<Reply>,
}

impl<Reply: DeserializeOwned> Call<Reply> {
    pub async fn done(self) -> Result<Reply> {
        let bytes = self
            .receiver
            .await
            .map_err(|_| RpcError::Shutdown)??;
        codec::decode(self.codec, &bytes)
    }
}

/// One framed connection to a GBankRPC server, multiplexing concurrent
/// calls over a single socket.
pub struct Client {
    writer: Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    shared: Arc<SharedState>,
    receive_task: JoinHandle<()>,
}

impl Client {
    /// Sends the handshake `Option` and spawns the dedicated receive task.
    /// `conn` must already be the final raw transport (TCP, Unix, or an
    /// HTTP-CONNECT-upgraded tunnel) — this only performs the wire
    /// handshake, never a network dial.
    pub async fn new(mut conn: Conn, opt: HandshakeOption) -> Result<Client> {
        codec::write_option(&mut conn, &opt).await?;
        let codec_id = opt.codec_id().ok_or_else(|| {
            RpcError::Protocol(format!("invalid codec type {}", opt.codec))
        })?;

        let (reader, writer) = codec::split(conn, codec_id);
        let writer = Arc::new(TokioMutex::new(writer));
        let shared = Arc::new(SharedState {
            codec: codec_id,
            inner: StdMutex::new(Inner {
                mode: Mode::Open,
                seq: 1,
                pending: HashMap::new(),
            }),
        });

        let receive_task = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&shared),
        ));

        Ok(Client {
            writer,
            shared,
            receive_task,
        })
    }

    /// Dials a raw transport (`"tcp"` or `"unix"`) and performs the
    /// handshake, both bounded by `opt.connect_timeout` (a zero timeout
    /// disables the bound entirely).
    ///
    /// The handshake runs in its own spawned task so a timeout can abandon
    /// it without blocking the caller; if the handshake finishes after the
    /// caller has already given up, the resulting `Client` is closed
    /// immediately rather than leaked running a receive loop nobody owns.
    pub async fn dial(network: &str, address: &str, opt: HandshakeOption) -> Result<Client> {
        Self::dial_timeout(network, address, opt, false).await
    }

    /// Like [`Client::dial`], but tunnels the connection through an HTTP
    /// `CONNECT` request first (for servers multiplexed behind a normal
    /// HTTP listener).
    pub async fn dial_http(network: &str, address: &str, opt: HandshakeOption) -> Result<Client> {
        Self::dial_timeout(network, address, opt, true).await
    }

    /// Dials `"proto@address"`, where `proto` is `"http"` for an
    /// HTTP-CONNECT-tunnelled connection or a raw network name (`"tcp"`,
    /// `"unix"`) otherwise.
    pub async fn xdial(rpc_addr: &str, opt: HandshakeOption) -> Result<Client> {
        let (network, address) = rpc_addr.split_once('@').ok_or_else(|| {
            RpcError::Protocol(format!(
                "rpc client err: wrong format '{rpc_addr}', expect 'protocol@addr'"
            ))
        })?;
        match network {
            "http" => Self::dial_http("tcp", address, opt).await,
            other => Self::dial_timeout(other, address, opt, false).await,
        }
    }

    async fn dial_timeout(
        network: &str,
        address: &str,
        opt: HandshakeOption,
        http: bool,
    ) -> Result<Client> {
        let connect_timeout = opt.connect_timeout;

        let raw = if connect_timeout.is_zero() {
            transport::connect_raw(network, address).await?
        } else {
            tokio::time::timeout(connect_timeout, transport::connect_raw(network, address))
                .await
                .map_err(|_| RpcError::ConnectTimeout)??
        };

        if connect_timeout.is_zero() {
            let conn = if http {
                transport::http_connect(raw).await?
            } else {
                raw
            };
            return Client::new(conn, opt).await;
        }

        // The handshake runs detached so the timeout below can abandon it
        // without cancelling a half-finished handshake mid-write. If it
        // loses the race, `abandoned` tells it to close whatever `Client`
        // it produces instead of leaving it to run unobserved.
        let abandoned = Arc::new(AtomicBool::new(false));
        let abandoned_task = Arc::clone(&abandoned);
        let (tx, rx) = oneshot::channel();
        let opt_task = opt.clone();

        tokio::spawn(async move {
            let result = async move {
                let conn = if http {
                    transport::http_connect(raw).await?
                } else {
                    raw
                };
                Client::new(conn, opt_task).await
            }
            .await;

            if abandoned_task.load(Ordering::Acquire) {
                if let Ok(client) = result {
                    let _ = client.close().await;
                }
                return;
            }
            let _ = tx.send(result);
        });

        match tokio::time::timeout(connect_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Transport(std::io::Error::new(
                std::io::ErrorKind::Other,
                "handshake task dropped",
            ))),
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                Err(RpcError::ConnectTimeout)
            }
        }
    }

    /// Starts an asynchronous call, returning immediately with a [`Call`]
    /// that resolves once the reply arrives.
    pub async fn go<Arg, Reply>(&self, service_method: impl Into<String>, args: &Arg) -> Call<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        let service_method = service_method.into();
        let (tx, rx) = oneshot::channel();
        let seq = self.send(&service_method, tx, args).await.unwrap_or(0);
        Call {
            seq,
            service_method,
            receiver: rx,
            codec: self.shared.codec,
            _marker: PhantomData,
        }
    }

    /// Makes a synchronous call: registers it, writes it, and waits for the
    /// reply with no cancellation path.
    pub async fn call<Arg, Reply>(&self, service_method: impl Into<String>, args: &Arg) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        self.go(service_method, args).await.done().await
    }

    /// Makes a call that is abandoned if `cancel` resolves first. On
    /// cancellation the pending entry is discarded so a reply that arrives
    /// afterward is silently dropped by the receive loop rather than
    /// delivered to anyone.
    pub async fn call_with_cancel<Arg, Reply>(
        &self,
        service_method: impl Into<String>,
        args: &Arg,
        cancel: impl Future<Output = ()>,
    ) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        let call = self.go::<Arg, Reply>(service_method, args).await;
        let seq = call.seq;
        tokio::select! {
            result = call.done() => result,
            _ = cancel => {
                self.shared.remove(seq);
                Err(RpcError::Canceled("caller canceled the call".into()))
            }
        }
    }

    /// Makes a call bounded by a fixed duration.
    pub async fn call_timeout<Arg, Reply>(
        &self,
        service_method: impl Into<String>,
        args: &Arg,
        timeout: Duration,
    ) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        self.call_with_cancel(service_method, args, tokio::time::sleep(timeout))
            .await
    }

    /// Makes a call bound to a [`CancellationToken`], for callers that
    /// already propagate one cancellation signal across several calls.
    pub async fn call_with_token<Arg, Reply>(
        &self,
        service_method: impl Into<String>,
        args: &Arg,
        token: CancellationToken,
    ) -> Result<Reply>
    where
        Arg: Serialize,
        Reply: DeserializeOwned,
    {
        self.call_with_cancel(service_method, args, token.cancelled_owned())
            .await
    }

    async fn send(
        &self,
        service_method: &str,
        tx: oneshot::Sender<PendingResult>,
        args: &impl Serialize,
    ) -> Result<u64> {
        let mut writer = self.writer.lock().await;
        let seq = match self.shared.register(tx) {
            Ok(seq) => seq,
            Err((e, tx)) => {
                let _ = tx.send(Err(e.duplicate()));
                return Err(e);
            }
        };

        let header = Header::request(service_method, seq);
        if let Err(e) = writer.write(&header, args).await {
            if let Some(tx) = self.shared.remove(seq) {
                let _ = tx.send(Err(e.duplicate()));
            }
            return Err(e);
        }
        Ok(seq)
    }

    /// `true` while the connection is open and neither the caller nor the
    /// transport has shut it down.
    pub fn is_available(&self) -> bool {
        self.shared.is_open()
    }

    /// Closes the connection. Idempotent: a second call returns
    /// [`RpcError::Shutdown`] and does not touch the socket again.
    ///
    /// Terminates every still-pending [`Call`] with [`RpcError::Shutdown`]
    /// (the same path the receive loop uses when the transport itself
    /// fails), aborts the dedicated receive task so the read half drops
    /// immediately rather than lingering until `Drop`, and shuts down the
    /// write half — closing the connection in both directions instead of
    /// just half-closing the write side.
    pub async fn close(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.mode {
                Mode::UserClosed | Mode::Shutdown => return Err(RpcError::Shutdown),
                Mode::Open => inner.mode = Mode::UserClosed,
            }
        }
        self.receive_task.abort();
        terminate(&self.writer, &self.shared, RpcError::Shutdown).await;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

async fn receive_loop(
    mut reader: FrameReader<tokio::io::ReadHalf<Conn>>,
    writer: Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    shared: Arc<SharedState>,
) {
    loop {
        match reader.read_header().await {
            Ok(header) => match shared.remove(header.seq) {
                None => {
                    // No pending call for this seq (already canceled, or a
                    // stray reply); drop the body without decoding it.
                    let _ = reader.discard_body().await;
                }
                Some(tx) => {
                    if header.is_err() {
                        let _ = reader.discard_body().await;
                        let _ = tx.send(Err(RpcError::User(header.err)));
                    } else {
                        match reader.read_body_raw().await {
                            Ok(bytes) => {
                                let _ = tx.send(Ok(bytes));
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e.duplicate()));
                                terminate(&writer, &shared, e).await;
                                return;
                            }
                        }
                    }
                }
            },
            Err(e) => {
                terminate(&writer, &shared, e).await;
                return;
            }
        }
    }
}

async fn terminate(
    writer: &Arc<TokioMutex<FrameWriter<WriteHalf<Conn>>>>,
    shared: &Arc<SharedState>,
    err: RpcError,
) {
    // Lock order matches the rest of the client: sending lock first, then
    // the state lock, so a send-in-flight can never race a termination.
    let _writer_guard = writer.lock().await;
    let mut inner = shared.inner.lock().unwrap();
    inner.mode = Mode::Shutdown;
    for (_, tx) in inner.pending.drain() {
        let _ = tx.send(Err(err.duplicate()));
    }
}
