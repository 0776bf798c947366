use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

/// Fixed value placed in every [`HandshakeOption`] so a receiver can detect
/// non-GBankRPC traffic before trusting anything else on the wire.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

pub const DEFAULT_RPC_PATH: &str = "/gbankrpc/";
pub const DEFAULT_DEBUG_PATH: &str = "/gbankrpc/debug";

/// Identifies which body codec a connection negotiated, keyed by the same
/// string ids the wire handshake carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecId {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/bincode")]
    Bincode,
}

impl CodecId {
    pub fn as_id(self) -> &'static str {
        match self {
            CodecId::Json => "application/json",
            CodecId::Bincode => "application/bincode",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "application/json" => Some(CodecId::Json),
            "application/bincode" => Some(CodecId::Bincode),
            _ => None,
        }
    }
}

impl Default for CodecId {
    fn default() -> Self {
        CodecId::Bincode
    }
}

/// Per-message frame header. Written before every body, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    /// Empty means success.
    #[serde(default)]
    pub err: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            err: String::new(),
        }
    }

    pub fn is_err(&self) -> bool {
        !self.err.is_empty()
    }
}

/// The handshake sent once per connection, by the client, before any framed
/// message. `magic`/`codec` are validated by the server; a mismatch on
/// either closes the connection without a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeOption {
    pub magic: u32,
    pub codec: String,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for HandshakeOption {
    fn default() -> Self {
        HandshakeOption {
            magic: MAGIC_NUMBER,
            codec: CodecId::default().as_id().to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl HandshakeOption {
    pub fn codec_id(&self) -> Option<CodecId> {
        CodecId::from_id(&self.codec)
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

fn encode_value<T: Serialize>(codec: CodecId, value: &T) -> Result<Vec<u8>> {
    match codec {
        CodecId::Json => Ok(serde_json::to_vec(value)?),
        CodecId::Bincode => Ok(bincode::serialize(value)?),
    }
}

fn decode_value<T: DeserializeOwned>(codec: CodecId, bytes: &[u8]) -> Result<T> {
    match codec {
        CodecId::Json => Ok(serde_json::from_slice(bytes)?),
        CodecId::Bincode => Ok(bincode::deserialize(bytes)?),
    }
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Writes one length-prefixed, codec-encoded value to an async sink.
///
/// This is the self-delimiting mechanism for this wire: Go's default codec
/// (`encoding/gob`) is natively self-delimiting, but `serde_json`/`bincode`
/// are not, so every value is length-prefixed instead.
async fn write_framed<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    codec: CodecId,
    value: &T,
) -> Result<()> {
    let bytes = encode_value(codec, value)?;
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    Ok(())
}

async fn read_framed_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes the handshake [`HandshakeOption`]. Always JSON, regardless of the
/// negotiated body codec, since the body codec *is* what's being negotiated.
pub async fn write_option<W: AsyncWrite + Unpin>(w: &mut W, opt: &HandshakeOption) -> Result<()> {
    write_framed(w, CodecId::Json, opt).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_option<R: AsyncRead + Unpin>(r: &mut R) -> Result<HandshakeOption> {
    let bytes = read_framed_bytes(r).await?;
    decode_value(CodecId::Json, &bytes)
}

/// The read half of a framed connection, bound to the negotiated
/// [`CodecId`]. Owned exclusively by whichever task is reading (the
/// client's dedicated receive task, or the server's per-connection serve
/// loop) — never shared.
pub struct FrameReader<R> {
    stream: R,
    codec: CodecId,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, codec: CodecId) -> Self {
        FrameReader { stream, codec }
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Fails with a transport error on EOF or a malformed frame.
    pub async fn read_header(&mut self) -> Result<Header> {
        let bytes = read_framed_bytes(&mut self.stream).await?;
        decode_value(self.codec, &bytes)
    }

    /// Reads the body paired with the most recently read header.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = read_framed_bytes(&mut self.stream).await?;
        decode_value(self.codec, &bytes)
    }

    /// Reads the raw, still-encoded bytes of the next body without
    /// interpreting them as any particular type. Used by the server, which
    /// only learns the argument type after resolving the service method,
    /// and by the client's receive loop, which decodes lazily once the
    /// caller's `Reply` type is known.
    pub async fn read_body_raw(&mut self) -> Result<Vec<u8>> {
        read_framed_bytes(&mut self.stream).await
    }

    /// Consumes and drops the next body's bytes.
    pub async fn discard_body(&mut self) -> Result<()> {
        read_framed_bytes(&mut self.stream).await.map(|_| ())
    }
}

/// The write half of a framed connection. Writes must be serialized by the
/// caller via a sending lock; this type is not internally concurrency-safe.
pub struct FrameWriter<W> {
    stream: W,
    codec: CodecId,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W, codec: CodecId) -> Self {
        FrameWriter { stream, codec }
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Atomically emits one `{header, body}` pair; flushes before returning.
    /// A write failure closes the connection.
    pub async fn write<T: Serialize>(&mut self, header: &Header, body: &T) -> Result<()> {
        let result = async {
            write_framed(&mut self.stream, self.codec, header).await?;
            write_framed(&mut self.stream, self.codec, body).await?;
            self.stream.flush().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = self.stream.shutdown().await;
        }
        result
    }

    /// Writes a pre-encoded body (used by the server, which already has the
    /// reply serialized to bytes by the dispatch closure).
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let result = async {
            write_framed(&mut self.stream, self.codec, header).await?;
            let len = body.len() as u32;
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(body).await?;
            self.stream.flush().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = self.stream.shutdown().await;
        }
        result
    }

    /// Shuts the underlying stream down. Used by `Client::close`; safe to
    /// call even if a prior write already shut the stream down itself.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Splits a duplex async byte stream into an independent framed reader and
/// writer, both bound to the same negotiated [`CodecId`]. This is what lets
/// a `Client` run one dedicated receive task while concurrently registering
/// and sending new calls, and what lets a `Server` read its serve loop while
/// many in-flight request handlers write responses under a shared lock.
pub fn split<S>(
    stream: S,
    codec: CodecId,
) -> (
    FrameReader<tokio::io::ReadHalf<S>>,
    FrameWriter<tokio::io::WriteHalf<S>>,
)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r, codec), FrameWriter::new(w, codec))
}

/// Codec-keyed encode/decode, exposed for the service dispatch layer which
/// only gets raw bytes and a [`CodecId`] (the type is known only by the
/// registered method, not by the codec itself).
pub fn encode(codec: CodecId, value: &impl Serialize) -> Result<Vec<u8>> {
    encode_value(codec, value)
}

pub fn decode<T: DeserializeOwned>(codec: CodecId, bytes: &[u8]) -> Result<T> {
    decode_value(codec, bytes)
}
