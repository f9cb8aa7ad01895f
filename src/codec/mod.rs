//! Wire codec: transport-agnostic framing and protobuf encode/decode of
//! `ToRadio`/`FromRadio`, plus channel-payload decryption.

pub mod crypto;
pub mod frame;

use crate::error::CoreError;
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proto::meshtastic_generated as pb;

/// A transport carries opaque `FromRadio` frames in and `ToRadio` frames
/// out. TCP and HTTP long-poll are the two shapes this core supports; both
/// implement this trait so `DeviceSession` never has to know which one it's
/// talking to.
#[async_trait]
pub trait Transport: Send {
    /// Block until the next decoded `FromRadio` frame is available, or a
    /// transport error occurs (never a decode error — decode happens above
    /// this layer once the raw bytes are out).
    async fn read_frame(&mut self) -> Result<Bytes, CoreError>;

    /// Write a `ToRadio` frame's raw protobuf bytes to the transport.
    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), CoreError>;
}

/// Raw TCP transport: `{0x94, 0xC3, hi, lo}` + protobuf payload, in both
/// directions.
pub struct TcpTransport {
    stream: TcpStream,
    decoder: frame::FrameDecoder,
    read_buf: [u8; 4096],
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::Transport(format!("connect {addr}: {e}")))?;
        Ok(TcpTransport {
            stream,
            decoder: frame::FrameDecoder::new(),
            read_buf: [0u8; 4096],
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_frame(&mut self) -> Result<Bytes, CoreError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Bytes::from(frame));
            }
            let n = self
                .stream
                .read(&mut self.read_buf)
                .await
                .map_err(|e| CoreError::Transport(format!("read: {e}")))?;
            if n == 0 {
                return Err(CoreError::Transport("connection closed".to_string()));
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), CoreError> {
        let framed = frame::encode_frame(payload);
        self.stream
            .write_all(&framed)
            .await
            .map_err(|e| CoreError::Transport(format!("write: {e}")))
    }
}

/// HTTP long-poll transport: `POST /api/v1/toradio` with a raw protobuf
/// body, `GET /api/v1/fromradio?all=true` drained by repeated polling
/// (empty body means idle — the caller is expected to poll again after a
/// short delay).
#[cfg(feature = "http-transport")]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "http-transport")]
impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl Transport for HttpTransport {
    async fn read_frame(&mut self) -> Result<Bytes, CoreError> {
        loop {
            let resp = self
                .client
                .get(format!("{}/api/v1/fromradio", self.base_url))
                .query(&[("all", "true")])
                .send()
                .await
                .map_err(|e| CoreError::Transport(format!("GET fromradio: {e}")))?;
            let body = resp
                .bytes()
                .await
                .map_err(|e| CoreError::Transport(format!("read fromradio body: {e}")))?;
            if body.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                continue;
            }
            return Ok(body);
        }
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), CoreError> {
        self.client
            .post(format!("{}/api/v1/toradio", self.base_url))
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| CoreError::Transport(format!("POST toradio: {e}")))?;
        Ok(())
    }
}

/// Decode a raw `FromRadio` frame's protobuf bytes.
pub fn decode_from_radio(bytes: &[u8]) -> Result<pb::FromRadio, CoreError> {
    pb::FromRadio::decode(bytes).map_err(|e| CoreError::Decode(format!("FromRadio: {e}")))
}

/// Encode a `ToRadio` message to its protobuf bytes.
pub fn encode_to_radio(msg: &pb::ToRadio) -> Vec<u8> {
    msg.encode_to_vec()
}
