//! Frame codec for the IPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.
//!
//! Payloads are msgpack maps:
//! - request: `{id, service, method, meta, body}`
//! - response: `{id, ok: true, body}`
//! - error: `{id, ok: false, error: {code, message}}`
//! - stream chunk: `{id, body}`, stream end: `{id}`

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{ResultCode, RpcMetadata, RpcStatus};

/// Message type: request from client.
pub const MSG_REQUEST: u8 = 0x01;
/// Message type: response to client.
pub const MSG_RESPONSE: u8 = 0x02;
/// Message type: streaming response chunk.
pub const MSG_STREAM_CHUNK: u8 = 0x03;
/// Message type: end of streaming response.
pub const MSG_STREAM_END: u8 = 0x04;
/// Message type: error response to client (also terminates a stream).
pub const MSG_ERROR: u8 = 0xFF;

/// Request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub meta: RpcMetadata,
    #[serde(default)]
    pub body: Value,
}

/// Error part of an error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ResultCode,
    #[serde(default)]
    pub message: String,
}

impl From<&RpcStatus> for WireError {
    fn from(status: &RpcStatus) -> Self {
        Self {
            code: status.code,
            message: status.msg.clone(),
        }
    }
}

impl From<WireError> for RpcStatus {
    fn from(err: WireError) -> Self {
        RpcStatus::new(err.code, err.message)
    }
}

/// Any payload sent by the server. Fields absent from a frame type are left
/// to their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireReply {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl WireReply {
    pub fn success(id: &str, body: Value) -> Self {
        Self {
            id: id.to_string(),
            ok: Some(true),
            body,
            error: None,
        }
    }

    pub fn failure(id: &str, status: &RpcStatus) -> Self {
        Self {
            id: id.to_string(),
            ok: Some(false),
            body: Value::Null,
            error: Some(status.into()),
        }
    }

    pub fn chunk(id: &str, body: Value) -> Self {
        Self {
            id: id.to_string(),
            ok: None,
            body,
            error: None,
        }
    }

    pub fn end(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Status carried by this reply (OK unless an error part is present).
    pub fn status(&self) -> RpcStatus {
        match &self.error {
            Some(err) => err.clone().into(),
            None => RpcStatus::ok(),
        }
    }
}

/// Encode a payload to msgpack. Logs and returns an error on failure
/// instead of silently producing an empty vec.
pub fn encode_msgpack<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        tracing::error!("Msgpack encoding failed: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })
}

/// Decode a msgpack payload.
pub fn decode_msgpack<T: DeserializeOwned>(payload: &[u8]) -> std::io::Result<T> {
    rmp_serde::from_slice(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("Invalid msgpack: {e}")))
}

/// Read one frame from the stream.
///
/// Returns `(msg_type, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing type byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let payload = frame_data.split_off(1);
    Ok(Some((frame_data[0], payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "Frame too large for length prefix")
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[msg_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
