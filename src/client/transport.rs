//! One TCP connection per call; no retry.

use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, WireReply, WireRequest, MSG_ERROR,
    MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK, MSG_STREAM_END,
};
use crate::types::{Error, Result};

/// Capacity of client-side stream buffers.
const STREAM_BUFFER: usize = 32;

/// Bound a future by an optional timeout.
async fn bounded<T>(
    timeout: Option<Duration>,
    target: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::timeout(format!("no reply from {target} within {limit:?}")))?,
        None => fut.await,
    }
}

async fn connect(target: &str) -> Result<TcpStream> {
    TcpStream::connect(target)
        .await
        .map_err(|e| Error::unreachable(format!("{target}: {e}")))
}

async fn send_request(stream: &mut TcpStream, target: &str, request: &WireRequest) -> Result<()> {
    let payload = encode_msgpack(request)?;
    write_frame(stream, MSG_REQUEST, &payload)
        .await
        .map_err(|e| Error::unreachable(format!("{target}: {e}")))
}

async fn next_reply(stream: &mut TcpStream, target: &str, max_frame_bytes: u32) -> Result<(u8, WireReply)> {
    let frame = read_frame(stream, max_frame_bytes)
        .await
        .map_err(|e| Error::unreachable(format!("{target}: {e}")))?;
    let (msg_type, payload) =
        frame.ok_or_else(|| Error::unreachable(format!("{target}: connection closed")))?;
    Ok((msg_type, decode_msgpack(&payload)?))
}

/// Issue a unary call.
pub(crate) async fn call_unary(
    target: &str,
    request: &WireRequest,
    timeout: Option<Duration>,
    max_frame_bytes: u32,
) -> Result<Value> {
    bounded(timeout, target, async {
        let mut stream = connect(target).await?;
        send_request(&mut stream, target, request).await?;
        let (msg_type, reply) = next_reply(&mut stream, target, max_frame_bytes).await?;
        match msg_type {
            MSG_RESPONSE => Ok(reply.body),
            MSG_ERROR => Err(Error::Status(reply.status())),
            other => Err(Error::internal(format!(
                "unexpected reply type 0x{other:02X} from {target}"
            ))),
        }
    })
    .await
}

/// Issue a streaming call. The timeout covers the connection and the first
/// reply frame; later chunks are awaited without limit.
pub(crate) async fn call_stream(
    target: &str,
    request: &WireRequest,
    timeout: Option<Duration>,
    max_frame_bytes: u32,
) -> Result<mpsc::Receiver<Result<Value>>> {
    let (mut stream, first) = bounded(timeout, target, async {
        let mut stream = connect(target).await?;
        send_request(&mut stream, target, request).await?;
        let first = next_reply(&mut stream, target, max_frame_bytes).await?;
        Ok::<_, Error>((stream, first))
    })
    .await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let target = target.to_string();
    tokio::spawn(async move {
        let mut current = Ok(first);
        loop {
            let item = match current {
                Ok((MSG_STREAM_CHUNK, reply)) => Ok(reply.body),
                Ok((MSG_STREAM_END, _)) => break,
                Ok((MSG_ERROR, reply)) => Err(Error::Status(reply.status())),
                Ok((other, _)) => Err(Error::internal(format!(
                    "unexpected stream frame 0x{other:02X} from {target}"
                ))),
                Err(e) => Err(e),
            };
            let last = item.is_err();
            if tx.send(item).await.is_err() || last {
                break;
            }
            current = tokio::select! {
                _ = tx.closed() => break,
                next = next_reply(&mut stream, &target, max_frame_bytes) => next,
            };
        }
    });
    Ok(rx)
}
