//! TCP IPC server: accept loop and per-connection handler.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, WireReply, WireRequest, MSG_ERROR,
    MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK, MSG_STREAM_END,
};
use crate::types::{IpcConfig, Result, ResultCode, RpcStatus};

/// Result of dispatching one request.
#[derive(Debug)]
pub enum DispatchResponse {
    /// Unary reply.
    Single(Result<Value>),
    /// Stream of chunks; an `Err` item terminates the stream with that status.
    Stream(mpsc::Receiver<Result<Value>>),
}

/// Request handler plugged behind the accept loop.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: WireRequest, peer: SocketAddr) -> DispatchResponse;
}

/// IPC server bound to a listening socket.
pub struct IpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    /// Stops the accept loop.
    accept_cancel: CancellationToken,
    /// Drops every open connection.
    conn_cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcServer")
            .field("local_addr", &self.local_addr)
            .field("ipc_config", &self.ipc_config)
            .finish_non_exhaustive()
    }
}

impl IpcServer {
    /// Bind the listening socket. Port 0 picks an ephemeral port, readable
    /// through [`IpcServer::local_addr`].
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<dyn Dispatcher>,
        ipc_config: IpcConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            accept_cancel: CancellationToken::new(),
            conn_cancel: CancellationToken::new(),
            ipc_config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token stopping the accept loop (open connections keep running).
    pub fn accept_token(&self) -> CancellationToken {
        self.accept_cancel.clone()
    }

    /// Token dropping every open connection.
    pub fn connection_token(&self) -> CancellationToken {
        self.conn_cancel.clone()
    }

    /// Run the accept loop until cancelled or a fatal error occurs.
    pub async fn serve(self) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            self.local_addr,
            self.ipc_config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.accept_cancel.cancelled() => {
                    tracing::info!("IPC server stops accepting connections");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.ipc_config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("IPC connection from {} (active={})",
                        peer,
                        self.ipc_config.max_connections - conn_semaphore.available_permits(),
                    );
                    let dispatcher = self.dispatcher.clone();
                    let cancel = self.conn_cancel.clone();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, dispatcher, cancel, ipc_config, permit).await {
                            tracing::debug!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Handle a single TCP connection: read frames → dispatch → write responses.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let write_timeout = ipc_config.write_timeout;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame_result = tokio::time::timeout(ipc_config.read_timeout, read_frame(&mut reader, ipc_config.max_frame_bytes)) => {
                match frame_result {
                    Err(_elapsed) => {
                        tracing::debug!("Read timeout ({:?}), dropping connection", ipc_config.read_timeout);
                        break;
                    }
                    Ok(result) => match result? {
                        Some(f) => f,
                        None => break,
                    },
                }
            }
        };

        let (msg_type, payload_bytes) = frame;
        if msg_type != MSG_REQUEST {
            let status = RpcStatus::new(
                ResultCode::ErrorValidation,
                format!("Unexpected message type: 0x{:02X}", msg_type),
            );
            write_reply(&mut writer, MSG_ERROR, &WireReply::failure("", &status), write_timeout).await?;
            continue;
        }

        let request: WireRequest = match decode_msgpack(&payload_bytes) {
            Ok(request) => request,
            Err(e) => {
                let status = RpcStatus::new(ResultCode::ErrorValidation, e.to_string());
                write_reply(&mut writer, MSG_ERROR, &WireReply::failure("", &status), write_timeout).await?;
                continue;
            }
        };
        let request_id = request.id.clone();

        match dispatcher.dispatch(request, peer).await {
            DispatchResponse::Single(Ok(body)) => {
                write_reply(&mut writer, MSG_RESPONSE, &WireReply::success(&request_id, body), write_timeout).await?;
            }
            DispatchResponse::Single(Err(e)) => {
                let reply = WireReply::failure(&request_id, &e.to_status());
                write_reply(&mut writer, MSG_ERROR, &reply, write_timeout).await?;
            }
            DispatchResponse::Stream(mut rx) => {
                let mut failed = false;
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        chunk = rx.recv() => chunk,
                    };
                    match chunk {
                        Some(Ok(body)) => {
                            write_reply(&mut writer, MSG_STREAM_CHUNK, &WireReply::chunk(&request_id, body), write_timeout).await?;
                        }
                        Some(Err(e)) => {
                            let reply = WireReply::failure(&request_id, &e.to_status());
                            write_reply(&mut writer, MSG_ERROR, &reply, write_timeout).await?;
                            failed = true;
                            break;
                        }
                        None => break,
                    }
                }
                if !failed {
                    write_reply(&mut writer, MSG_STREAM_END, &WireReply::end(&request_id), write_timeout).await?;
                }
            }
        }
    }

    Ok(())
}

async fn write_reply<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    reply: &WireReply,
    timeout: Duration,
) -> std::io::Result<()> {
    let encoded = encode_msgpack(reply)?;
    timed_write(writer, msg_type, &encoded, timeout).await
}

/// Write a frame with a timeout. Returns an error if the write takes too long
/// (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, msg_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({:?}), dropping connection", timeout);
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use serde_json::json;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Dispatcher for Echo {
        async fn dispatch(&self, request: WireRequest, _peer: SocketAddr) -> DispatchResponse {
            match request.method.as_str() {
                "echo" => DispatchResponse::Single(Ok(request.body)),
                "count" => {
                    let (tx, rx) = mpsc::channel(4);
                    tokio::spawn(async move {
                        for i in 0..3 {
                            let _ = tx.send(Ok(json!(i))).await;
                        }
                    });
                    DispatchResponse::Stream(rx)
                }
                _ => DispatchResponse::Single(Err(Error::not_found(request.method))),
            }
        }
    }

    async fn start() -> (SocketAddr, CancellationToken) {
        let server = IpcServer::bind("127.0.0.1:0", Arc::new(Echo), IpcConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let token = server.accept_token();
        tokio::spawn(server.serve());
        (addr, token)
    }

    async fn send(stream: &mut TcpStream, method: &str, body: Value) {
        let req = WireRequest {
            id: "1".into(),
            service: "test".into(),
            method: method.into(),
            body,
            ..Default::default()
        };
        write_frame(stream, MSG_REQUEST, &encode_msgpack(&req).unwrap()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> (u8, WireReply) {
        let (ty, payload) = read_frame(stream, 1 << 20).await.unwrap().unwrap();
        (ty, decode_msgpack(&payload).unwrap())
    }

    #[tokio::test]
    async fn test_unary_and_error_replies() {
        let (addr, token) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(&mut stream, "echo", json!({"a": 1})).await;
        let (ty, reply) = recv(&mut stream).await;
        assert_eq!(ty, MSG_RESPONSE);
        assert_eq!(reply.body, json!({"a": 1}));

        send(&mut stream, "nope", json!({})).await;
        let (ty, reply) = recv(&mut stream).await;
        assert_eq!(ty, MSG_ERROR);
        assert_eq!(reply.status().code, ResultCode::ErrorNotFound);
        token.cancel();
    }

    #[tokio::test]
    async fn test_stream_ends_with_sentinel() {
        let (addr, token) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, "count", json!({})).await;
        for i in 0..3 {
            let (ty, reply) = recv(&mut stream).await;
            assert_eq!(ty, MSG_STREAM_CHUNK);
            assert_eq!(reply.body, json!(i));
        }
        let (ty, _) = recv(&mut stream).await;
        assert_eq!(ty, MSG_STREAM_END);
        token.cancel();
    }

    #[tokio::test]
    async fn test_unexpected_message_type() {
        let (addr, token) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, MSG_RESPONSE, b"").await.unwrap();
        let (ty, reply) = recv(&mut stream).await;
        assert_eq!(ty, MSG_ERROR);
        assert_eq!(reply.status().code, ResultCode::ErrorValidation);
        token.cancel();
    }
}
