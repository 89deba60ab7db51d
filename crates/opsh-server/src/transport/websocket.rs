//! WebSocket listener using tokio-tungstenite.
//!
//! The request target (path and query) is captured during the upgrade so
//! the server can route the connection.

use futures_util::{SinkExt, StreamExt};
use opsh_core::{OpshError, OpshResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Largest inbound frame accepted, in bytes.
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Request target of the upgrade, e.g. `/terminals/abc?client=c1`.
    pub target: String,
}

/// A data frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
}

/// Bind `bind_addr` and start accepting.
///
/// Returns a receiver that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> OpshResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| OpshError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| OpshError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut target = String::new();
                        let capture = |req: &Request,
                                       resp: Response|
                         -> Result<Response, ErrorResponse> {
                            target = req.uri().to_string();
                            Ok(resp)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, capture).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, target = %target, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    target,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

pub async fn ws_send_binary(ws: &mut WebSocketStream<TcpStream>, data: &[u8]) -> OpshResult<()> {
    ws.send(Message::Binary(data.to_vec().into()))
        .await
        .map_err(|e| OpshError::Transport(format!("WS send failed: {e}")))
}

pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> OpshResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| OpshError::Transport(format!("WS send failed: {e}")))
}

/// Serialize `value` and send it as a text frame.
pub async fn ws_send_json<T: serde::Serialize>(
    ws: &mut WebSocketStream<TcpStream>,
    value: &T,
) -> OpshResult<()> {
    let text = serde_json::to_string(value)
        .map_err(|e| OpshError::Other(format!("JSON encode failed: {e}")))?;
    ws_send_text(ws, text).await
}

/// Send a close frame. Errors are ignored; the peer may already be gone.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}

/// Receive the next data frame.
///
/// Returns `None` once the connection is closed. Pings are answered here.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> OpshResult<Option<Inbound>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                check_frame_size(data.len())?;
                return Ok(Some(Inbound::Binary(data.to_vec())));
            }
            Some(Ok(Message::Text(text))) => {
                check_frame_size(text.len())?;
                return Ok(Some(Inbound::Text(text.to_string())));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(OpshError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

fn check_frame_size(len: usize) -> OpshResult<()> {
    if len > MAX_WS_FRAME_SIZE {
        return Err(OpshError::InvalidMessage(format!(
            "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
        )));
    }
    Ok(())
}
