//! Core server: accepts WebSocket connections and routes them.
//!
//! Three kinds of connection, chosen by request path:
//! - `/control`: JSON request/response for executions and sessions.
//! - `/executions/<id>`: one viewer of one execution's output.
//! - `/terminals/<id>?client=<cid>`: one client of a shared terminal.

use crate::config::ServerConfig;
use crate::exec::ExecutionEngine;
use crate::session::TerminalSessionManager;
use crate::stream::{StreamEvent, TerminalAttachment};
use crate::transport::websocket::{self, Inbound, WebSocketConnection};
use opsh_core::{
    generate_id, ExecutionFrame, OpshError, OpshResult, Request, Response, TerminalControl,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Heartbeat period on execution streams.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Where an accepted connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Control,
    Execution(String),
    Terminal {
        session_id: String,
        client_id: Option<String>,
    },
}

impl Route {
    /// Parse a request target such as `/terminals/abc?client=c1`.
    fn parse(target: &str) -> Option<Self> {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            ["control"] => Some(Route::Control),
            ["executions", id] => Some(Route::Execution((*id).to_string())),
            ["terminals", id] => Some(Route::Terminal {
                session_id: (*id).to_string(),
                client_id: query.and_then(|q| query_param(q, "client")),
            }),
            _ => None,
        }
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == key && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// The opsh server instance.
pub struct OpshServer {
    config: ServerConfig,
    engine: Arc<ExecutionEngine>,
    terminals: Arc<TerminalSessionManager>,
}

impl OpshServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<ExecutionEngine>,
        terminals: Arc<TerminalSessionManager>,
    ) -> Self {
        Self {
            config,
            engine,
            terminals,
        }
    }

    /// Listen on the configured port until the listener closes.
    pub async fn run(self: Arc<Self>) -> OpshResult<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| OpshError::Other(format!("invalid address: {e}")))?;
        let (local_addr, ws_rx) = websocket::start_listener(addr).await?;
        self.serve(local_addr, ws_rx).await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, local_addr: SocketAddr, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        self.terminals.start_sweeper();
        info!(
            addr = %local_addr,
            commands = self.config.commands.len(),
            terminals = self.config.terminal.enabled,
            "opsh-server ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = srv.handle_connection(conn).await {
                    warn!(remote = %remote, error = %e, "WebSocket connection error");
                }
            });
        }
        info!("listener closed, shutting down");
    }

    async fn handle_connection(&self, mut conn: WebSocketConnection) -> OpshResult<()> {
        match Route::parse(&conn.target) {
            Some(Route::Control) => self.control_loop(&mut conn).await,
            Some(Route::Execution(id)) => self.stream_execution(&mut conn, &id).await,
            Some(Route::Terminal {
                session_id,
                client_id,
            }) => {
                let client_id = client_id.unwrap_or_else(generate_id);
                self.bridge_terminal(&mut conn, &session_id, &client_id).await
            }
            None => {
                let err = OpshError::InvalidMessage(format!("unknown route: {}", conn.target));
                reject(&mut conn, &err).await;
                Err(err)
            }
        }
    }

    /// Request/response loop of a control connection.
    async fn control_loop(&self, conn: &mut WebSocketConnection) -> OpshResult<()> {
        debug!(remote = %conn.remote_addr, "control connection opened");
        loop {
            let response = match websocket::ws_recv(&mut conn.ws_stream).await {
                Ok(Some(Inbound::Text(text))) => match serde_json::from_str::<Request>(&text) {
                    Ok(request) => self.dispatch(request).await,
                    Err(e) => Response::from(&OpshError::from(e)),
                },
                Ok(Some(Inbound::Binary(_))) => Response::from(&OpshError::InvalidMessage(
                    "control requests are JSON text frames".into(),
                )),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "control connection ended");
                    break;
                }
            };
            websocket::ws_send_json(&mut conn.ws_stream, &response).await?;
        }
        Ok(())
    }

    /// Handle one control request. Failures become error responses.
    pub async fn dispatch(&self, request: Request) -> Response {
        match self.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    debug!(error = %e, "request rejected");
                } else {
                    warn!(error = %e, "request failed");
                }
                Response::from(&e)
            }
        }
    }

    async fn handle(&self, request: Request) -> OpshResult<Response> {
        match request {
            Request::CreateExecution {
                command_id,
                user_id,
            } => {
                let execution = self.engine.create_execution(&command_id, &user_id)?;
                self.engine.run(execution.id.clone());
                Ok(Response::Execution { execution })
            }
            Request::GetExecution { id } => Ok(Response::Execution {
                execution: self.engine.get_execution_by_id(&id)?,
            }),
            Request::ListExecutions { limit, offset } => Ok(Response::Executions {
                executions: self.engine.get_executions(limit, offset)?,
            }),
            Request::CreateSession { user_id, username } => {
                let session = self.terminals.create_session(&user_id, &username).await?;
                Ok(Response::Session {
                    session: session.info(),
                })
            }
            Request::GetSession { id } => Ok(Response::Session {
                session: self.terminals.get_session(&id).await?.info(),
            }),
            Request::ListSessions { user_id } => {
                let sessions = match user_id {
                    Some(user_id) => self
                        .terminals
                        .get_user_sessions(&user_id)
                        .await
                        .iter()
                        .map(|s| s.info())
                        .collect(),
                    None => self.terminals.list().await,
                };
                Ok(Response::Sessions { sessions })
            }
            Request::CloseSession { id } => {
                self.terminals.close_session(&id).await?;
                Ok(Response::Closed { id })
            }
        }
    }

    /// Push an execution's output to one viewer until it finishes.
    ///
    /// Output goes out as binary frames; status changes, heartbeats and the
    /// final result as JSON text frames.
    async fn stream_execution(
        &self,
        conn: &mut WebSocketConnection,
        execution_id: &str,
    ) -> OpshResult<()> {
        let mut stream = match self.engine.attach(execution_id) {
            Ok(stream) => stream,
            Err(e) => {
                reject(conn, &e).await;
                return Err(e);
            }
        };
        debug!(execution_id, remote = %conn.remote_addr, "execution viewer attached");

        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(StreamEvent::Replay(data)) | Some(StreamEvent::Output(data)) => {
                            if !data.is_empty() {
                                websocket::ws_send_binary(&mut conn.ws_stream, &data).await?;
                            }
                        }
                        Some(StreamEvent::Status(status)) => {
                            websocket::ws_send_json(&mut conn.ws_stream, &ExecutionFrame::Status { status }).await?;
                        }
                        Some(StreamEvent::Done { status, exit_code, truncated }) => {
                            let frame = ExecutionFrame::Done { status, exit_code, truncated };
                            websocket::ws_send_json(&mut conn.ws_stream, &frame).await?;
                        }
                        None => break,
                    }
                    // Heartbeats only fill silence.
                    heartbeat.reset();
                }
                _ = heartbeat.tick() => {
                    websocket::ws_send_json(&mut conn.ws_stream, &ExecutionFrame::Heartbeat).await?;
                }
                inbound = websocket::ws_recv(&mut conn.ws_stream) => match inbound {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        debug!(execution_id, "execution viewer left");
                        return Ok(());
                    }
                },
            }
        }

        websocket::ws_close(&mut conn.ws_stream).await;
        Ok(())
    }

    /// Bridge one client to a terminal session: replay, then live output
    /// out; keystrokes and resize requests in.
    async fn bridge_terminal(
        &self,
        conn: &mut WebSocketConnection,
        session_id: &str,
        client_id: &str,
    ) -> OpshResult<()> {
        let attached = match self.terminals.get_session(session_id).await {
            Ok(session) => TerminalAttachment::open(session, client_id),
            Err(e) => Err(e),
        };
        let mut attachment = match attached {
            Ok(attachment) => attachment,
            Err(e) => {
                reject(conn, &e).await;
                return Err(e);
            }
        };
        let session = attachment.session().clone();

        let replay = attachment.take_replay();
        if !replay.is_empty() {
            websocket::ws_send_binary(&mut conn.ws_stream, &replay).await?;
        }

        loop {
            tokio::select! {
                chunk = attachment.next_chunk() => match chunk {
                    Some(data) => websocket::ws_send_binary(&mut conn.ws_stream, &data).await?,
                    None => {
                        debug!(session_id, client_id, "terminal output ended");
                        websocket::ws_close(&mut conn.ws_stream).await;
                        break;
                    }
                },
                inbound = websocket::ws_recv(&mut conn.ws_stream) => match inbound {
                    Ok(Some(Inbound::Binary(data))) => {
                        if let Err(e) = session.write(&data) {
                            debug!(session_id, error = %e, "terminal input rejected");
                            break;
                        }
                    }
                    Ok(Some(Inbound::Text(text))) => {
                        let result = match serde_json::from_str::<TerminalControl>(&text) {
                            Ok(TerminalControl::Resize { cols, rows }) => session.resize(cols, rows),
                            Err(_) => session.write(text.as_bytes()),
                        };
                        if let Err(e) = result {
                            debug!(session_id, error = %e, "terminal input rejected");
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        debug!(session_id, client_id, "terminal client left");
                        break;
                    }
                },
            }
        }

        Ok(())
    }
}

/// Tell the client why its connection is refused, then close it.
async fn reject(conn: &mut WebSocketConnection, err: &OpshError) {
    let _ = websocket::ws_send_json(&mut conn.ws_stream, &Response::from(err)).await;
    websocket::ws_close(&mut conn.ws_stream).await;
}
