//! Viewer-side streams: what a connected client reads from an execution or
//! a terminal session, independent of the transport carrying it.

use crate::exec::{FeedEvent, FeedReader, OutputFeed};
use crate::session::TerminalSession;
use opsh_core::{Execution, ExecutionStatus, OpshResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// An event on an execution stream.
///
/// Order is always: one `Replay`, then `Status` and `Output` as they
/// happen, then one `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Output accumulated before the viewer attached.
    Replay(Vec<u8>),
    Status(ExecutionStatus),
    Output(Vec<u8>),
    Done {
        status: ExecutionStatus,
        exit_code: Option<i32>,
        truncated: bool,
    },
}

impl From<FeedEvent> for StreamEvent {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Status(status) => StreamEvent::Status(status),
            FeedEvent::Output(data) => StreamEvent::Output(data),
            FeedEvent::Done {
                status,
                exit_code,
                truncated,
            } => StreamEvent::Done {
                status,
                exit_code,
                truncated,
            },
        }
    }
}

/// One viewer of one execution.
pub struct ExecutionStream {
    /// Events known at attach time, yielded before anything live.
    queued: VecDeque<StreamEvent>,
    live: Option<FeedReader>,
}

impl ExecutionStream {
    /// Attach to an in-flight execution.
    pub fn live(feed: &Arc<OutputFeed>) -> Self {
        let (snapshot, reader) = feed.attach();
        let mut queued = VecDeque::from([StreamEvent::Replay(snapshot.data)]);
        if !snapshot.status.is_terminal() {
            queued.push_back(StreamEvent::Status(snapshot.status));
        }
        Self {
            queued,
            live: Some(reader),
        }
    }

    /// Replay a finished execution from its stored record.
    pub fn finished(execution: &Execution) -> Self {
        Self {
            queued: VecDeque::from([
                StreamEvent::Replay(execution.output.clone()),
                StreamEvent::Done {
                    status: execution.status,
                    exit_code: execution.exit_code,
                    truncated: execution.output_truncated,
                },
            ]),
            live: None,
        }
    }

    /// Next event, or `None` once `Done` has been yielded.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        match self.live.as_mut() {
            Some(reader) => reader.next().await.map(StreamEvent::from),
            None => None,
        }
    }
}

/// One viewer attached to a terminal session. Detaches on drop.
pub struct TerminalAttachment {
    session: Arc<TerminalSession>,
    client_id: String,
    replay: Option<Vec<u8>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl TerminalAttachment {
    pub fn open(session: Arc<TerminalSession>, client_id: &str) -> OpshResult<Self> {
        let (replay, rx) = session.subscribe(client_id)?;
        Ok(Self {
            session,
            client_id: client_id.to_string(),
            replay: Some(replay),
            rx: Some(rx),
        })
    }

    pub fn session(&self) -> &Arc<TerminalSession> {
        &self.session
    }

    /// The replay snapshot; empty after the first call.
    pub fn take_replay(&mut self) -> Vec<u8> {
        self.replay.take().unwrap_or_default()
    }

    /// Next live chunk. `None` once the session closes or this client is
    /// replaced by a newer subscription.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for TerminalAttachment {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        // A disconnected channel means a newer subscription took this
        // client id, or the session closed. Either way there is nothing
        // of ours left to remove.
        let replaced = loop {
            match rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        if !replaced {
            self.session.unsubscribe(&self.client_id);
        }
    }
}
