//! Append-only output accumulator for one execution.
//!
//! The engine task is the only writer. Viewers hold a byte cursor into
//! the accumulated output and wake on a `watch` version bump, so a viewer
//! that attaches late gets everything accumulated so far as its replay
//! and then exactly the bytes appended after it, with no gap and no
//! duplicate. A slow viewer never holds the writer up.

use opsh_core::ExecutionStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// What a viewer observes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A non-terminal status change.
    Status(ExecutionStatus),
    Output(Vec<u8>),
    /// Terminal status; nothing follows.
    Done {
        status: ExecutionStatus,
        exit_code: Option<i32>,
        truncated: bool,
    },
}

/// State of the feed at the moment a viewer attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub data: Vec<u8>,
    pub status: ExecutionStatus,
}

struct FeedState {
    data: Vec<u8>,
    truncated: bool,
    /// Every status the execution has had, oldest first.
    history: Vec<ExecutionStatus>,
    exit_code: Option<i32>,
}

/// Accumulated output plus status of one execution.
pub struct OutputFeed {
    state: Mutex<FeedState>,
    version: watch::Sender<u64>,
    max_bytes: usize,
}

impl OutputFeed {
    /// A feed for a `pending` execution, capped at `max_bytes` of output.
    pub fn new(max_bytes: usize) -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(FeedState {
                data: Vec::new(),
                truncated: false,
                history: vec![ExecutionStatus::Pending],
                exit_code: None,
            }),
            version,
            max_bytes,
        })
    }

    /// Append output, discarding whatever exceeds the cap. Returns the
    /// number of bytes kept.
    pub fn append(&self, chunk: &[u8]) -> usize {
        let kept = {
            let mut state = self.lock();
            let room = self.max_bytes.saturating_sub(state.data.len());
            let kept = chunk.len().min(room);
            state.data.extend_from_slice(&chunk[..kept]);
            if kept < chunk.len() && !state.truncated {
                state.truncated = true;
                debug!(max_bytes = self.max_bytes, "output cap reached, truncating");
            }
            kept
        };
        if kept > 0 {
            self.bump();
        }
        kept
    }

    /// Record a status change.
    pub fn set_status(&self, status: ExecutionStatus) {
        self.lock().history.push(status);
        self.bump();
    }

    /// Record the terminal status. Viewers drain remaining output, then end.
    pub fn finish(&self, status: ExecutionStatus, exit_code: Option<i32>) {
        {
            let mut state = self.lock();
            state.history.push(status);
            state.exit_code = exit_code;
        }
        self.bump();
    }

    /// Copy of the accumulated output and whether any was discarded.
    pub fn output(&self) -> (Vec<u8>, bool) {
        let state = self.lock();
        (state.data.clone(), state.truncated)
    }

    /// Take a replay snapshot and a reader positioned right after it.
    pub fn attach(self: &Arc<Self>) -> (FeedSnapshot, FeedReader) {
        let rx = self.version.subscribe();
        let state = self.lock();
        let status = state
            .history
            .last()
            .copied()
            .unwrap_or(ExecutionStatus::Pending);
        let snapshot = FeedSnapshot {
            data: state.data.clone(),
            status,
        };
        let reader = FeedReader {
            feed: self.clone(),
            cursor: state.data.len(),
            seen_statuses: state.history.len(),
            done: false,
            rx,
        };
        (snapshot, reader)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One viewer's position in an [`OutputFeed`].
pub struct FeedReader {
    feed: Arc<OutputFeed>,
    cursor: usize,
    seen_statuses: usize,
    done: bool,
    rx: watch::Receiver<u64>,
}

impl FeedReader {
    /// Wait for the next event. Returns `None` after `Done`.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            if self.done {
                return None;
            }
            self.rx.borrow_and_update();
            if let Some(event) = self.poll() {
                return Some(event);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Next event if one is ready. Non-terminal status changes come before
    /// output appended after them; all output comes before `Done`.
    fn poll(&mut self) -> Option<FeedEvent> {
        let state = self.feed.lock();

        if let Some(&status) = state.history.get(self.seen_statuses) {
            if !status.is_terminal() {
                self.seen_statuses += 1;
                return Some(FeedEvent::Status(status));
            }
        }

        if self.cursor < state.data.len() {
            let chunk = state.data[self.cursor..].to_vec();
            self.cursor = state.data.len();
            return Some(FeedEvent::Output(chunk));
        }

        match state.history.last() {
            Some(&status) if status.is_terminal() => {
                self.seen_statuses = state.history.len();
                self.done = true;
                Some(FeedEvent::Done {
                    status,
                    exit_code: state.exit_code,
                    truncated: state.truncated,
                })
            }
            _ => None,
        }
    }
}
