//! A single interactive shell behind a PTY, shared by any number of viewers.
//!
//! One dedicated thread reads the PTY and fans each chunk out to every
//! subscriber with a non-blocking send. A viewer whose channel is full
//! loses that chunk; the shell never waits for a slow viewer. Recent
//! output is kept in a [`RingBuffer`] and replayed on subscribe. A second
//! thread blocks on the shell and runs the exit hook once it is reaped.

use super::pty::{PtyHandle, PtyOutput, ShellCommand};
use super::ring_buffer::RingBuffer;
use crate::process::{self, Signal};
use chrono::{DateTime, Utc};
use opsh_core::{terminal_name, OpshError, OpshResult, SessionInfo};
use portable_pty::Child;
use std::collections::HashMap;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bytes read from the PTY per iteration of the read loop.
const READ_CHUNK_SIZE: usize = 4096;

/// How long a hung-up session gets before everything in it is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// How long the reader may keep draining after the shell has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Called once after the session has closed and the shell has been reaped.
pub type ExitHook = Box<dyn FnOnce(&str) + Send + 'static>;

/// Everything needed to start a session besides its id.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_id: String,
    pub username: String,
    pub shell: ShellCommand,
    pub cols: u16,
    pub rows: u16,
    pub replay_bytes: usize,
    pub subscriber_capacity: usize,
}

/// A PTY-backed shell with fan-out to subscribers.
pub struct TerminalSession {
    id: String,
    name: String,
    user_id: String,
    username: String,
    shell: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    /// Flips to `true` once the shell has been reaped.
    exited: watch::Sender<bool>,
    pty: PtyHandle,
    ring: RingBuffer,
    /// Live output channels keyed by client id. Also serializes ring-buffer
    /// appends against subscribe snapshots.
    subscribers: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    subscriber_capacity: usize,
    dropped_chunks: AtomicU64,
}

impl TerminalSession {
    /// Spawn the shell and start its reader and waiter threads.
    pub fn spawn(id: String, opts: SessionOptions, on_exit: ExitHook) -> OpshResult<Arc<Self>> {
        let (pty, output) = PtyHandle::spawn(&opts.shell, opts.cols, opts.rows)?;

        let session = Arc::new(Self {
            name: terminal_name(&id),
            id,
            user_id: opts.user_id,
            username: opts.username,
            shell: opts.shell.program,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            exited: watch::channel(false).0,
            pty,
            ring: RingBuffer::new(opts.replay_bytes),
            subscribers: Mutex::new(HashMap::new()),
            subscriber_capacity: opts.subscriber_capacity.max(1),
            dropped_chunks: AtomicU64::new(0),
        });

        let PtyOutput { reader, child } = output;
        let (drained_tx, drained_rx) = std_mpsc::channel();

        let reader_session = session.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-{}", session.name))
            .spawn(move || read_loop(reader_session, reader, drained_tx));
        if let Err(e) = spawned {
            session.pty.kill();
            return Err(OpshError::SpawnFailed(format!(
                "failed to start PTY reader thread: {e}"
            )));
        }

        let waiter_session = session.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("wait-{}", session.name))
            .spawn(move || wait_loop(waiter_session, child, drained_rx, on_exit));
        if let Err(e) = spawned {
            session.close();
            session.pty.kill();
            return Err(OpshError::SpawnFailed(format!(
                "failed to start shell wait thread: {e}"
            )));
        }

        info!(session_id = %session.id, user_id = %session.user_id, "terminal session started");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Forward bytes to the shell's input.
    pub fn write(&self, data: &[u8]) -> OpshResult<()> {
        if self.is_closed() {
            return Err(OpshError::SessionClosed(self.id.clone()));
        }
        self.pty.write(data).map_err(|e| match e {
            OpshError::SessionClosed(_) => OpshError::SessionClosed(self.id.clone()),
            other => other,
        })?;
        self.touch();
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> OpshResult<()> {
        if self.is_closed() {
            return Err(OpshError::SessionClosed(self.id.clone()));
        }
        self.pty.resize(cols, rows)
    }

    /// Register a live output channel for `client_id` and return it along
    /// with the replay snapshot. A previous channel for the same client is
    /// closed and replaced.
    ///
    /// The snapshot and the channel are taken under the same lock the read
    /// loop holds while appending, so the viewer sees no gap and no
    /// duplicate between replay and live output.
    pub fn subscribe(&self, client_id: &str) -> OpshResult<(Vec<u8>, mpsc::Receiver<Vec<u8>>)> {
        let mut subscribers = self.lock_subscribers();
        if self.is_closed() {
            return Err(OpshError::SessionClosed(self.id.clone()));
        }
        let snapshot = self.ring.read_all();
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        if subscribers.insert(client_id.to_string(), tx).is_some() {
            debug!(session_id = %self.id, client_id, "replaced existing subscriber");
        }
        drop(subscribers);

        self.touch();
        info!(session_id = %self.id, client_id, replay_bytes = snapshot.len(), "client subscribed");
        Ok((snapshot, rx))
    }

    /// Close and remove the channel for `client_id`, if any.
    pub fn unsubscribe(&self, client_id: &str) {
        if self.lock_subscribers().remove(client_id).is_some() {
            info!(session_id = %self.id, client_id, "client unsubscribed");
        }
    }

    /// Tear the session down. Only the first call does anything.
    ///
    /// Every process group in the shell's session is hung up now and killed
    /// after [`KILL_GRACE`]. Use [`wait_exited`](Self::wait_exited) to block
    /// until the shell has actually been reaped.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Dropping the senders ends every viewer's stream.
        let subscribers = std::mem::take(&mut *self.lock_subscribers());
        let viewers = subscribers.len();
        drop(subscribers);

        self.pty.terminate();
        self.pty.close();

        // Background jobs can outlive the shell, so escalate regardless.
        if let Some(pid) = self.pty.pid() {
            let _ = std::thread::Builder::new()
                .name(format!("reap-{}", self.name))
                .spawn(move || {
                    std::thread::sleep(KILL_GRACE);
                    let _ = process::signal_session(pid, Signal::Kill);
                });
        }

        info!(session_id = %self.id, viewers, "terminal session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Kill everything still running in the shell's session right away.
    pub fn kill(&self) {
        self.pty.kill();
    }

    /// Whether the shell has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `limit` for the shell to be reaped. Returns whether it was.
    pub async fn wait_exited(&self, limit: Duration) -> bool {
        let mut exited = self.exited.subscribe();
        let reaped = matches!(
            tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        reaped
    }

    pub fn client_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last read or write, measured against `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.pty.size();
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            client_count: self.client_count(),
            cols,
            rows,
            output_bytes: self.ring.total_written(),
            dropped_chunks: self.dropped_chunks(),
            closed: self.is_closed(),
        }
    }

    /// Append a chunk of shell output and fan it out.
    fn publish(&self, chunk: &[u8]) {
        let mut subscribers = self.lock_subscribers();
        self.ring.write(chunk);
        self.touch();
        subscribers.retain(|client_id, tx| match tx.try_send(chunk.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %self.id, client_id = %client_id, "subscriber full, chunk dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, client_id = %client_id, "subscriber gone");
                false
            }
        });
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Vec<u8>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn shell_pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(earlier) = Instant::now().checked_sub(by) {
            *last = earlier;
        }
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

fn read_loop(
    session: Arc<TerminalSession>,
    mut reader: Box<dyn Read + Send>,
    drained: std_mpsc::Sender<()>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    while !session.is_closed() {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(session_id = %session.id, "PTY reached end of stream");
                break;
            }
            Ok(n) => session.publish(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports that the slave side has gone away.
                if session.is_closed() || e.raw_os_error() == Some(5) {
                    debug!(session_id = %session.id, error = %e, "PTY read ended");
                } else {
                    warn!(session_id = %session.id, error = %e, "PTY read failed");
                }
                break;
            }
        }
    }

    let _ = drained.send(());
    session.close();
}

/// Block until the shell exits, then close the session and run the hook.
fn wait_loop(
    session: Arc<TerminalSession>,
    mut child: Box<dyn Child + Send + Sync>,
    drained: std_mpsc::Receiver<()>,
    on_exit: ExitHook,
) {
    match child.wait() {
        Ok(status) => debug!(session_id = %session.id, code = status.exit_code(), "shell exited"),
        Err(e) => debug!(session_id = %session.id, error = %e, "shell wait failed"),
    }

    // Give the reader a moment to publish the shell's last words. A job
    // still holding the terminal keeps it open, so do not wait for ever.
    let _ = drained.recv_timeout(DRAIN_GRACE);
    session.close();
    session.exited.send_replace(true);
    on_exit(&session.id);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn opts() -> SessionOptions {
        SessionOptions {
            user_id: "u1".into(),
            username: "alice".into(),
            shell: ShellCommand {
                program: "/bin/sh".into(),
                args: Vec::new(),
                env: HashMap::from([("PS1".to_string(), "$ ".to_string())]),
                working_dir: None,
            },
            cols: 80,
            rows: 24,
            replay_bytes: 64 * 1024,
            subscriber_capacity: 256,
        }
    }

    fn spawn_session() -> (Arc<TerminalSession>, std_mpsc::Receiver<String>) {
        let (tx, rx) = std_mpsc::channel();
        let session = TerminalSession::spawn(
            crate::session::manager::new_session_id(),
            opts(),
            Box::new(move |id| {
                let _ = tx.send(id.to_string());
            }),
        )
        .unwrap();
        (session, rx)
    }

    /// Read from `rx` until the accumulated output contains `needle`.
    async fn read_until(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let collect = async {
            let mut seen = String::new();
            while let Some(chunk) = rx.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    break;
                }
            }
            seen
        };
        match timeout(Duration::from_secs(10), collect).await {
            Ok(seen) if seen.contains(needle) => seen,
            Ok(seen) => panic!("stream ended before {needle:?}, saw {seen:?}"),
            Err(_) => panic!("timed out waiting for {needle:?}"),
        }
    }

    #[tokio::test]
    async fn echoes_written_line() {
        let (session, _exit) = spawn_session();
        let (_replay, mut rx) = session.subscribe("c1").unwrap();
        session.write(b"echo opsh-$((40+2))\n").unwrap();
        let out = read_until(&mut rx, "opsh-42").await;
        assert!(out.contains("opsh-42"));
        session.close();
    }

    #[tokio::test]
    async fn fan_out_to_two_subscribers() {
        let (session, _exit) = spawn_session();
        let (_, mut a) = session.subscribe("a").unwrap();
        let (_, mut b) = session.subscribe("b").unwrap();
        assert_eq!(session.client_count(), 2);
        session.write(b"echo fan-$((1+1))-out\n").unwrap();
        read_until(&mut a, "fan-2-out").await;
        read_until(&mut b, "fan-2-out").await;
        session.close();
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay() {
        let (session, _exit) = spawn_session();
        let (_, mut first) = session.subscribe("first").unwrap();
        session.write(b"echo replay-$((3*3))\n").unwrap();
        read_until(&mut first, "replay-9").await;

        let (replay, _late) = session.subscribe("late").unwrap();
        assert!(String::from_utf8_lossy(&replay).contains("replay-9"));
        session.close();
    }

    #[tokio::test]
    async fn unsubscribed_channel_is_not_fed() {
        let (session, _exit) = spawn_session();
        let (_, mut gone) = session.subscribe("gone").unwrap();
        session.unsubscribe("gone");
        session.unsubscribe("never-existed");
        assert_eq!(session.client_count(), 0);

        let (_, mut kept) = session.subscribe("kept").unwrap();
        session.write(b"echo after-$((5+5))\n").unwrap();
        read_until(&mut kept, "after-10").await;

        // The removed sender was dropped, so the channel is closed and empty.
        assert_eq!(gone.recv().await, None);
        session.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_writes() {
        let (session, exit) = spawn_session();
        let (_, mut rx) = session.subscribe("c1").unwrap();

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let s = session.clone();
                std::thread::spawn(move || s.close())
            })
            .collect();
        for c in closers {
            c.join().unwrap();
        }
        session.close();

        assert!(session.is_closed());
        assert_eq!(session.client_count(), 0);
        assert!(matches!(
            session.write(b"x"),
            Err(OpshError::SessionClosed(_))
        ));
        assert!(matches!(
            session.subscribe("c2"),
            Err(OpshError::SessionClosed(_))
        ));

        // Subscriber channel ends once the session closes.
        timeout(Duration::from_secs(5), async { while rx.recv().await.is_some() {} })
            .await
            .unwrap();

        // Exit hook fires exactly once, after the shell is reaped.
        let id = exit.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, session.id());
        assert!(exit.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(session.has_exited());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn close_kills_shell_that_ignores_hangup() {
        let mut o = opts();
        o.shell.args = vec!["-c".into(), "trap '' HUP; exec sleep 60".into()];
        let session =
            TerminalSession::spawn(crate::session::manager::new_session_id(), o, Box::new(|_| {}))
                .unwrap();
        let pid = session.shell_pid().unwrap();
        assert!(!session.has_exited());

        session.close();
        assert!(session.wait_exited(Duration::from_secs(5)).await);
        assert!(!process::is_running(pid));
    }

    /// Read until the shell prints `job-1-<pid>` and return the pid.
    #[cfg(target_os = "linux")]
    async fn job_pid(rx: &mut mpsc::Receiver<Vec<u8>>) -> u32 {
        let find = async {
            let mut seen = String::new();
            while let Some(chunk) = rx.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if let Some(i) = seen.find("job-1-") {
                    let tail = &seen[i + "job-1-".len()..];
                    if let Some(end) = tail.find(['\r', '\n']) {
                        return tail[..end].trim().parse().ok();
                    }
                }
            }
            None
        };
        timeout(Duration::from_secs(10), find)
            .await
            .expect("timed out waiting for job pid")
            .expect("no job pid in output")
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn close_takes_background_jobs_down() {
        let (session, exit) = spawn_session();
        let (_, mut rx) = session.subscribe("c1").unwrap();
        session
            .write(b"sleep 4242 & echo job-$((0+1))-$!\n")
            .unwrap();
        let job = job_pid(&mut rx).await;
        assert!(process::is_running(job));

        session.close();
        exit.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process::is_running(job) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process::is_running(job), "background job {job} survived close");
    }

    #[tokio::test]
    async fn shell_exit_closes_session() {
        let (session, exit) = spawn_session();
        session.write(b"exit\n").unwrap();
        exit.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(session.is_closed());
        assert!(session.info().closed);
    }

    #[tokio::test]
    async fn full_subscriber_drops_chunks_without_blocking() {
        let mut o = opts();
        o.subscriber_capacity = 1;
        let (tx, _exit) = std_mpsc::channel::<String>();
        let session = TerminalSession::spawn(
            crate::session::manager::new_session_id(),
            o,
            Box::new(move |id| {
                let _ = tx.send(id.to_string());
            }),
        )
        .unwrap();

        let (_, _stalled) = session.subscribe("stalled").unwrap();
        let (_, mut live) = session.subscribe("live").unwrap();
        for i in 0..20 {
            session.write(format!("echo line-{i}\n").as_bytes()).unwrap();
        }
        // The stalled viewer never reads; the shell still gets through all input.
        timeout(Duration::from_secs(10), async {
            loop {
                let _ = timeout(Duration::from_millis(50), live.recv()).await;
                if String::from_utf8_lossy(&session.ring.read_all()).contains("line-19\r\n") {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(session.dropped_chunks() > 0);
        assert_eq!(session.client_count(), 2);
        session.close();
    }

    #[tokio::test]
    async fn info_reflects_state() {
        let (session, _exit) = spawn_session();
        let (_, _rx) = session.subscribe("c1").unwrap();
        let info = session.info();
        assert_eq!(info.user_id, "u1");
        assert_eq!(info.username, "alice");
        assert_eq!(info.shell, "/bin/sh");
        assert_eq!(info.client_count, 1);
        assert_eq!((info.cols, info.rows), (80, 24));
        session.resize(120, 30).unwrap();
        assert_eq!((session.info().cols, session.info().rows), (120, 30));
        assert!(info.name.starts_with("term-"));
        assert!(!info.closed);
        session.close();
    }
}
