//! Bounded one-shot command runs.
//!
//! `create_execution` only records a `pending` run. `execute` owns the run
//! from there: it is the single writer of the record and of its output
//! feed, and it commits the terminal state exactly once. A feed exists only
//! while someone is waiting on a pending run or the run is in flight.

use super::feed::OutputFeed;
use crate::config::ExecutionConfig;
use crate::process::{self, Signal};
use crate::store::{CommandStore, ExecutionStore};
use crate::stream::ExecutionStream;
use chrono::Utc;
use opsh_core::messages::MAX_PAGE_LIMIT;
use opsh_core::{generate_id, CommandSpec, Execution, ExecutionStatus, OpshError, OpshResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bytes read from a child pipe at a time.
const READ_CHUNK_SIZE: usize = 8192;

/// How long to keep reading after the shell exits, for output still held
/// by descendants that inherited its pipes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How a run ended, before it is written to the record.
#[derive(Debug)]
enum Outcome {
    Exited(i32),
    TimedOut,
    SpawnFailed(String),
}

/// Runs commands and tracks live output for in-flight executions.
pub struct ExecutionEngine {
    config: ExecutionConfig,
    commands: Arc<dyn CommandStore>,
    store: Arc<dyn ExecutionStore>,
    /// Feeds of executions being run or waited on.
    feeds: RwLock<HashMap<String, Arc<OutputFeed>>>,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutionConfig,
        commands: Arc<dyn CommandStore>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            config,
            commands,
            store,
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Record a `pending` run of `command_id`. Nothing is started.
    pub fn create_execution(&self, command_id: &str, user_id: &str) -> OpshResult<Execution> {
        self.commands.get_command(command_id)?;

        let execution = Execution::new(
            generate_id(),
            command_id.to_string(),
            user_id.to_string(),
            Utc::now(),
        );
        self.store.insert(execution.clone())?;

        info!(execution_id = %execution.id, command_id, user_id, "execution created");
        Ok(execution)
    }

    /// Start `execute` as a background task.
    pub fn run(self: &Arc<Self>, execution_id: String) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute(&execution_id).await {
                error!(execution_id = %execution_id, error = %e, "execution failed to run");
            }
        })
    }

    /// Run a `pending` execution to a terminal status and return the final
    /// record.
    pub async fn execute(&self, execution_id: &str) -> OpshResult<Execution> {
        let mut execution = self.store.get(execution_id)?;
        let command = self.commands.get_command(&execution.command_id);

        execution.start(Utc::now())?;
        if let Err(e) = self.store.update(&execution) {
            // The record is still pending; release anyone waiting on it.
            if let Some(feed) = self.take_feed(execution_id) {
                feed.finish(ExecutionStatus::Failed, None);
            }
            return Err(e);
        }
        let feed = self.feed_for(execution_id);
        feed.set_status(ExecutionStatus::Running);

        let outcome = match command {
            Ok(command) => {
                let timeout = self.config.timeout_for(&command);
                info!(
                    execution_id,
                    command_id = %command.id,
                    timeout_secs = timeout.as_secs(),
                    "execution started"
                );
                run_command(execution_id, &command, timeout, &feed).await
            }
            Err(e) => Outcome::SpawnFailed(e.to_string()),
        };

        let now = Utc::now();
        let committed = match outcome {
            Outcome::Exited(code) => {
                let (output, truncated) = feed.output();
                execution.complete(code, output, truncated, now)
            }
            Outcome::TimedOut => {
                let (output, truncated) = feed.output();
                execution.time_out(output, truncated, now)
            }
            Outcome::SpawnFailed(reason) => {
                warn!(execution_id, reason = %reason, "could not start command");
                feed.append(format!("failed to start command: {reason}\n").as_bytes());
                let (output, truncated) = feed.output();
                execution.complete(-1, output, truncated, now)
            }
        }
        .and_then(|()| self.store.update(&execution));

        // Viewers are released even if the commit failed.
        feed.finish(execution.status, execution.exit_code);
        self.take_feed(execution_id);
        committed?;

        info!(
            execution_id,
            status = %execution.status,
            exit_code = ?execution.exit_code,
            output_bytes = execution.output.len(),
            truncated = execution.output_truncated,
            "execution finished"
        );
        Ok(execution)
    }

    pub fn get_execution_by_id(&self, execution_id: &str) -> OpshResult<Execution> {
        self.store.get(execution_id)
    }

    /// Newest first, at most [`MAX_PAGE_LIMIT`] per page.
    pub fn get_executions(&self, limit: usize, offset: usize) -> OpshResult<Vec<Execution>> {
        self.store.list(limit.min(MAX_PAGE_LIMIT), offset)
    }

    /// Attach a viewer: replay of everything so far, then live events until
    /// the execution is terminal.
    pub fn attach(&self, execution_id: &str) -> OpshResult<ExecutionStream> {
        if let Some(feed) = self.live_feed(execution_id) {
            return Ok(ExecutionStream::live(&feed));
        }
        let execution = self.store.get(execution_id)?;
        match execution.status {
            status if status.is_terminal() => Ok(ExecutionStream::finished(&execution)),
            // Not started yet; `execute` picks up this feed.
            ExecutionStatus::Pending => Ok(ExecutionStream::live(&self.feed_for(execution_id))),
            // Started, but its run ended without committing a result.
            status => Err(OpshError::Other(format!(
                "execution {execution_id} is {status} with no run in progress"
            ))),
        }
    }

    fn live_feed(&self, execution_id: &str) -> Option<Arc<OutputFeed>> {
        self.feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    fn take_feed(&self, execution_id: &str) -> Option<Arc<OutputFeed>> {
        self.feeds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id)
    }

    fn feed_for(&self, execution_id: &str) -> Arc<OutputFeed> {
        self.feeds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_id.to_string())
            .or_insert_with(|| OutputFeed::new(self.config.max_output_bytes))
            .clone()
    }
}

/// Spawn `command` through `sh -c` in its own process group and feed its
/// combined output into `feed` until it exits or `timeout` passes.
async fn run_command(
    execution_id: &str,
    command: &CommandSpec,
    timeout: Duration,
    feed: &OutputFeed,
) -> Outcome {
    let deadline = Instant::now() + timeout;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&command.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = command.working_dir.as_deref().filter(|d| !d.is_empty()) {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Outcome::SpawnFailed(e.to_string()),
    };
    let pid = child.id();
    debug!(execution_id, pid = ?pid, "command spawned");

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, tx.clone())));
    }
    drop(tx);

    let mut exit_code: Option<i32> = None;
    let mut pipes_open = true;
    let mut wake_at = deadline;

    let outcome = loop {
        tokio::select! {
            chunk = rx.recv(), if pipes_open => match chunk {
                Some(chunk) => {
                    feed.append(&chunk);
                }
                None => pipes_open = false,
            },
            status = child.wait(), if exit_code.is_none() => {
                let code = match status {
                    Ok(status) => process::exit_code(&status),
                    Err(e) => {
                        warn!(execution_id, error = %e, "wait on command failed");
                        -1
                    }
                };
                exit_code = Some(code);
                wake_at = deadline.min(Instant::now() + DRAIN_GRACE);
            }
            _ = tokio::time::sleep_until(wake_at) => {
                break match exit_code {
                    Some(code) => Outcome::Exited(code),
                    None => Outcome::TimedOut,
                };
            }
        }
        if let (Some(code), false) = (exit_code, pipes_open) {
            break Outcome::Exited(code);
        }
    };

    // Chunks the pumps queued before the loop ended still belong to the run.
    while let Ok(chunk) = rx.try_recv() {
        feed.append(&chunk);
    }

    if matches!(outcome, Outcome::TimedOut) {
        warn!(execution_id, timeout_secs = timeout.as_secs(), "command timed out, killing");
    }
    // Kills the shell on timeout and any stragglers still holding the pipes.
    if let Some(pid) = pid {
        if let Err(e) = process::signal_group(pid, Signal::Kill) {
            debug!(execution_id, error = %e, "failed to signal process group");
        }
    }
    if exit_code.is_none() {
        let _ = child.start_kill();
        if let Err(e) = child.wait().await {
            debug!(execution_id, error = %e, "reaping command failed");
        }
    }
    for pump in pumps {
        pump.abort();
    }

    outcome
}

/// Forward everything read from `reader` to `tx` until EOF.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "command pipe read failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::{ConfigCommandStore, MemoryExecutionStore};
    use crate::stream::StreamEvent;
    use tokio::time::timeout;

    fn command(id: &str, cmd: &str, timeout_secs: Option<u64>) -> CommandSpec {
        CommandSpec {
            id: id.into(),
            command: cmd.into(),
            working_dir: None,
            timeout_secs,
        }
    }

    fn engine_with(config: ExecutionConfig, commands: Vec<CommandSpec>) -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(
            config,
            Arc::new(ConfigCommandStore::new(commands)),
            Arc::new(MemoryExecutionStore::new()),
        ))
    }

    fn engine(commands: Vec<CommandSpec>) -> Arc<ExecutionEngine> {
        engine_with(ExecutionConfig::default(), commands)
    }

    #[tokio::test]
    async fn create_is_pending_and_does_not_run() {
        let engine = engine(vec![command("hello", "echo hello", None)]);
        let exec = engine.create_execution("hello", "u1").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.started_at.is_none());
        assert_eq!(
            engine.get_execution_by_id(&exec.id).unwrap().status,
            ExecutionStatus::Pending
        );
        assert!(engine.live_feed(&exec.id).is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let engine = engine(vec![]);
        assert!(matches!(
            engine.create_execution("nope", "u1"),
            Err(OpshError::CommandNotFound(_))
        ));
        assert!(engine.get_executions(10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let engine = engine(vec![]);
        assert!(matches!(
            engine.get_execution_by_id("missing"),
            Err(OpshError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.execute("missing").await,
            Err(OpshError::ExecutionNotFound(_))
        ));
        assert!(engine.attach("missing").is_err());
    }

    #[tokio::test]
    async fn echo_hello_end_to_end() {
        let engine = engine(vec![command("hello", "echo hello", None)]);
        let exec = engine.create_execution("hello", "u1").unwrap();
        let mut stream = engine.attach(&exec.id).unwrap();

        let handle = engine.run(exec.id.clone());

        let mut statuses = Vec::new();
        let mut output = Vec::new();
        let mut done = None;
        while let Some(event) = timeout(Duration::from_secs(10), stream.next()).await.unwrap() {
            match event {
                StreamEvent::Replay(data) => assert!(data.is_empty()),
                StreamEvent::Status(status) => statuses.push(status),
                StreamEvent::Output(chunk) => output.extend_from_slice(&chunk),
                StreamEvent::Done { status, exit_code, .. } => {
                    statuses.push(status);
                    done = Some(exit_code);
                }
            }
        }
        handle.await.unwrap();

        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Success
            ]
        );
        assert_eq!(done, Some(Some(0)));
        assert!(String::from_utf8_lossy(&output).contains("hello"));

        let stored = engine.get_execution_by_id(&exec.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert_eq!(stored.exit_code, Some(0));
        assert!(String::from_utf8_lossy(&stored.output).contains("hello"));
        assert!(stored.started_at.is_some());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_and_stderr_captured() {
        let engine = engine(vec![command("bad", "echo oops >&2; exit 3", None)]);
        let exec = engine.create_execution("bad", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
        assert!(String::from_utf8_lossy(&done.output).contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_and_leaves_exit_code_unset() {
        let engine = engine(vec![command("slow", "sleep 5", Some(1))]);
        let exec = engine.create_execution("slow", "u1").unwrap();

        let started = std::time::Instant::now();
        let done = engine.execute(&exec.id).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(done.status, ExecutionStatus::Timeout);
        assert_eq!(done.exit_code, None);
        let run_ms = done.duration().unwrap().num_milliseconds();
        assert!((900..2000).contains(&run_ms), "ran for {run_ms}ms");
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_kills_children_too() {
        let engine = engine(vec![command("tree", "sleep 30 & sleep 30; wait", Some(1))]);
        let exec = engine.create_execution("tree", "u1").unwrap();
        let started = std::time::Instant::now();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Timeout);
        // The background sleep held the pipes; had it survived, this would hang.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_clamped_to_system_maximum() {
        let config = ExecutionConfig {
            default_timeout_secs: 1,
            max_timeout_secs: 1,
            max_output_bytes: 1024,
        };
        let engine = engine_with(config, vec![command("slow", "sleep 5", Some(100))]);
        let exec = engine.create_execution("slow", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn output_truncated_to_exact_cap() {
        let config = ExecutionConfig {
            max_output_bytes: 1000,
            ..ExecutionConfig::default()
        };
        let engine = engine_with(
            config,
            vec![command("big", "head -c 50000 /dev/zero | tr '\\0' x", None)],
        );
        let exec = engine.create_execution("big", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.output.len(), 1000);
        assert!(done.output.iter().all(|&b| b == b'x'));
        assert!(done.output_truncated);
    }

    #[tokio::test]
    async fn small_output_not_marked_truncated() {
        let engine = engine(vec![command("small", "printf abc", None)]);
        let exec = engine.create_execution("small", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.output, b"abc");
        assert!(!done.output_truncated);
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command("pwd", "pwd", None);
        cmd.working_dir = Some(dir.path().to_string_lossy().into_owned());
        let engine = engine(vec![cmd]);
        let exec = engine.create_execution("pwd", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        let printed = String::from_utf8_lossy(&done.output).trim().to_string();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&printed).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn bad_working_directory_fails_with_exit_code() {
        let mut cmd = command("lost", "true", None);
        cmd.working_dir = Some("/nonexistent/opsh/dir".into());
        let engine = engine(vec![cmd]);
        let exec = engine.create_execution("lost", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.exit_code, Some(-1));
        assert!(String::from_utf8_lossy(&done.output).contains("failed to start command"));
    }

    #[tokio::test]
    async fn execute_twice_is_rejected() {
        let engine = engine(vec![command("t", "true", None)]);
        let exec = engine.create_execution("t", "u1").unwrap();
        engine.execute(&exec.id).await.unwrap();
        assert!(matches!(
            engine.execute(&exec.id).await,
            Err(OpshError::InvalidTransition { .. })
        ));
        assert_eq!(
            engine.get_execution_by_id(&exec.id).unwrap().status,
            ExecutionStatus::Success
        );
        assert!(engine.live_feed(&exec.id).is_none());
    }

    #[tokio::test]
    async fn timeout_keeps_output_written_before_deadline() {
        let engine = engine(vec![command(
            "partial",
            "head -c 20000 /dev/zero | tr '\\0' y; printf end; sleep 5",
            Some(1),
        )]);
        let exec = engine.create_execution("partial", "u1").unwrap();
        let done = engine.execute(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Timeout);
        assert_eq!(done.output.len(), 20003);
        assert!(done.output.ends_with(b"end"));
    }

    /// Stores records in memory but refuses to commit terminal states.
    struct NoFinishStore(MemoryExecutionStore);

    impl ExecutionStore for NoFinishStore {
        fn insert(&self, execution: Execution) -> OpshResult<()> {
            self.0.insert(execution)
        }

        fn get(&self, execution_id: &str) -> OpshResult<Execution> {
            self.0.get(execution_id)
        }

        fn update(&self, execution: &Execution) -> OpshResult<()> {
            if execution.status.is_terminal() {
                return Err(OpshError::Other("store unavailable".into()));
            }
            self.0.update(execution)
        }

        fn list(&self, limit: usize, offset: usize) -> OpshResult<Vec<Execution>> {
            self.0.list(limit, offset)
        }
    }

    #[tokio::test]
    async fn failed_commit_releases_viewers_and_refuses_new_ones() {
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionConfig::default(),
            Arc::new(ConfigCommandStore::new(vec![command("t", "echo t", None)])),
            Arc::new(NoFinishStore(MemoryExecutionStore::new())),
        ));
        let exec = engine.create_execution("t", "u1").unwrap();
        let mut early = engine.attach(&exec.id).unwrap();

        assert!(engine.execute(&exec.id).await.is_err());
        assert!(engine.live_feed(&exec.id).is_none());
        assert_eq!(
            engine.get_execution_by_id(&exec.id).unwrap().status,
            ExecutionStatus::Running
        );

        // The viewer that was already attached still gets a final event.
        let mut finished = false;
        while let Some(event) = timeout(Duration::from_secs(5), early.next()).await.unwrap() {
            finished |= matches!(event, StreamEvent::Done { .. });
        }
        assert!(finished);

        // A stuck record is reported, not waited on.
        assert!(matches!(engine.attach(&exec.id), Err(OpshError::Other(_))));
    }

    #[tokio::test]
    async fn attach_after_finish_replays_record() {
        let engine = engine(vec![command("hi", "echo hi", None)]);
        let exec = engine.create_execution("hi", "u1").unwrap();
        engine.execute(&exec.id).await.unwrap();

        let mut stream = engine.attach(&exec.id).unwrap();
        match stream.next().await {
            Some(StreamEvent::Replay(data)) => assert_eq!(data, b"hi\n"),
            other => panic!("expected replay, got {other:?}"),
        }
        assert!(matches!(
            stream.next().await,
            Some(StreamEvent::Done {
                status: ExecutionStatus::Success,
                exit_code: Some(0),
                truncated: false
            })
        ));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn attach_mid_run_sees_replay_then_live() {
        let engine = engine(vec![command(
            "ticks",
            "echo one; sleep 0.5; echo two",
            None,
        )]);
        let exec = engine.create_execution("ticks", "u1").unwrap();
        let handle = engine.run(exec.id.clone());

        // Wait for the first line to land.
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(feed) = engine.live_feed(&exec.id) {
                    if feed.output().0.starts_with(b"one") {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut stream = engine.attach(&exec.id).unwrap();
        let mut all = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(5), stream.next()).await.unwrap() {
            match event {
                StreamEvent::Replay(data) | StreamEvent::Output(data) => all.extend(data),
                _ => {}
            }
        }
        handle.await.unwrap();
        assert_eq!(all, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn list_is_paginated_newest_first() {
        let engine = engine(vec![command("t", "true", None)]);
        let a = engine.create_execution("t", "u1").unwrap();
        let b = engine.create_execution("t", "u1").unwrap();
        let c = engine.create_execution("t", "u1").unwrap();
        let page: Vec<String> = engine
            .get_executions(2, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(page, vec![c.id.clone(), b.id.clone()]);
        let rest = engine.get_executions(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, a.id);
    }
}
