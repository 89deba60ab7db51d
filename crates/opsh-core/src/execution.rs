//! Execution records and their status state machine.
//!
//! An execution moves `pending -> running -> {success | failed | timeout}`
//! and is never mutated again once it reaches a terminal status.

use crate::error::{OpshError, OpshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Lifecycle status of a single command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Success) | (Running, Failed) | (Running, Timeout)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runnable command as configured by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    /// Shell string, run through `sh -c`.
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Per-command timeout in seconds; `None` or 0 means the system default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One requested run of a [`CommandSpec`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub id: String,
    pub command_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    #[serde(serialize_with = "lossy_utf8")]
    pub output: Vec<u8>,
    /// Set when output beyond the capture limit was discarded.
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Create a new `pending` record.
    pub fn new(id: String, command_id: String, user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            command_id,
            user_id,
            status: ExecutionStatus::Pending,
            output: Vec::new(),
            output_truncated: false,
            exit_code: None,
            started_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    /// `pending -> running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> OpshResult<()> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// `running -> success | failed`, depending on the exit code.
    pub fn complete(
        &mut self,
        exit_code: i32,
        output: Vec<u8>,
        truncated: bool,
        now: DateTime<Utc>,
    ) -> OpshResult<()> {
        let next = if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        self.transition(next)?;
        self.exit_code = Some(exit_code);
        self.output = output;
        self.output_truncated = truncated;
        self.finished_at = Some(now);
        Ok(())
    }

    /// `running -> timeout`. The exit code stays unset.
    pub fn time_out(&mut self, output: Vec<u8>, truncated: bool, now: DateTime<Utc>) -> OpshResult<()> {
        self.transition(ExecutionStatus::Timeout)?;
        self.output = output;
        self.output_truncated = truncated;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Wall-clock run time, once both timestamps are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> OpshResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OpshError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Execution {
        Execution::new("e1".into(), "c1".into(), "u1".into(), Utc::now())
    }

    #[test]
    fn happy_path_success() {
        let mut exec = pending();
        exec.start(Utc::now()).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.finished_at.is_none());

        exec.complete(0, b"hello\n".to_vec(), false, Utc::now()).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.exit_code, Some(0));
        assert!(exec.finished_at.is_some());
        assert!(exec.duration().is_some());
    }

    #[test]
    fn nonzero_exit_is_failed() {
        let mut exec = pending();
        exec.start(Utc::now()).unwrap();
        exec.complete(3, Vec::new(), false, Utc::now()).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.exit_code, Some(3));
    }

    #[test]
    fn timeout_leaves_exit_code_unset() {
        let mut exec = pending();
        exec.start(Utc::now()).unwrap();
        exec.time_out(b"partial".to_vec(), true, Utc::now()).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert_eq!(exec.exit_code, None);
        assert!(exec.output_truncated);
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn cannot_complete_without_running() {
        let mut exec = pending();
        let err = exec.complete(0, Vec::new(), false, Utc::now()).unwrap_err();
        assert!(matches!(err, OpshError::InvalidTransition { .. }));
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.exit_code.is_none());
    }

    #[test]
    fn terminal_records_are_frozen() {
        let mut exec = pending();
        exec.start(Utc::now()).unwrap();
        exec.time_out(Vec::new(), false, Utc::now()).unwrap();
        assert!(exec.start(Utc::now()).is_err());
        assert!(exec.complete(0, Vec::new(), false, Utc::now()).is_err());
        assert_eq!(exec.status, ExecutionStatus::Timeout);
    }

    #[test]
    fn transition_table() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Success, Failed, Timeout] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Success, Failed, Timeout] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn serializes_output_as_text() {
        let mut exec = pending();
        exec.start(Utc::now()).unwrap();
        exec.complete(0, b"hi".to_vec(), false, Utc::now()).unwrap();
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["output"], "hi");
        assert_eq!(json["status"], "success");
    }
}
