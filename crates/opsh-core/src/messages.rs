//! Control-channel requests/responses and stream frames.
//!
//! All messages are JSON with an internal tag: `op` for requests, `type`
//! for everything the server sends.

use crate::error::OpshError;
use crate::execution::{Execution, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default page size for `list_executions`.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page `list_executions` will return.
pub const MAX_PAGE_LIMIT: usize = 500;

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// A request on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Create an execution and start running it in the background.
    CreateExecution { command_id: String, user_id: String },
    GetExecution { id: String },
    ListExecutions {
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },
    CreateSession { user_id: String, username: String },
    GetSession { id: String },
    /// Sessions of one user, or all sessions when `user_id` is absent.
    ListSessions {
        #[serde(default)]
        user_id: Option<String>,
    },
    CloseSession { id: String },
}

/// A response on the control channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Execution { execution: Execution },
    Executions { executions: Vec<Execution> },
    Session { session: SessionInfo },
    Sessions { sessions: Vec<SessionInfo> },
    Closed { id: String },
    Error { code: String, message: String },
}

impl From<&OpshError> for Response {
    fn from(e: &OpshError) -> Self {
        Response::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Read-only projection of a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub username: String,
    pub shell: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub client_count: usize,
    pub cols: u16,
    pub rows: u16,
    /// Total bytes the shell has produced.
    pub output_bytes: u64,
    /// Live chunks dropped because a subscriber's channel was full.
    pub dropped_chunks: u64,
    pub closed: bool,
}

/// Text frames sent on an execution stream. Output travels as binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionFrame {
    Status {
        status: ExecutionStatus,
    },
    Done {
        status: ExecutionStatus,
        exit_code: Option<i32>,
        truncated: bool,
    },
    /// Still running, nothing new to report.
    Heartbeat,
}

/// Text frames a terminal viewer may send besides raw keystrokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalControl {
    Resize { cols: u16, rows: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_execution() {
        let req: Request =
            serde_json::from_str(r#"{"op":"create_execution","command_id":"c1","user_id":"u1"}"#)
                .unwrap();
        assert_eq!(
            req,
            Request::CreateExecution {
                command_id: "c1".into(),
                user_id: "u1".into()
            }
        );
    }

    #[test]
    fn list_executions_defaults() {
        let req: Request = serde_json::from_str(r#"{"op":"list_executions"}"#).unwrap();
        assert_eq!(
            req,
            Request::ListExecutions {
                limit: DEFAULT_PAGE_LIMIT,
                offset: 0
            }
        );
    }

    #[test]
    fn unknown_op_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"reboot"}"#).is_err());
    }

    #[test]
    fn error_response_carries_code() {
        let err = OpshError::SessionNotFound("abc".into());
        let json = serde_json::to_value(Response::from(&err)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not_found");
    }

    #[test]
    fn done_frame_shape() {
        let frame = ExecutionFrame::Done {
            status: ExecutionStatus::Timeout,
            exit_code: None,
            truncated: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"type":"done","status":"timeout","exit_code":null,"truncated":false}"#
        );
    }

    #[test]
    fn resize_control() {
        let ctl: TerminalControl =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(ctl, TerminalControl::Resize { cols: 120, rows: 40 });
    }
}
