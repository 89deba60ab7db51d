use thiserror::Error;

/// Errors produced by the opsh execution and terminal subsystems.
#[derive(Debug, Error)]
pub enum OpshError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session quota exceeded for user {user_id} (limit {limit})")]
    QuotaExceeded { user_id: String, limit: usize },

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("terminal sessions are disabled")]
    TerminalDisabled,

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl OpshError {
    /// Stable wire code for this error, used in control-channel responses.
    pub fn code(&self) -> &'static str {
        match self {
            OpshError::CommandNotFound(_)
            | OpshError::ExecutionNotFound(_)
            | OpshError::SessionNotFound(_) => "not_found",
            OpshError::QuotaExceeded { .. } => "quota_exceeded",
            OpshError::SpawnFailed(_) => "spawn_failed",
            OpshError::SessionClosed(_) => "session_closed",
            OpshError::TerminalDisabled => "terminal_disabled",
            OpshError::InvalidTransition { .. } => "invalid_state",
            OpshError::InvalidMessage(_) => "invalid_message",
            OpshError::Transport(_)
            | OpshError::Config(_)
            | OpshError::Io(_)
            | OpshError::Other(_) => "internal",
        }
    }

    /// Whether the caller caused this error (as opposed to the server).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OpshError::CommandNotFound(_)
                | OpshError::ExecutionNotFound(_)
                | OpshError::SessionNotFound(_)
                | OpshError::QuotaExceeded { .. }
                | OpshError::SessionClosed(_)
                | OpshError::TerminalDisabled
                | OpshError::InvalidTransition { .. }
                | OpshError::InvalidMessage(_)
        )
    }
}

impl From<serde_json::Error> for OpshError {
    fn from(e: serde_json::Error) -> Self {
        OpshError::InvalidMessage(e.to_string())
    }
}

pub type OpshResult<T> = Result<T, OpshError>;
