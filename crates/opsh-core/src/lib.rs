//! opsh-core: shared types for the operator shell.
//!
//! Provides the error taxonomy, execution records and their status state
//! machine, control-channel messages, stream frames, and id generation.

pub mod error;
pub mod execution;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{OpshError, OpshResult};
pub use execution::{CommandSpec, Execution, ExecutionStatus};
pub use identity::{generate_id, short_id, terminal_name};
pub use messages::{ExecutionFrame, Request, Response, SessionInfo, TerminalControl};
