//! Terminal sessions: PTY lifecycle, replay buffer, fan-out, registry.

pub mod manager;
pub mod pty;
pub mod ring_buffer;
pub mod terminal;

pub use manager::TerminalSessionManager;
pub use terminal::TerminalSession;
