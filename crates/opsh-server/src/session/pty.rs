//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a configured shell. The read side and
//! the child handle are handed to the session's read loop; everything the
//! API side needs (write, resize, terminate) stays on [`PtyHandle`].

use crate::process::{self, Signal};
use opsh_core::{OpshError, OpshResult};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// The halves of a freshly spawned PTY that belong to the read loop.
pub struct PtyOutput {
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// A managed PTY instance.
pub struct PtyHandle {
    /// Input side of the master. `None` once closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// The master, kept for resize operations. `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    size: Mutex<(u16, u16)>,
}

impl PtyHandle {
    /// Spawn `shell` in a new PTY of the given size.
    pub fn spawn(shell: &ShellCommand, cols: u16, rows: u16) -> OpshResult<(Self, PtyOutput)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| OpshError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        for arg in &shell.args {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &shell.working_dir {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| OpshError::SpawnFailed(format!("{}: {e}", shell.program)))?;
        // The slave must not stay open here, or reads never see EOF.
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| OpshError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| OpshError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

        info!(program = %shell.program, pid = ?pid, cols, rows, "PTY spawned");

        let handle = Self {
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            killer: Mutex::new(killer),
            pid,
            size: Mutex::new((cols, rows)),
        };
        Ok((handle, PtyOutput { reader, child }))
    }

    /// Write to the PTY input. Blocks until the bytes are handed to the kernel.
    pub fn write(&self, data: &[u8]) -> OpshResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = writer
            .as_mut()
            .ok_or_else(|| OpshError::SessionClosed("PTY closed".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> OpshResult<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let master = master
            .as_ref()
            .ok_or_else(|| OpshError::SessionClosed("PTY closed".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| OpshError::Other(format!("PTY resize failed: {e}")))?;
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = (cols, rows);
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Hang up every process group in the shell's session, background jobs
    /// included. Errors are ignored; the child may already be gone.
    pub fn terminate(&self) {
        match self.pid {
            Some(pid) => {
                let _ = process::signal_session(pid, Signal::Hangup);
            }
            None => {
                let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = killer.kill();
            }
        }
    }

    /// Forcefully kill everything left in the shell's session.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            let _ = process::signal_session(pid, Signal::Kill);
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = killer.kill();
    }

    /// Drop the writer and the master. Later writes fail with `SessionClosed`.
    pub fn close(&self) {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[test]
    fn spawn_missing_program_fails() {
        let mut shell = sh();
        shell.program = "/nonexistent/opsh-shell".into();
        let err = PtyHandle::spawn(&shell, 80, 24).err().unwrap();
        assert!(matches!(err, OpshError::SpawnFailed(_)));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let (pty, mut out) = PtyHandle::spawn(&sh(), 80, 24).unwrap();
        pty.close();
        let err = pty.write(b"echo hi\n").unwrap_err();
        assert!(matches!(err, OpshError::SessionClosed(_)));
        pty.kill();
        out.child.wait().unwrap();
    }

    #[test]
    fn resize_updates_size() {
        let (pty, mut out) = PtyHandle::spawn(&sh(), 80, 24).unwrap();
        pty.resize(132, 43).unwrap();
        assert_eq!(pty.size(), (132, 43));
        pty.kill();
        out.child.wait().unwrap();
    }
}
