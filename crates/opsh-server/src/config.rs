//! Server configuration: TOML file + CLI overrides.

use opsh_core::{CommandSpec, OpshError, OpshResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// `[execution]` section: limits for one-shot command runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            max_timeout_secs: 3600,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ExecutionConfig {
    /// Deadline for a command: its own timeout (or the default when unset
    /// or zero), clamped to the system maximum.
    pub fn timeout_for(&self, command: &CommandSpec) -> Duration {
        let secs = match command.timeout_secs {
            Some(secs) if secs > 0 => secs,
            _ => self.default_timeout_secs,
        };
        Duration::from_secs(secs.min(self.max_timeout_secs))
    }
}

/// `[terminal]` section: interactive shell sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub enabled: bool,
    pub shell: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub max_sessions_per_user: usize,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub replay_buffer_bytes: usize,
    /// Channel capacity per subscriber, in chunks.
    pub subscriber_capacity: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            max_sessions_per_user: 10,
            idle_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
            replay_buffer_bytes: 256 * 1024,
            subscriber_capacity: 256,
            cols: 80,
            rows: 24,
        }
    }
}

fn default_port() -> u16 {
    7070
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub execution: ExecutionConfig,
    pub terminal: TerminalConfig,
    pub commands: Vec<CommandSpec>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_shell: Option<&str>,
        cli_max_sessions_per_user: Option<usize>,
        cli_idle_ttl: Option<u64>,
    ) -> OpshResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| OpshError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut terminal = file_config.terminal;
        if let Some(shell) = cli_shell {
            terminal.shell = shell.to_string();
        }
        if let Some(max) = cli_max_sessions_per_user {
            terminal.max_sessions_per_user = max;
        }
        if let Some(ttl) = cli_idle_ttl {
            terminal.idle_ttl_secs = ttl;
        }
        terminal.working_dir = terminal
            .working_dir
            .map(|dir| expand_tilde_str(&dir.to_string_lossy()));

        let config = Self {
            port: cli_port.unwrap_or(file_config.server.port),
            execution: file_config.execution,
            terminal,
            commands: file_config.commands,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the subsystems cannot run with.
    pub fn validate(&self) -> OpshResult<()> {
        let exec = &self.execution;
        if exec.max_output_bytes == 0 {
            return Err(OpshError::Config("execution.max_output_bytes must be > 0".into()));
        }
        if exec.default_timeout_secs > exec.max_timeout_secs {
            return Err(OpshError::Config(format!(
                "execution.default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                exec.default_timeout_secs, exec.max_timeout_secs
            )));
        }

        let term = &self.terminal;
        if term.replay_buffer_bytes == 0 {
            return Err(OpshError::Config("terminal.replay_buffer_bytes must be > 0".into()));
        }
        if term.subscriber_capacity == 0 {
            return Err(OpshError::Config("terminal.subscriber_capacity must be > 0".into()));
        }
        if term.enabled && term.shell.trim().is_empty() {
            return Err(OpshError::Config("terminal.shell must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for command in &self.commands {
            if !seen.insert(command.id.as_str()) {
                return Err(OpshError::Config(format!(
                    "duplicate command id: {}",
                    command.id
                )));
            }
        }
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
