//! PTY Manager for Claude Code subprocess management
//!
//! Spawns Claude Code via pseudo-terminal with timeout handling.
//! This is necessary because Claude Code expects an interactive terminal.

use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};

use crate::oracle::OracleError;

/// Default timeout for a single oracle call
pub const DEFAULT_CLAUDE_TIMEOUT_SECS: u64 = 60;

/// PTY Manager for spawning Claude Code
pub struct PtyManager {
    timeout_secs: u64,
    model: Option<String>,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            timeout_secs: DEFAULT_CLAUDE_TIMEOUT_SECS,
            model: None,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Pass `--model` to the CLI. Empty names are ignored.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    /// Check if Claude Code CLI is available
    pub fn is_claude_available() -> bool {
        Command::new("which")
            .arg("claude")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn command_args<'a>(&'a self, prompt: &'a str) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(4);
        if let Some(model) = self.model.as_deref() {
            args.push("--model");
            args.push(model);
        }
        args.push("--print");
        args.push(prompt);
        args
    }

    /// Run `claude --print <prompt>` in `workdir` and capture its output.
    ///
    /// Blocking: async callers run this on the blocking pool.
    pub fn spawn_claude(&self, workdir: &Path, prompt: &str) -> Result<ClaudeOutput, OracleError> {
        if !Self::is_claude_available() {
            return Err(OracleError::NotAvailable);
        }

        let pty_system = NativePtySystem::default();

        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| OracleError::Io(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new("claude");
        cmd.args(self.command_args(prompt));
        cmd.cwd(workdir);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| OracleError::Io(format!("Failed to spawn claude: {}", e)))?;

        // Drop the slave to avoid blocking
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| OracleError::Io(format!("Failed to clone PTY reader: {}", e)))?;

        let (tx, rx) = mpsc::channel();
        let timeout = Duration::from_secs(self.timeout_secs);

        thread::spawn(move || {
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break, // EOF
                    Ok(n) => raw.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
        });

        let output = match rx.recv_timeout(timeout) {
            Ok(output) => output,
            Err(_) => {
                let _ = child.kill();
                return Err(OracleError::Timeout(self.timeout_secs));
            }
        };

        let lowered = output.to_lowercase();
        if lowered.contains("not authenticated")
            || lowered.contains("please login")
            || lowered.contains("login required")
        {
            return Err(OracleError::NotAuthenticated);
        }
        if lowered.contains("rate limit") || lowered.contains("too many requests") {
            return Err(OracleError::RateLimited);
        }

        Ok(ClaudeOutput {
            stdout: output.replace("\r\n", "\n"),
        })
    }
}

/// Output from Claude Code execution
#[derive(Debug)]
pub struct ClaudeOutput {
    pub stdout: String,
}
