//! Terminal-multiplexer pane controller.
//!
//! Each worker's runner process is launched into its own `tmux` session so
//! an operator can attach and watch an agent work in real time. Grounded on
//! [`crate::worktree::WorktreeManager`]'s `Command::new("git")...output()`
//! idiom: every operation here shells out the same way, just to `tmux`.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("tmux command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tmux {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Shells out to `tmux` to create, drive, and tear down per-worker panes.
#[derive(Debug, Clone)]
pub struct PaneController {
    session_prefix: String,
}

impl PaneController {
    /// Build a controller with the given session-name prefix. Reads
    /// `GATOR_SESSION_PREFIX` when `prefix` is `None`, so nested fleet runs
    /// (e.g. in CI matrices) don't collide on session names.
    pub fn new(prefix: Option<String>) -> Self {
        let session_prefix = prefix
            .or_else(|| std::env::var("GATOR_SESSION_PREFIX").ok())
            .unwrap_or_else(|| "gator".to_string());
        Self { session_prefix }
    }

    fn qualify(&self, id: &str) -> String {
        format!("{}-{}", self.session_prefix, id)
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, PaneError> {
        Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| PaneError::Command {
                message: format!("failed to run tmux {}", args.join(" ")),
                source: e,
            })
    }

    /// Create a detached session with the given working directory. Returns
    /// the fully-qualified session name.
    pub fn create_session(&self, id: &str, cwd: &Path) -> Result<String, PaneError> {
        let name = self.qualify(id);
        let cwd_str = cwd.to_string_lossy().to_string();
        let output = self.run(&["new-session", "-d", "-s", &name, "-c", &cwd_str])?;
        if !output.status.success() {
            return Err(PaneError::Exit {
                command: "new-session".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(name)
    }

    /// Kill a session. Missing sessions are treated as already-killed.
    pub fn kill_session(&self, name: &str) -> Result<(), PaneError> {
        if !self.session_exists(name)? {
            return Ok(());
        }
        let output = self.run(&["kill-session", "-t", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("session not found") {
                return Ok(());
            }
            return Err(PaneError::Exit {
                command: "kill-session".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// Type a command into the session followed by Enter.
    pub fn send_command(&self, name: &str, command: &str) -> Result<(), PaneError> {
        let output = self.run(&["send-keys", "-t", name, command, "Enter"])?;
        if !output.status.success() {
            return Err(PaneError::Exit {
                command: "send-keys".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Capture the last `lines` lines of the session's scrollback. Missing
    /// sessions return an empty string rather than an error.
    pub fn capture_output(&self, name: &str, lines: usize) -> Result<String, PaneError> {
        if !self.session_exists(name)? {
            return Ok(String::new());
        }
        let start = format!("-{lines}");
        let output = self.run(&["capture-pane", "-t", name, "-p", "-S", &start])?;
        if !output.status.success() {
            return Err(PaneError::Exit {
                command: "capture-pane".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// List every live session name under this controller's prefix.
    pub fn list_sessions(&self) -> Result<Vec<String>, PaneError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            // tmux exits non-zero ("no server running") when there are no
            // sessions at all -- that's an empty list, not an error.
            return Ok(Vec::new());
        }
        let names = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with(&format!("{}-", self.session_prefix)))
            .map(|l| l.to_string())
            .collect();
        Ok(names)
    }

    /// Whether a session exists. Never errors on "no such session".
    pub fn session_exists(&self, name: &str) -> Result<bool, PaneError> {
        let output = self.run(&["has-session", "-t", name])?;
        Ok(output.status.success())
    }

    /// Send Ctrl-C to interrupt whatever is running in the session.
    pub fn interrupt(&self, name: &str) -> Result<(), PaneError> {
        if !self.session_exists(name)? {
            return Ok(());
        }
        let output = self.run(&["send-keys", "-t", name, "C-c"])?;
        if !output.status.success() {
            return Err(PaneError::Exit {
                command: "send-keys (interrupt)".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_uses_prefix() {
        let controller = PaneController::new(Some("testfleet".to_string()));
        assert_eq!(controller.qualify("task-1"), "testfleet-task-1");
    }

    #[test]
    fn default_prefix_is_gator_without_env_or_arg() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::remove_var("GATOR_SESSION_PREFIX");
        }
        let controller = PaneController::new(None);
        assert_eq!(controller.qualify("x"), "gator-x");
    }
}
