//! The `shell` tool: foreground or background command execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::ToolDef;
use crate::config::DEFAULT_PROCESS_TIMEOUT_MS;
use crate::json_schema_for;
use crate::process::{ProcessRegistry, SpawnOptions, shell_launcher};
use crate::tools::core::{Tool, ToolFuture, parse_tool_args};
use crate::tools::names;

/// Typed arguments for `shell`.
#[derive(Deserialize, JsonSchema)]
pub struct ShellArgs {
    /// Shell command to execute (e.g. 'cargo test', 'git log --oneline -5').
    pub command: String,
    /// Start the command in the background and return its id immediately.
    /// Poll it with bash_output and stop it with kill_bash.
    #[serde(default)]
    pub run_in_background: bool,
    /// Timeout in milliseconds (default 600000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Run shell commands in a working directory.
///
/// Background commands are handed to the shared [`ProcessRegistry`].
pub struct Shell {
    workdir: PathBuf,
    processes: Arc<ProcessRegistry>,
    default_timeout: Duration,
}

impl Shell {
    pub fn new(workdir: impl Into<PathBuf>, processes: Arc<ProcessRegistry>) -> Self {
        Self {
            workdir: workdir.into(),
            processes,
            default_timeout: Duration::from_millis(DEFAULT_PROCESS_TIMEOUT_MS),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Tool for Shell {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::SHELL,
            "Run a shell command in the project directory and return its output. \
             Set run_in_background for long-running commands (servers, watchers, \
             slow builds); the call then returns an id to use with bash_output \
             and kill_bash.",
            json_schema_for::<ShellArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let args: ShellArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let timeout = args
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout);

            if args.run_in_background {
                let id = self.processes.spawn_with(
                    &args.command,
                    SpawnOptions::default()
                        .cwd(&self.workdir)
                        .timeout(timeout),
                );
                return format!(
                    "Command running in background with ID: {id}. \
                     Use bash_output to check on it and kill_bash to stop it."
                );
            }

            run_foreground(&self.workdir, &args.command, timeout).await
        })
    }
}

/// Run `command` to completion through the platform shell.
pub async fn run_foreground(workdir: &std::path::Path, command: &str, timeout: Duration) -> String {
    let (program, argv) = shell_launcher(command);
    let mut cmd = Command::new(program);
    cmd.args(&argv)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => format_output(output),
        Ok(Err(e)) => format!("Error running command: {e}"),
        Err(_) => {
            debug!("Foreground command timed out: {command}");
            format!(
                "Error: command timed out after {}ms and was terminated",
                timeout.as_millis()
            )
        }
    }
}

/// Format command output into a result string.
fn format_output(output: std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut text = stdout.trim_end().to_string();
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(stderr.trim_end());
    }
    match output.status.code() {
        Some(0) => text,
        Some(code) => format!("Command failed (exit code {code}):\n{text}"),
        None => format!("Command terminated by signal:\n{text}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::background::{BackgroundRegistry, UnitStatus};

    fn shell(dir: &std::path::Path) -> (Shell, Arc<ProcessRegistry>) {
        let processes = Arc::new(ProcessRegistry::new());
        (Shell::new(dir, Arc::clone(&processes)), processes)
    }

    #[test]
    fn definition_schema_has_background_flag() {
        let (tool, _) = shell(std::path::Path::new("/tmp"));
        let def = tool.definition();
        assert_eq!(def.function.name, "shell");
        assert!(def.function.parameters["properties"]["run_in_background"].is_object());
    }

    #[tokio::test]
    async fn foreground_returns_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let (tool, _) = shell(dir.path());
        let out = tool.execute(r#"{"command": "ls"}"#).await;
        assert_eq!(out, "marker.txt");
    }

    #[tokio::test]
    async fn foreground_failure_reports_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = shell(dir.path());
        let out = tool
            .execute(r#"{"command": "echo oops 1>&2; exit 4"}"#)
            .await;
        assert_eq!(out, "Command failed (exit code 4):\n[stderr]\noops");
    }

    #[tokio::test]
    async fn foreground_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = shell(dir.path());
        let out = tool
            .execute(r#"{"command": "sleep 5", "timeout_ms": 100}"#)
            .await;
        assert!(out.contains("timed out after 100ms"), "{out}");
    }

    #[tokio::test]
    async fn background_registers_process() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, processes) = shell(dir.path());
        let out = tool
            .execute(r#"{"command": "sleep 5", "run_in_background": true}"#)
            .await;
        assert!(out.contains("bash_1"), "{out}");
        assert_eq!(processes.status("bash_1"), Some(UnitStatus::Running));
        assert!(processes.stop_process("bash_1"));
    }

    #[tokio::test]
    async fn missing_command_is_error_string() {
        let (tool, _) = shell(std::path::Path::new("/tmp"));
        let out = tool.execute("{}").await;
        assert!(out.starts_with("Error: invalid tool arguments"));
    }
}
