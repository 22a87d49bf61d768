//! Tools that poll and stop background units.
//!
//! | Tool | Registry | Default |
//! |------|----------|---------|
//! | `bash_output` | processes | non-blocking |
//! | `kill_bash` | processes | |
//! | `task_output` | tasks | blocking, 30s |
//! | `task_stop` | tasks | |
//!
//! All four go through [`background::retrieve`] and [`background::stop`], so
//! an unknown id is a normal "not found" result and a blocking wait that
//! runs out of time reports the unit as still running.

use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::ToolDef;
use crate::background::{self, BackgroundRegistry, RetrieveOptions, render_view};
use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::json_schema_for;
use crate::process::ProcessRegistry;
use crate::task::TaskRegistry;
use crate::tools::core::{Tool, ToolFuture, parse_tool_args};
use crate::tools::names;

/// Default blocking wait for retrieval tools.
pub const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on a caller-supplied blocking wait.
pub const MAX_RETRIEVE_TIMEOUT_MS: u64 = 600_000;

fn retrieve_options(block: bool, timeout_ms: Option<u64>, poll: Duration) -> RetrieveOptions {
    let timeout = timeout_ms
        .unwrap_or(DEFAULT_RETRIEVE_TIMEOUT_MS)
        .min(MAX_RETRIEVE_TIMEOUT_MS);
    let opts = if block {
        RetrieveOptions::blocking(Duration::from_millis(timeout))
    } else {
        RetrieveOptions::now()
    };
    opts.with_poll_interval(poll)
}

// ── bash_output ────────────────────────────────────────────────────

/// Typed arguments for `bash_output`.
#[derive(Deserialize, JsonSchema)]
pub struct BashOutputArgs {
    /// Id returned by a background shell call (e.g. 'bash_1').
    pub bash_id: String,
    /// Wait for the process to finish before returning.
    #[serde(default)]
    pub block: bool,
    /// Maximum wait in milliseconds when blocking (default 30000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Only return output lines matching this regex.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Read output from a background process.
pub struct BashOutput {
    processes: Arc<ProcessRegistry>,
    poll_interval: Duration,
}

impl BashOutput {
    pub fn new(processes: Arc<ProcessRegistry>) -> Self {
        Self {
            processes,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Tool for BashOutput {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::BASH_OUTPUT,
            "Get output and status of a background shell command. Optionally block \
             until it finishes, and filter lines with a regex.",
            json_schema_for::<BashOutputArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let args: BashOutputArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let opts = retrieve_options(args.block, args.timeout_ms, self.poll_interval);
            let retrieved = background::retrieve(self.processes.as_ref(), &args.bash_id, opts).await;

            let Some(filter) = args.filter.as_deref() else {
                return retrieved.message;
            };
            match self.processes.probe(&args.bash_id) {
                Some(mut view) => {
                    view.output = self.processes.output(&args.bash_id, Some(filter));
                    render_view(&view)
                }
                None => retrieved.message,
            }
        })
    }
}

// ── kill_bash ──────────────────────────────────────────────────────

/// Typed arguments for `kill_bash`.
#[derive(Deserialize, JsonSchema)]
pub struct KillBashArgs {
    /// Id of the background process to stop.
    pub shell_id: String,
}

/// Stop a background process.
pub struct KillBash {
    processes: Arc<ProcessRegistry>,
}

impl KillBash {
    pub fn new(processes: Arc<ProcessRegistry>) -> Self {
        Self { processes }
    }
}

impl Tool for KillBash {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::KILL_BASH,
            "Terminate a running background shell command by id.",
            json_schema_for::<KillBashArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            match parse_tool_args::<KillBashArgs>(&arguments) {
                Ok(args) => background::stop(self.processes.as_ref(), &args.shell_id).1,
                Err(e) => e,
            }
        })
    }
}

// ── task_output ────────────────────────────────────────────────────

/// Typed arguments for `task_output`.
#[derive(Deserialize, JsonSchema)]
pub struct TaskOutputArgs {
    /// Id returned when the background task was started (e.g. 'task_1').
    pub task_id: String,
    /// Wait for the task to finish before returning (default true).
    #[serde(default = "default_true")]
    pub block: bool,
    /// Maximum wait in milliseconds when blocking (default 30000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Read output from a background sub-agent task.
pub struct TaskOutput {
    tasks: Arc<TaskRegistry>,
    poll_interval: Duration,
}

impl TaskOutput {
    pub fn new(tasks: Arc<TaskRegistry>) -> Self {
        Self {
            tasks,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Tool for TaskOutput {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::TASK_OUTPUT,
            "Get output and status of a background sub-agent task, waiting for it \
             to finish by default.",
            json_schema_for::<TaskOutputArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let args: TaskOutputArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let opts = retrieve_options(args.block, args.timeout_ms, self.poll_interval);
            background::retrieve(self.tasks.as_ref(), &args.task_id, opts)
                .await
                .message
        })
    }
}

// ── task_stop ──────────────────────────────────────────────────────

/// Typed arguments for `task_stop`.
#[derive(Deserialize, JsonSchema)]
pub struct TaskStopArgs {
    /// Id of the background task to abort.
    pub task_id: String,
}

/// Abort a background sub-agent task.
pub struct TaskStop {
    tasks: Arc<TaskRegistry>,
}

impl TaskStop {
    pub fn new(tasks: Arc<TaskRegistry>) -> Self {
        Self { tasks }
    }
}

impl Tool for TaskStop {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::TASK_STOP,
            "Abort a running background sub-agent task by id.",
            json_schema_for::<TaskStopArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            match parse_tool_args::<TaskStopArgs>(&arguments) {
                Ok(args) => background::stop(self.tasks.as_ref(), &args.task_id).1,
                Err(e) => e,
            }
        })
    }
}
