//! Tool abstractions and the agent-facing tools.
//!
//! Every agent capability is a [`Tool`] trait implementor. Tools are
//! collected into an immutable [`ToolSet`]; a [`ToolRegistry`] owns the live
//! set, captures execution-context snapshots, and dispatches calls with
//! validation, timeouts, and truncation.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`], [`ToolRegistry`], [`OutputPolicy`].
//! - [`conflict`]: [`FileConflictTracker`] for stale-read detection.
//! - [`shell`]: the `shell` tool, foreground or background.
//! - [`background`]: `bash_output`, `kill_bash`, `task_output`, `task_stop`.
//! - [`files`]: `read_file` and `write_file`.
//! - [`names`]: tool name constants.

pub mod background;
pub mod conflict;
pub mod core;
pub mod files;
pub mod names;
pub mod shell;

pub use background::{BashOutput, KillBash, TaskOutput, TaskStop};
pub use conflict::{FileConflictTracker, FileState};
pub use core::{
    OutputPolicy, Tool, ToolFuture, ToolRegistry, ToolSet, parse_tool_args,
    validate_tool_arguments,
};
pub use files::{ReadFile, WriteFile};
pub use shell::Shell;
