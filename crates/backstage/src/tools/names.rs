//! Canonical tool name constants.
//!
//! All tool-name string literals should reference these constants to avoid
//! scattered magic strings.

pub const SHELL: &str = "shell";
pub const BASH_OUTPUT: &str = "bash_output";
pub const KILL_BASH: &str = "kill_bash";
pub const TASK_OUTPUT: &str = "task_output";
pub const TASK_STOP: &str = "task_stop";
pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
