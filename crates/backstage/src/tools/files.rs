//! `read_file` and `write_file`, wired to the conflict tracker.
//!
//! Every successful read records a baseline for the calling agent. A write
//! first asks whether the file changed since that baseline; if so, the
//! write still happens but the result opens with a warning so the agent
//! can re-read and reconcile.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio::fs;

use crate::ToolDef;
use crate::config::{DEFAULT_MAX_LINE_CHARS, DEFAULT_MAX_OUTPUT_LINES};
use crate::json_schema_for;
use crate::overflow::OverflowStore;
use crate::tools::conflict::FileConflictTracker;
use crate::tools::core::{Tool, ToolFuture, parse_tool_args};
use crate::tools::names;
use crate::truncate::{Overflow, TruncateOptions, truncate_by_lines};

/// Agent id used when none is configured.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Resolve `rel` under `workdir`. Only plain relative paths are accepted:
/// no `..`, no root, no drive prefix.
fn resolve_path(workdir: &Path, rel: &str) -> Result<PathBuf, String> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(format!(
            "Error: absolute paths are not allowed ('{rel}'); use a path relative to the project root"
        ));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err("Error: path traversal not allowed".to_string());
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!(
                    "Error: absolute paths are not allowed ('{rel}'); use a path relative to the project root"
                ));
            }
        }
    }
    Ok(workdir.join(rel_path))
}

// ── ReadFile ───────────────────────────────────────────────────────

/// Typed arguments for `read_file`.
#[derive(Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the project root (e.g. 'src/main.rs').
    pub path: String,
}

/// Read a file and record it as the agent's baseline.
///
/// Long files are cut by lines, and over-long lines are clipped. With an
/// overflow store configured, the full content is spilled to disk.
pub struct ReadFile {
    workdir: PathBuf,
    agent_id: String,
    tracker: Arc<FileConflictTracker>,
    max_lines: usize,
    max_line_chars: usize,
    overflow: Option<OverflowStore>,
}

impl ReadFile {
    pub fn new(workdir: impl Into<PathBuf>, tracker: Arc<FileConflictTracker>) -> Self {
        Self {
            workdir: workdir.into(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            tracker,
            max_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_line_chars: DEFAULT_MAX_LINE_CHARS,
            overflow: None,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn limits(mut self, max_lines: usize, max_line_chars: usize) -> Self {
        self.max_lines = max_lines;
        self.max_line_chars = max_line_chars;
        self
    }

    pub fn overflow(mut self, store: Option<OverflowStore>) -> Self {
        self.overflow = store;
        self
    }
}

impl Tool for ReadFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::READ_FILE,
            "Read a file from the project. Long files are truncated; the notice \
             says where the full content was saved.",
            json_schema_for::<ReadFileArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let args: ReadFileArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let full_path = match resolve_path(&self.workdir, &args.path) {
                Ok(p) => p,
                Err(e) => return e,
            };

            if let Ok(meta) = fs::metadata(&full_path).await
                && meta.is_dir()
            {
                return format!("Error: '{}' is a directory, not a file.", args.path);
            }

            let bytes = match fs::read(&full_path).await {
                Ok(b) => b,
                Err(e) => return format!("Error reading '{}': {e}", full_path.display()),
            };
            self.tracker
                .record_read_bytes(&self.agent_id, &full_path, &bytes);
            let content = match String::from_utf8(bytes) {
                Ok(c) => c,
                Err(e) => {
                    return format!("Error reading '{}': {e}", full_path.display());
                }
            };

            let mut opts = TruncateOptions::head();
            if let Some(store) = &self.overflow {
                opts = opts.with_overflow(Overflow {
                    store,
                    working_dir: &self.workdir,
                    tool_name: Some(names::READ_FILE),
                });
            }
            truncate_by_lines(&content, self.max_lines, self.max_line_chars, &opts).content
        })
    }
}

// ── WriteFile ──────────────────────────────────────────────────────

/// Typed arguments for `write_file`.
#[derive(Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// File path relative to the project root.
    pub path: String,
    /// Complete new file content.
    pub content: String,
}

/// Write a file, warning when it changed since the agent last read it.
pub struct WriteFile {
    workdir: PathBuf,
    agent_id: String,
    tracker: Arc<FileConflictTracker>,
}

impl WriteFile {
    pub fn new(workdir: impl Into<PathBuf>, tracker: Arc<FileConflictTracker>) -> Self {
        Self {
            workdir: workdir.into(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            tracker,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }
}

impl Tool for WriteFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            names::WRITE_FILE,
            "Write a file in the project, creating parent directories as needed. \
             Replaces the whole file.",
            json_schema_for::<WriteFileArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let args: WriteFileArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let full_path = match resolve_path(&self.workdir, &args.path) {
                Ok(p) => p,
                Err(e) => return e,
            };

            let stale = self.tracker.has_changed(&self.agent_id, &full_path).await;

            if let Some(parent) = full_path.parent()
                && let Err(e) = fs::create_dir_all(parent).await
            {
                return format!("Error creating '{}': {e}", parent.display());
            }
            if let Err(e) = fs::write(&full_path, &args.content).await {
                return format!("Error writing '{}': {e}", full_path.display());
            }
            self.tracker.record_write(&self.agent_id, &full_path).await;

            let done = format!("Wrote {} bytes to {}", args.content.len(), args.path);
            if stale {
                format!(
                    "Warning: {} was modified since you last read it; those changes \
                     were overwritten.\n{done}",
                    args.path
                )
            } else {
                done
            }
        })
    }
}
