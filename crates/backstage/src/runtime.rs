//! One-stop wiring of registries and tools for a session.
//!
//! [`Runtime`] builds the shared process and task registries, the conflict
//! tracker, and a [`ToolRegistry`] preloaded with the standard tools, all
//! configured from a single [`RuntimeConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::RuntimeConfig;
use crate::overflow::OverflowStore;
use crate::process::ProcessRegistry;
use crate::task::TaskRegistry;
use crate::tools::{
    BashOutput, FileConflictTracker, KillBash, OutputPolicy, ReadFile, Shell, TaskOutput, TaskStop,
    ToolRegistry, ToolSet, WriteFile,
};

/// Shared state for one agent session.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub workdir: PathBuf,
    pub processes: Arc<ProcessRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub conflicts: Arc<FileConflictTracker>,
    pub tools: ToolRegistry,
}

impl Runtime {
    /// Build a runtime with registries derived from `config`.
    pub fn new(config: RuntimeConfig, workdir: impl Into<PathBuf>) -> Self {
        let tasks = Arc::new(TaskRegistry::from_config(&config));
        Self::with_tasks(config, workdir, tasks)
    }

    /// Build a runtime around a caller-configured task registry (custom
    /// sub-agent state, message queue, or stop hooks).
    pub fn with_tasks(
        config: RuntimeConfig,
        workdir: impl Into<PathBuf>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let workdir = workdir.into();
        let processes = Arc::new(ProcessRegistry::from_config(&config));
        let conflicts = Arc::new(FileConflictTracker::new());
        let set = standard_tools(&config, &workdir, &processes, &tasks, &conflicts);
        info!(
            "Runtime ready in {} with {} tools",
            workdir.display(),
            set.len()
        );
        let tools = ToolRegistry::new(set)
            .with_arg_validation(true)
            .with_timeout(config.tool_timeout())
            .with_output_policy(OutputPolicy::from_config(&config, workdir.clone()));
        Self {
            config,
            workdir,
            processes,
            tasks,
            conflicts,
            tools,
        }
    }

    /// Execute a tool call against the live set or a captured context.
    pub async fn call(&self, name: &str, arguments: &str, context_id: Option<&str>) -> String {
        self.tools.execute(name, arguments, context_id).await
    }

    /// Overflow store for this runtime, if overflow is enabled and a home
    /// directory resolves.
    pub fn overflow_store(&self) -> Option<OverflowStore> {
        if !self.config.overflow_enabled {
            return None;
        }
        OverflowStore::from_config(&self.config).ok()
    }
}

/// The standard tool set: shell, background retrieval and stop, file I/O.
pub fn standard_tools(
    config: &RuntimeConfig,
    workdir: &Path,
    processes: &Arc<ProcessRegistry>,
    tasks: &Arc<TaskRegistry>,
    conflicts: &Arc<FileConflictTracker>,
) -> ToolSet {
    let overflow = if config.overflow_enabled {
        OverflowStore::from_config(config).ok()
    } else {
        None
    };
    let poll = config.poll_interval();
    ToolSet::new()
        .with(Shell::new(workdir, Arc::clone(processes)).timeout(config.process_timeout()))
        .with(BashOutput::new(Arc::clone(processes)).poll_interval(poll))
        .with(KillBash::new(Arc::clone(processes)))
        .with(TaskOutput::new(Arc::clone(tasks)).poll_interval(poll))
        .with(TaskStop::new(Arc::clone(tasks)))
        .with(
            ReadFile::new(workdir, Arc::clone(conflicts))
                .limits(config.max_output_lines, config.max_line_chars)
                .overflow(overflow),
        )
        .with(WriteFile::new(workdir, Arc::clone(conflicts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::names;

    fn runtime(dir: &Path) -> Runtime {
        let config = RuntimeConfig::default()
            .with_home_dir(dir.join("home"))
            .with_task_output_dir(dir.join("tasks"));
        Runtime::new(config, dir)
    }

    #[test]
    fn standard_tools_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        let names = rt.tools.live_set().names();
        for expected in [
            names::BASH_OUTPUT,
            names::KILL_BASH,
            names::READ_FILE,
            names::SHELL,
            names::TASK_OUTPUT,
            names::TASK_STOP,
            names::WRITE_FILE,
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn call_validates_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        let out = rt.call(names::KILL_BASH, "{}", None).await;
        assert!(out.starts_with("Error: argument validation failed"), "{out}");
    }

    #[test]
    fn overflow_store_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(runtime(dir.path()).overflow_store().is_some());
        let rt = Runtime::new(RuntimeConfig::default().with_overflow(false), dir.path());
        assert!(rt.overflow_store().is_none());
    }
}
