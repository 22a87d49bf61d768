//! Registry of background sub-agent tasks.
//!
//! A task is a whole nested agent run started without blocking the caller.
//! [`TaskRegistry::spawn`] allocates a `task_<n>` id and a correlated
//! sub-agent id, opens a transcript log, records the entry as running, and
//! hands the body a [`TaskContext`] carrying a cancellation token.
//!
//! When the body finishes the registry makes the single terminal transition
//! and then notifies three collaborators with the same outcome, whichever
//! way it went:
//!
//! - [`SubagentState`]: external bookkeeping for sub-agents;
//! - [`StopHooks`]: user-configured reactions;
//! - [`MessageQueue`]: receives a `<task-notification>` for the parent agent.
//!
//! Cancellation is cooperative. [`TaskRegistry::stop_task`] fires the token and
//! marks the task failed immediately; the body is expected to notice at its
//! next await point.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::background::{BackgroundRegistry, UnitStatus, UnitView};
use crate::config::{DEFAULT_LINK_POLL_INTERVAL_MS, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::hooks::{NoopHooks, StopHooks, SubagentStop};

/// Error recorded when a caller stops a running task.
pub const ABORTED_MESSAGE: &str = "Aborted by user";

// ── Collaborators ──────────────────────────────────────────────────

/// Sent to [`SubagentState::register`] when a task starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentRegistration {
    pub subagent_id: String,
    pub subagent_type: String,
    pub description: String,
    pub tool_call_id: Option<String>,
    pub background: bool,
}

/// Sent to [`SubagentState::complete`] when a task terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentCompletion {
    pub subagent_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub total_tokens: Option<u64>,
}

/// External sub-agent bookkeeping.
pub trait SubagentState: Send + Sync {
    fn register(&self, registration: &SubagentRegistration);

    fn complete(&self, completion: &SubagentCompletion);

    /// URL assigned once the sub-agent becomes addressable.
    fn agent_url(&self, _subagent_id: &str) -> Option<String> {
        None
    }
}

/// Receives one human-readable notification per finished task.
pub trait MessageQueue: Send + Sync {
    fn enqueue(&self, message: String);
}

/// Everything [`InMemorySubagentState`] knows about one sub-agent.
#[derive(Debug, Clone, Default)]
pub struct SubagentRecord {
    pub registration: Option<SubagentRegistration>,
    pub completion: Option<SubagentCompletion>,
    pub agent_url: Option<String>,
}

/// [`SubagentState`] kept in a map.
#[derive(Debug, Default)]
pub struct InMemorySubagentState {
    records: Mutex<HashMap<String, SubagentRecord>>,
}

impl InMemorySubagentState {
    fn records(&self) -> MutexGuard<'_, HashMap<String, SubagentRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, subagent_id: &str) -> Option<SubagentRecord> {
        self.records().get(subagent_id).cloned()
    }

    /// Mark a sub-agent as addressable.
    pub fn set_agent_url(&self, subagent_id: &str, url: impl Into<String>) {
        self.records()
            .entry(subagent_id.to_string())
            .or_default()
            .agent_url = Some(url.into());
    }
}

impl SubagentState for InMemorySubagentState {
    fn register(&self, registration: &SubagentRegistration) {
        self.records()
            .entry(registration.subagent_id.clone())
            .or_default()
            .registration = Some(registration.clone());
    }

    fn complete(&self, completion: &SubagentCompletion) {
        self.records()
            .entry(completion.subagent_id.clone())
            .or_default()
            .completion = Some(completion.clone());
    }

    fn agent_url(&self, subagent_id: &str) -> Option<String> {
        self.records()
            .get(subagent_id)
            .and_then(|r| r.agent_url.clone())
    }
}

/// [`MessageQueue`] that buffers messages until drained.
#[derive(Debug, Default)]
pub struct QueuedMessages {
    messages: Mutex<Vec<String>>,
}

impl QueuedMessages {
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl MessageQueue for QueuedMessages {
    fn enqueue(&self, message: String) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

// ── Task types ─────────────────────────────────────────────────────

/// What a sub-agent body returns on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubagentOutcome {
    /// Final report, appended to the task output.
    pub report: String,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub total_tokens: Option<u64>,
}

impl SubagentOutcome {
    pub fn new(report: impl Into<String>) -> Self {
        Self {
            report: report.into(),
            ..Self::default()
        }
    }
}

/// Describes a task to spawn.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub description: String,
    pub subagent_type: String,
    /// Tool call that launched the task, if any.
    pub tool_call_id: Option<String>,
    /// Whether [`TaskRegistry::stop_task`] can abort it. Default: `true`.
    pub cancellable: bool,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, subagent_type: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            subagent_type: subagent_type.into(),
            tool_call_id: None,
            cancellable: true,
        }
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }
}

/// Returned by [`TaskRegistry::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedTask {
    pub task_id: String,
    pub subagent_id: String,
    pub output_file: PathBuf,
}

/// Listing entry returned by [`TaskRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub subagent_id: String,
    pub description: String,
    pub subagent_type: String,
    pub status: UnitStatus,
    pub started_at: DateTime<Utc>,
}

struct TaskEntry {
    subagent_id: String,
    description: String,
    subagent_type: String,
    status: UnitStatus,
    output: Vec<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    output_file: PathBuf,
    cancel: Option<CancellationToken>,
}

type SharedTask = Arc<Mutex<TaskEntry>>;

fn lock(entry: &SharedTask) -> MutexGuard<'_, TaskEntry> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle passed to a running task body.
pub struct TaskContext {
    pub task_id: String,
    pub subagent_id: String,
    cancel: CancellationToken,
    entry: SharedTask,
}

impl TaskContext {
    /// Token that fires when the task is stopped.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task is stopped.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Append a progress line to the task's output and transcript.
    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        let path = {
            let mut e = lock(&self.entry);
            if e.status.is_terminal() {
                return;
            }
            e.output.push(line.clone());
            e.output_file.clone()
        };
        append_log(&path, &format!("{line}\n")).await;
    }
}

// ── TaskRegistry ───────────────────────────────────────────────────

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Tracks background sub-agent tasks by id.
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, SharedTask>>,
    next_id: AtomicU64,
    output_dir: PathBuf,
    state: Arc<dyn SubagentState>,
    queue: Arc<dyn MessageQueue>,
    hooks: Arc<dyn StopHooks>,
    subagent_ids: IdGenerator,
    link_poll_interval: Duration,
}

impl TaskRegistry {
    /// Create a registry writing transcripts under `output_dir`, with
    /// in-memory collaborators and no stop hooks.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            output_dir: output_dir.into(),
            state: Arc::new(InMemorySubagentState::default()),
            queue: Arc::new(QueuedMessages::default()),
            hooks: Arc::new(NoopHooks),
            subagent_ids: Arc::new(|| format!("subagent-{}", uuid::Uuid::new_v4())),
            link_poll_interval: Duration::from_millis(DEFAULT_LINK_POLL_INTERVAL_MS),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.resolved_task_output_dir())
            .with_link_poll_interval(config.link_poll_interval())
    }

    pub fn with_state(mut self, state: Arc<dyn SubagentState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StopHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the sub-agent id generator.
    pub fn with_id_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.subagent_ids = Arc::new(generator);
        self
    }

    pub fn with_link_poll_interval(mut self, interval: Duration) -> Self {
        self.link_poll_interval = interval;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SharedTask>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: &str) -> Option<SharedTask> {
        self.entries().get(id).cloned()
    }

    /// Allocate the next `task_<n>` id.
    pub fn next_id(&self) -> String {
        format!("task_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Start `body` in the background.
    ///
    /// Must be called from within a tokio runtime. Fails only if the
    /// transcript file cannot be created.
    pub fn spawn<F, Fut>(
        &self,
        description: impl Into<String>,
        subagent_type: impl Into<String>,
        body: F,
    ) -> Result<SpawnedTask>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = anyhow::Result<SubagentOutcome>> + Send + 'static,
    {
        self.spawn_with(TaskSpec::new(description, subagent_type), body)
    }

    /// Start `body` in the background with explicit options.
    pub fn spawn_with<F, Fut>(&self, spec: TaskSpec, body: F) -> Result<SpawnedTask>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = anyhow::Result<SubagentOutcome>> + Send + 'static,
    {
        let output_file = self.create_transcript(&spec)?;
        let task_id = self.next_id();
        let subagent_id = (self.subagent_ids)();

        let cancel = CancellationToken::new();
        let entry = Arc::new(Mutex::new(TaskEntry {
            subagent_id: subagent_id.clone(),
            description: spec.description.clone(),
            subagent_type: spec.subagent_type.clone(),
            status: UnitStatus::Running,
            output: Vec::new(),
            error: None,
            started_at: Utc::now(),
            output_file: output_file.clone(),
            cancel: spec.cancellable.then(|| cancel.clone()),
        }));
        self.entries().insert(task_id.clone(), Arc::clone(&entry));

        self.state.register(&SubagentRegistration {
            subagent_id: subagent_id.clone(),
            subagent_type: spec.subagent_type.clone(),
            description: spec.description.clone(),
            tool_call_id: spec.tool_call_id.clone(),
            background: true,
        });
        info!("[{task_id}] started {} task: {}", spec.subagent_type, spec.description);

        let ctx = TaskContext {
            task_id: task_id.clone(),
            subagent_id: subagent_id.clone(),
            cancel,
            entry: Arc::clone(&entry),
        };
        let run = body(ctx);
        let finisher = Finisher {
            task_id: task_id.clone(),
            subagent_id: subagent_id.clone(),
            spec,
            entry,
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
            hooks: Arc::clone(&self.hooks),
        };
        tokio::spawn(async move {
            // Run the body as its own task so a panic becomes a failure.
            let result = match tokio::spawn(run).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Task panicked: {e}")),
            };
            finisher.finish(result).await;
        });

        Ok(SpawnedTask {
            task_id,
            subagent_id,
            output_file,
        })
    }

    /// Create a fresh transcript file and write its header. The name is
    /// random so registries sharing a directory never collide, and the
    /// file is opened with `create_new` so an existing one is never
    /// truncated.
    fn create_transcript(&self, spec: &TaskSpec) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| RuntimeError::io(&self.output_dir, e))?;
        let output_file = self
            .output_dir
            .join(format!("task-{}.log", uuid::Uuid::new_v4()));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&output_file)
            .map_err(|e| RuntimeError::io(&output_file, e))?;
        let header = format!(
            "[Task started: {}]\n[subagent_type: {}]\n\n",
            spec.description, spec.subagent_type
        );
        file.write_all(header.as_bytes())
            .map_err(|e| RuntimeError::io(&output_file, e))?;
        Ok(output_file)
    }

    /// Abort a running task.
    ///
    /// Fires the cancellation token and marks the task failed without
    /// waiting for the body to unwind. Returns `false` for unknown,
    /// finished, or non-cancellable tasks. The entry is kept.
    pub fn stop_task(&self, id: &str) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let mut e = lock(&entry);
        if e.status.is_terminal() {
            return false;
        }
        let Some(cancel) = e.cancel.take() else {
            return false;
        };
        cancel.cancel();
        e.status = UnitStatus::Failed;
        e.error = Some(ABORTED_MESSAGE.to_string());
        info!("[{id}] aborted");
        true
    }

    /// Wait until the sub-agent's URL is assigned, polling the state
    /// collaborator. Returns `false` if `timeout` elapses first.
    pub async fn wait_for_link_established(&self, subagent_id: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.state.agent_url(subagent_id).is_some() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!("Link for {subagent_id} not established after {}ms", elapsed.as_millis());
                return false;
            }
            tokio::time::sleep(self.link_poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Transcript path of a task.
    pub fn output_file(&self, id: &str) -> Option<PathBuf> {
        self.get(id).map(|e| lock(&e).output_file.clone())
    }

    /// Forget a task. Does not stop it.
    pub fn remove(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Forget every task.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Summaries of every tracked task, oldest first.
    pub fn list(&self) -> Vec<TaskSummary> {
        let mut out: Vec<TaskSummary> = self
            .entries()
            .iter()
            .map(|(id, entry)| {
                let e = lock(entry);
                TaskSummary {
                    id: id.clone(),
                    subagent_id: e.subagent_id.clone(),
                    description: e.description.clone(),
                    subagent_type: e.subagent_type.clone(),
                    status: e.status,
                    started_at: e.started_at,
                }
            })
            .collect();
        out.sort_by_key(|s| s.id.rsplit('_').next().and_then(|n| n.parse::<u64>().ok()));
        out
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackgroundRegistry for TaskRegistry {
    fn kind(&self) -> &'static str {
        "task"
    }

    fn status(&self, id: &str) -> Option<UnitStatus> {
        self.get(id).map(|e| lock(&e).status)
    }

    fn probe(&self, id: &str) -> Option<UnitView> {
        let entry = self.get(id)?;
        let e = lock(&entry);
        Some(UnitView {
            status: e.status,
            output: e.output.join("\n"),
            exit_code: None,
            error: e.error.clone(),
        })
    }

    fn stop(&self, id: &str) -> bool {
        self.stop_task(id)
    }
}

// ── Completion ─────────────────────────────────────────────────────

/// Everything the completion path needs, moved into the spawned task.
struct Finisher {
    task_id: String,
    subagent_id: String,
    spec: TaskSpec,
    entry: SharedTask,
    state: Arc<dyn SubagentState>,
    queue: Arc<dyn MessageQueue>,
    hooks: Arc<dyn StopHooks>,
}

impl Finisher {
    async fn finish(self, result: anyhow::Result<SubagentOutcome>) {
        let task_id = &self.task_id;

        // The terminal transition happens here unless `stop` already made it.
        let (status, error, output_file) = {
            let mut e = lock(&self.entry);
            if e.status == UnitStatus::Running {
                match &result {
                    Ok(outcome) => {
                        e.output.push(outcome.report.clone());
                        e.status = UnitStatus::Completed;
                    }
                    Err(err) => {
                        e.error = Some(format!("{err:#}"));
                        e.status = UnitStatus::Failed;
                    }
                }
                e.cancel = None;
            }
            (e.status, e.error.clone(), e.output_file.clone())
        };

        let outcome = result.ok().filter(|_| status == UnitStatus::Completed);
        let transcript = match (&outcome, &error) {
            (Some(o), _) => format!("{}\n\n[Task completed]\n", o.report),
            (None, err) => format!(
                "[error] {}\n\n[Task failed]\n",
                err.as_deref().unwrap_or("unknown error")
            ),
        };
        append_log(&output_file, &transcript).await;

        match status {
            UnitStatus::Completed => info!("[{task_id}] completed"),
            _ => info!(
                "[{task_id}] failed: {}",
                error.as_deref().unwrap_or("unknown error")
            ),
        }

        let success = outcome.is_some();
        let completion = SubagentCompletion {
            subagent_id: self.subagent_id.clone(),
            success,
            error: if success { None } else { error.clone() },
            agent_id: outcome.as_ref().and_then(|o| o.agent_id.clone()),
            conversation_id: outcome.as_ref().and_then(|o| o.conversation_id.clone()),
            total_tokens: outcome.as_ref().and_then(|o| o.total_tokens),
        };
        self.state.complete(&completion);

        self.queue.enqueue(task_notification(
            task_id,
            &self.spec.description,
            &completion,
            outcome.as_ref().map(|o| o.report.as_str()),
            &output_file,
        ));

        let stop = SubagentStop {
            subagent_type: self.spec.subagent_type.clone(),
            subagent_id: self.subagent_id.clone(),
            success,
            error: completion.error.clone(),
            agent_id: completion.agent_id.clone(),
            conversation_id: completion.conversation_id.clone(),
        };
        self.hooks.on_subagent_stop(&stop).await;
    }
}

/// Message sent to the parent agent when a background task finishes.
pub fn task_notification(
    task_id: &str,
    description: &str,
    completion: &SubagentCompletion,
    report: Option<&str>,
    output_file: &Path,
) -> String {
    let status = if completion.success {
        "completed"
    } else {
        "failed"
    };
    let mut msg = format!(
        "<task-notification>\n<task-id>{task_id}</task-id>\n<status>{status}</status>\n<summary>Agent \"{description}\" {status}</summary>\n"
    );
    match (report, completion.error.as_deref()) {
        (Some(report), _) => msg.push_str(&format!("<result>{report}</result>\n")),
        (None, Some(err)) => msg.push_str(&format!("<error>{err}</error>\n")),
        (None, None) => {}
    }
    if let Some(tokens) = completion.total_tokens {
        msg.push_str(&format!("<usage>total_tokens: {tokens}</usage>\n"));
    }
    msg.push_str(&format!(
        "<output-file>{}</output-file>\n</task-notification>",
        output_file.display()
    ));
    msg
}

async fn append_log(path: &Path, text: &str) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    match file {
        Ok(mut f) => {
            if let Err(e) = f.write_all(text.as_bytes()).await {
                warn!("Failed to append to task log {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Cannot open task log {}: {e}", path.display()),
    }
}
