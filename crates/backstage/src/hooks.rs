//! Stop hooks fired after every background task terminates.
//!
//! Two layers:
//!
//! 1. **[`StopHooks`]**: the trait the [`TaskRegistry`](crate::task::TaskRegistry)
//!    calls with a [`SubagentStop`] once per task, on success and failure
//!    alike. [`NoopHooks`] is the default.
//!
//! 2. **[`CommandStopHooks`]**: runs external shell commands configured in
//!    JSON, passing the stop event through environment variables.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Boxed future returned by [`StopHooks::on_subagent_stop`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Outcome of one background sub-agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentStop {
    pub subagent_type: String,
    pub subagent_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Receives every background task termination.
pub trait StopHooks: Send + Sync {
    fn on_subagent_stop<'a>(&'a self, event: &'a SubagentStop) -> HookFuture<'a>;
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl StopHooks for NoopHooks {
    fn on_subagent_stop<'a>(&'a self, _event: &'a SubagentStop) -> HookFuture<'a> {
        Box::pin(async {})
    }
}

// ── StopHookConfig ─────────────────────────────────────────────────

/// External stop hook commands, loadable from JSON.
///
/// # Example JSON
///
/// ```json
/// {
///   "subagent_stop": [
///     { "command": "notify-send \"$BACKSTAGE_SUBAGENT_ID done\"" },
///     { "command": "./on-review.sh", "matcher": "review" }
///   ]
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StopHookConfig {
    #[serde(default)]
    pub subagent_stop: Vec<StopHookEntry>,
}

/// A shell command with an optional sub-agent type matcher.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StopHookEntry {
    pub command: String,
    /// When set, the hook fires only for sub-agent types containing this
    /// string.
    #[serde(default)]
    pub matcher: Option<String>,
}

// ── CommandStopHooks ───────────────────────────────────────────────

/// Runs external commands when a background task stops.
///
/// Commands run through `sh -c` and receive:
/// - `BACKSTAGE_HOOK_EVENT`: always `subagent_stop`
/// - `BACKSTAGE_SUBAGENT_TYPE`, `BACKSTAGE_SUBAGENT_ID`
/// - `BACKSTAGE_SUBAGENT_SUCCESS`: `true` or `false`
/// - `BACKSTAGE_SUBAGENT_ERROR`, `BACKSTAGE_AGENT_ID`,
///   `BACKSTAGE_CONVERSATION_ID`: empty when absent
///
/// Exit codes are ignored. Failures to launch are logged. A command still
/// running after the hook timeout is killed.
pub struct CommandStopHooks {
    config: StopHookConfig,
    workdir: PathBuf,
    timeout: Duration,
}

/// Default per-command limit for stop hooks.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

impl CommandStopHooks {
    pub fn new(config: StopHookConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Per-command time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load hook config from a JSON file. A missing or unparsable file
    /// yields a runner with no hooks.
    pub fn load(path: impl AsRef<Path>, workdir: impl Into<PathBuf>) -> Self {
        let config = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse stop hooks config: {e}");
                StopHookConfig::default()
            }),
            Err(_) => StopHookConfig::default(),
        };
        Self::new(config, workdir)
    }

    pub fn len(&self) -> usize {
        self.config.subagent_stop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.config.subagent_stop.is_empty()
    }

    fn matches(entry: &StopHookEntry, subagent_type: &str) -> bool {
        match &entry.matcher {
            Some(m) => subagent_type.contains(m.as_str()),
            None => true,
        }
    }

    async fn run(&self, command: &str, event: &SubagentStop) {
        let success = event.success.to_string();
        let env_vars = [
            ("BACKSTAGE_HOOK_EVENT", "subagent_stop"),
            ("BACKSTAGE_SUBAGENT_TYPE", event.subagent_type.as_str()),
            ("BACKSTAGE_SUBAGENT_ID", event.subagent_id.as_str()),
            ("BACKSTAGE_SUBAGENT_SUCCESS", success.as_str()),
            ("BACKSTAGE_SUBAGENT_ERROR", event.error.as_deref().unwrap_or("")),
            ("BACKSTAGE_AGENT_ID", event.agent_id.as_deref().unwrap_or("")),
            (
                "BACKSTAGE_CONVERSATION_ID",
                event.conversation_id.as_deref().unwrap_or(""),
            ),
        ];

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, val) in env_vars {
            cmd.env(key, val);
        }

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => debug!(
                "stop hook `{command}` exited with {:?}",
                output.status.code()
            ),
            Ok(Err(e)) => warn!("subagent_stop hook failed: {e}"),
            Err(_) => warn!(
                "stop hook `{command}` killed after {}ms",
                self.timeout.as_millis()
            ),
        }
    }
}

impl StopHooks for CommandStopHooks {
    fn on_subagent_stop<'a>(&'a self, event: &'a SubagentStop) -> HookFuture<'a> {
        Box::pin(async move {
            for entry in &self.config.subagent_stop {
                if Self::matches(entry, &event.subagent_type) {
                    self.run(&entry.command, event).await;
                }
            }
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn event(success: bool) -> SubagentStop {
        SubagentStop {
            subagent_type: "code-review".into(),
            subagent_id: "subagent-1".into(),
            success,
            error: (!success).then(|| "boom".to_string()),
            agent_id: Some("agent-7".into()),
            conversation_id: None,
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let hooks = CommandStopHooks::load("/nonexistent/hooks.json", "/tmp");
        assert!(hooks.is_empty());
    }

    #[test]
    fn load_parses_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.json");
        std::fs::write(
            &path,
            r#"{"subagent_stop": [{"command": "true"}, {"command": "false", "matcher": "review"}]}"#,
        )
        .unwrap();
        let hooks = CommandStopHooks::load(&path, dir.path());
        assert_eq!(hooks.len(), 2);
    }

    #[test]
    fn matcher_filters_by_type() {
        let entry = StopHookEntry {
            command: "true".into(),
            matcher: Some("review".into()),
        };
        assert!(CommandStopHooks::matches(&entry, "code-review"));
        assert!(!CommandStopHooks::matches(&entry, "explore"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let config = StopHookConfig {
            subagent_stop: vec![StopHookEntry {
                command: format!(
                    "echo \"$BACKSTAGE_SUBAGENT_ID $BACKSTAGE_SUBAGENT_SUCCESS $BACKSTAGE_SUBAGENT_ERROR\" > {}",
                    out.display()
                ),
                matcher: None,
            }],
        };
        let hooks = CommandStopHooks::new(config, dir.path());
        hooks.on_subagent_stop(&event(false)).await;
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "subagent-1 false boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_command_is_cut_off() {
        let config = StopHookConfig {
            subagent_stop: vec![StopHookEntry {
                command: "sleep 30".into(),
                matcher: None,
            }],
        };
        let hooks = CommandStopHooks::new(config, std::env::temp_dir())
            .with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();
        hooks.on_subagent_stop(&event(true)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn noop_hooks_complete() {
        NoopHooks.on_subagent_stop(&event(true)).await;
    }
}
