//! Uniform retrieval and cancellation over background units.
//!
//! A *background unit* is anything started without blocking the caller: an
//! OS process in the [`ProcessRegistry`](crate::process::ProcessRegistry) or
//! a sub-agent run in the [`TaskRegistry`](crate::task::TaskRegistry). Both
//! implement [`BackgroundRegistry`], so callers poll and stop them through
//! the same [`retrieve`] / [`stop`] pair without caring which kind they hold.
//!
//! Retrieval never fails. An unknown id produces a "not found" message, and
//! a blocking wait that runs out of time returns whatever output exists with
//! status still [`UnitStatus::Running`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DEFAULT_POLL_INTERVAL_MS;

/// Lifecycle state of a background unit.
///
/// Transitions are one-way: `Running` → `Completed` | `Failed`. Timeouts
/// and explicit stops are both `Failed`, distinguished by the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UnitStatus::Running)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of a unit, as returned by [`BackgroundRegistry::probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitView {
    pub status: UnitStatus,
    /// Accumulated output in write order.
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// A store of background units addressable by id.
pub trait BackgroundRegistry: Send + Sync {
    /// Noun used in user-facing messages (`"process"`, `"task"`).
    fn kind(&self) -> &'static str;

    /// Current status, or `None` for an unknown id. Cheap; used for polling.
    fn status(&self, id: &str) -> Option<UnitStatus>;

    /// Full view including output, or `None` for an unknown id.
    fn probe(&self, id: &str) -> Option<UnitView>;

    /// Request termination. Returns whether anything was actually stopped.
    fn stop(&self, id: &str) -> bool;
}

/// Options for [`retrieve`].
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    /// Wait for a terminal status instead of returning immediately.
    pub block: bool,
    /// Upper bound on the wait when `block` is set.
    pub timeout: Duration,
    /// How often to re-check status while blocking.
    pub poll_interval: Duration,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            block: false,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl RetrieveOptions {
    /// Return immediately with the current state.
    pub fn now() -> Self {
        Self::default()
    }

    /// Block up to `timeout` for a terminal status.
    pub fn blocking(timeout: Duration) -> Self {
        Self {
            block: true,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of [`retrieve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    /// Human-readable message: output plus a status line, or a not-found
    /// notice.
    pub message: String,
    /// `None` when the id is unknown.
    pub status: Option<UnitStatus>,
}

/// Fetch a unit's output, optionally waiting for it to finish.
pub async fn retrieve<R>(registry: &R, id: &str, opts: RetrieveOptions) -> Retrieved
where
    R: BackgroundRegistry + ?Sized,
{
    let start = Instant::now();
    if opts.block {
        loop {
            match registry.status(id) {
                None => break,
                Some(status) if status.is_terminal() => break,
                Some(_) => {}
            }
            let elapsed = start.elapsed();
            if elapsed >= opts.timeout {
                debug!(
                    "Blocking retrieval of {} {id} timed out after {}ms",
                    registry.kind(),
                    elapsed.as_millis()
                );
                break;
            }
            tokio::time::sleep(opts.poll_interval.min(opts.timeout - elapsed)).await;
        }
    }

    match registry.probe(id) {
        Some(view) => Retrieved {
            message: render_view(&view),
            status: Some(view.status),
        },
        None => Retrieved {
            message: not_found_message(registry.kind(), id),
            status: None,
        },
    }
}

/// Stop a unit and describe the outcome.
pub fn stop<R>(registry: &R, id: &str) -> (bool, String)
where
    R: BackgroundRegistry + ?Sized,
{
    let kind = registry.kind();
    if registry.stop(id) {
        (true, format!("Stopped background {kind} {id}"))
    } else if registry.status(id).is_some() {
        (
            false,
            format!("Background {kind} {id} is not running; nothing to stop"),
        )
    } else {
        (false, not_found_message(kind, id))
    }
}

/// The fixed message for an id the registry does not hold.
pub fn not_found_message(kind: &str, id: &str) -> String {
    format!("No background {kind} found with ID: {id}")
}

/// Render output plus a status line.
pub fn render_view(view: &UnitView) -> String {
    let body = if view.output.trim().is_empty() {
        match view.status {
            UnitStatus::Running => "(no output yet)",
            _ => "(no output)",
        }
    } else {
        view.output.trim_end()
    };

    let status = match (view.status, view.exit_code, view.error.as_deref()) {
        (UnitStatus::Running, _, _) => "Status: still running".to_string(),
        (UnitStatus::Completed, Some(code), _) => format!("Status: completed (exit code {code})"),
        (UnitStatus::Completed, None, _) => "Status: completed".to_string(),
        (UnitStatus::Failed, _, Some(err)) => format!("Status: failed ({err})"),
        (UnitStatus::Failed, Some(code), None) => format!("Status: failed (exit code {code})"),
        (UnitStatus::Failed, None, None) => "Status: failed".to_string(),
    };
    format!("{body}\n\n{status}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Registry stub whose units never change unless a test mutates them.
    #[derive(Default)]
    struct FakeRegistry {
        units: Mutex<HashMap<String, UnitView>>,
    }

    impl FakeRegistry {
        fn insert(&self, id: &str, status: UnitStatus, output: &str) {
            self.units.lock().unwrap().insert(
                id.into(),
                UnitView {
                    status,
                    output: output.into(),
                    exit_code: None,
                    error: None,
                },
            );
        }
    }

    impl BackgroundRegistry for FakeRegistry {
        fn kind(&self) -> &'static str {
            "process"
        }

        fn status(&self, id: &str) -> Option<UnitStatus> {
            self.units.lock().unwrap().get(id).map(|u| u.status)
        }

        fn probe(&self, id: &str) -> Option<UnitView> {
            self.units.lock().unwrap().get(id).cloned()
        }

        fn stop(&self, id: &str) -> bool {
            self.units.lock().unwrap().remove(id).is_some()
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let reg = FakeRegistry::default();
        let out = retrieve(&reg, "bash_9", RetrieveOptions::now()).await;
        assert_eq!(out.status, None);
        assert_eq!(out.message, "No background process found with ID: bash_9");
    }

    #[tokio::test]
    async fn non_blocking_reports_running() {
        let reg = FakeRegistry::default();
        reg.insert("bash_1", UnitStatus::Running, "partial\n");
        let out = retrieve(&reg, "bash_1", RetrieveOptions::now()).await;
        assert_eq!(out.status, Some(UnitStatus::Running));
        assert!(out.message.starts_with("partial"));
        assert!(out.message.ends_with("Status: still running"));
    }

    #[tokio::test]
    async fn blocking_times_out_as_success() {
        let reg = FakeRegistry::default();
        reg.insert("bash_1", UnitStatus::Running, "");
        let start = std::time::Instant::now();
        let out = retrieve(
            &reg,
            "bash_1",
            RetrieveOptions::blocking(Duration::from_millis(300)),
        )
        .await;
        let elapsed = start.elapsed();
        assert_eq!(out.status, Some(UnitStatus::Running));
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
        assert!(out.message.contains("(no output yet)"));
    }

    #[tokio::test]
    async fn blocking_returns_early_on_terminal_status() {
        let reg = std::sync::Arc::new(FakeRegistry::default());
        reg.insert("task_1", UnitStatus::Running, "");
        let writer = std::sync::Arc::clone(&reg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.insert("task_1", UnitStatus::Completed, "done");
        });

        let start = std::time::Instant::now();
        let out = retrieve(
            reg.as_ref(),
            "task_1",
            RetrieveOptions::blocking(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(out.status, Some(UnitStatus::Completed));
        assert!(out.message.starts_with("done"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stop_messages() {
        let reg = FakeRegistry::default();
        reg.insert("bash_1", UnitStatus::Running, "");
        assert_eq!(
            stop(&reg, "bash_1"),
            (true, "Stopped background process bash_1".into())
        );
        let (killed, msg) = stop(&reg, "bash_1");
        assert!(!killed);
        assert!(msg.starts_with("No background process found"));
    }

    #[test]
    fn render_failed_with_error() {
        let view = UnitView {
            status: UnitStatus::Failed,
            output: "boom\n".into(),
            exit_code: Some(2),
            error: Some("Process exited with code 2".into()),
        };
        assert_eq!(
            render_view(&view),
            "boom\n\nStatus: failed (Process exited with code 2)"
        );
    }

    #[test]
    fn status_display_and_terminality() {
        assert_eq!(UnitStatus::Running.to_string(), "running");
        assert!(!UnitStatus::Running.is_terminal());
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
    }
}
