//! End-to-end scenarios across registries, retrieval, and dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backstage::background::{self, RetrieveOptions, UnitStatus};
use backstage::config::RuntimeConfig;
use backstage::error::ResolveError;
use backstage::process::ProcessRegistry;
use backstage::runtime::Runtime;
use backstage::task::{QueuedMessages, SubagentOutcome, TaskRegistry};
use backstage::tools::names;

#[cfg(unix)]
#[tokio::test]
async fn background_process_end_to_end() {
    let processes = ProcessRegistry::new();
    let id = processes.spawn("sleep 2 && echo done");

    let start = Instant::now();
    let first = background::retrieve(&processes, &id, RetrieveOptions::now()).await;
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(first.status, Some(UnitStatus::Running));
    assert!(first.message.ends_with("Status: still running"));

    let done = background::retrieve(
        &processes,
        &id,
        RetrieveOptions::blocking(Duration::from_millis(5000)),
    )
    .await;
    assert_eq!(done.status, Some(UnitStatus::Completed));
    assert!(done.message.contains("done"));
}

#[cfg(unix)]
#[tokio::test]
async fn blocking_retrieval_timeout_is_not_an_error() {
    let processes = ProcessRegistry::new();
    let id = processes.spawn("sleep 30");

    let start = Instant::now();
    let out = background::retrieve(
        &processes,
        &id,
        RetrieveOptions::blocking(Duration::from_millis(300)),
    )
    .await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
    assert_eq!(out.status, Some(UnitStatus::Running));

    let (killed, msg) = background::stop(&processes, &id);
    assert!(killed);
    assert_eq!(msg, format!("Stopped background process {id}"));
}

#[cfg(unix)]
#[tokio::test]
async fn stop_then_retrieve_is_not_found() {
    let processes = ProcessRegistry::new();
    let id = processes.spawn("sleep 30");
    let (killed, _) = background::stop(&processes, &id);
    assert!(killed);

    let out = background::retrieve(&processes, &id, RetrieveOptions::now()).await;
    assert_eq!(out.status, None);
    assert_eq!(out.message, format!("No background process found with ID: {id}"));
}

#[cfg(unix)]
#[tokio::test]
async fn shell_tool_background_then_bash_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig::default()
        .with_home_dir(dir.path().join("home"))
        .with_task_output_dir(dir.path().join("tasks"));
    let rt = Runtime::new(config, dir.path());

    let started = rt
        .call(
            names::SHELL,
            r#"{"command": "echo hello-from-bg", "run_in_background": true}"#,
            None,
        )
        .await;
    assert!(started.contains("bash_1"), "{started}");

    let out = rt
        .call(
            names::BASH_OUTPUT,
            r#"{"bash_id": "bash_1", "block": true, "timeout_ms": 5000}"#,
            None,
        )
        .await;
    assert!(out.starts_with("hello-from-bg"), "{out}");
    assert!(out.ends_with("Status: completed (exit code 0)"));
}

#[tokio::test]
async fn snapshot_isolation_across_tool_removal() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new(RuntimeConfig::default().with_overflow(false), dir.path());

    let ctx = rt.tools.capture();
    assert!(rt.tools.remove(names::TASK_STOP));

    assert!(rt.tools.resolve(names::TASK_STOP, Some(&ctx)).is_ok());
    assert_eq!(
        rt.tools.resolve(names::TASK_STOP, None).err(),
        Some(ResolveError::ToolNotFound {
            name: names::TASK_STOP.to_string()
        })
    );

    // The removed tool still executes for calls carrying the old context.
    let out = rt
        .call(names::TASK_STOP, r#"{"task_id": "task_9"}"#, Some(&ctx))
        .await;
    assert_eq!(out, "No background task found with ID: task_9");
    let out = rt
        .call(names::TASK_STOP, r#"{"task_id": "task_9"}"#, None)
        .await;
    assert_eq!(out, "Error: unknown tool 'task_stop'");
}

#[tokio::test]
async fn task_notifications_reach_queue() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(QueuedMessages::default());
    let tasks = Arc::new(TaskRegistry::new(dir.path()).with_queue(queue.clone()));
    let rt = Runtime::with_tasks(
        RuntimeConfig::default().with_overflow(false),
        dir.path(),
        Arc::clone(&tasks),
    );

    let spawned = tasks
        .spawn("Find callers", "explore", |ctx| async move {
            ctx.emit("scanning").await;
            Ok(SubagentOutcome::new("3 callers found"))
        })
        .unwrap();

    let args = serde_json::json!({"task_id": spawned.task_id, "timeout_ms": 5000}).to_string();
    let out = rt.call(names::TASK_OUTPUT, &args, None).await;
    assert!(out.starts_with("scanning\n3 callers found"), "{out}");

    let mut messages = Vec::new();
    for _ in 0..100 {
        messages = queue.drain();
        if !messages.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("<task-notification>"));
    assert!(messages[0].contains(&format!("<task-id>{}</task-id>", spawned.task_id)));
}

#[test]
fn sequential_ids_across_registries() {
    let processes = ProcessRegistry::new();
    let tasks = TaskRegistry::new(std::env::temp_dir());
    let p: Vec<String> = (0..3).map(|_| processes.next_id()).collect();
    let t: Vec<String> = (0..3).map(|_| tasks.next_id()).collect();
    assert_eq!(p, ["bash_1", "bash_2", "bash_3"]);
    assert_eq!(t, ["task_1", "task_2", "task_3"]);
}
