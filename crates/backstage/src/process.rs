//! Registry of background OS processes.
//!
//! Commands the agent chooses not to wait for are launched through the
//! user's shell and tracked here under sequential `bash_<n>` ids. Each entry
//! owns two append-only line buffers (stdout, stderr), a status, and, while
//! the process is alive, a kill handle.
//!
//! A monitor task per process waits for whichever comes first:
//!
//! - **exit**: code 0 → `completed`, anything else → `failed`;
//! - **stop**: the caller asked for termination → `failed`;
//! - **timeout**: the process outlived its budget → `failed`.
//!
//! Stop and timeout share one termination path: SIGTERM to the process
//! group, a short grace period, then SIGKILL.
//!
//! Completed and failed entries are kept until a caller stops them so their
//! output stays retrievable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::background::{BackgroundRegistry, UnitStatus, UnitView, not_found_message};
use crate::config::{DEFAULT_PROCESS_TIMEOUT_MS, RuntimeConfig};

/// How long a terminated process gets to exit before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for pipe readers to drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error recorded when a caller stops a running process.
pub const STOPPED_MESSAGE: &str = "Process stopped by user";

/// Per-spawn overrides.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory. Defaults to the current process's.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Timeout override. Defaults to the registry's.
    pub timeout: Option<Duration>,
    /// Mirror every captured line to this file.
    pub output_file: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }
}

/// Listing entry returned by [`ProcessRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub id: String,
    pub command: String,
    pub status: UnitStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

struct ProcessEntry {
    command: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
    status: UnitStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    output_file: Option<PathBuf>,
    /// Kill handle; present only while the process is alive.
    kill: Option<CancellationToken>,
}

impl ProcessEntry {
    /// Apply the single terminal transition. Later calls are ignored.
    fn finish(&mut self, status: UnitStatus, exit_code: Option<i32>, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.error = error;
        self.kill = None;
    }

    fn output(&self, filter: Option<&LineFilter>) -> String {
        let lines = self.stdout.iter().chain(self.stderr.iter());
        let kept: Vec<&str> = match filter {
            Some(f) => lines.filter(|l| f.matches(l)).map(String::as_str).collect(),
            None => lines.map(String::as_str).collect(),
        };
        kept.join("\n")
    }
}

type SharedEntry = Arc<Mutex<ProcessEntry>>;

fn lock(entry: &SharedEntry) -> MutexGuard<'_, ProcessEntry> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Line filter for [`ProcessRegistry::output`]: a regex, or a plain
/// substring when the pattern is not a valid regex.
enum LineFilter {
    Regex(Regex),
    Substring(String),
}

impl LineFilter {
    fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => LineFilter::Regex(re),
            Err(_) => LineFilter::Substring(pattern.to_string()),
        }
    }

    fn matches(&self, line: &str) -> bool {
        match self {
            LineFilter::Regex(re) => re.is_match(line),
            LineFilter::Substring(s) => line.contains(s.as_str()),
        }
    }
}

/// Tracks background OS processes by id.
///
/// Share it via `Arc<ProcessRegistry>`; every method takes `&self`.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, SharedEntry>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_timeout: Duration::from_millis(DEFAULT_PROCESS_TIMEOUT_MS),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new().with_timeout(config.process_timeout())
    }

    /// Set the default timeout applied to every spawn.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SharedEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: &str) -> Option<SharedEntry> {
        self.entries().get(id).cloned()
    }

    /// Allocate the next `bash_<n>` id.
    pub fn next_id(&self) -> String {
        format!("bash_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Launch `command` in the background with default options.
    ///
    /// Must be called from within a tokio runtime. Never blocks: the id is
    /// returned immediately, and a spawn failure is recorded as a `failed`
    /// entry rather than returned.
    pub fn spawn(&self, command: &str) -> String {
        self.spawn_with(command, SpawnOptions::default())
    }

    /// Launch `command` in the background with explicit options.
    pub fn spawn_with(&self, command: &str, opts: SpawnOptions) -> String {
        let id = self.next_id();
        let kill = CancellationToken::new();
        let entry = Arc::new(Mutex::new(ProcessEntry {
            command: command.to_string(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: UnitStatus::Running,
            exit_code: None,
            error: None,
            started_at: Utc::now(),
            output_file: opts.output_file.clone(),
            kill: Some(kill.clone()),
        }));
        self.entries().insert(id.clone(), Arc::clone(&entry));

        let (program, args) = shell_launcher(command);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("[{id}] failed to spawn `{command}`: {e}");
                lock(&entry).finish(
                    UnitStatus::Failed,
                    None,
                    Some(format!("Failed to spawn command: {e}")),
                );
                return id;
            }
        };
        info!("[{id}] started in background: {command}");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_lines(
                stdout,
                Arc::clone(&entry),
                Stream::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_lines(
                stderr,
                Arc::clone(&entry),
                Stream::Stderr,
            )));
        }

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        tokio::spawn(monitor(id.clone(), child, entry, kill, timeout, readers));
        id
    }

    /// Captured stdout followed by stderr, optionally filtered line by line.
    ///
    /// `filter` is a regex; an invalid pattern falls back to a substring
    /// match. Unknown ids yield the not-found message.
    pub fn output(&self, id: &str, filter: Option<&str>) -> String {
        let Some(entry) = self.get(id) else {
            return not_found_message(self.kind(), id);
        };
        let filter = filter.map(LineFilter::new);
        lock(&entry).output(filter.as_ref())
    }

    /// Terminate a running process and forget it.
    ///
    /// Returns `false` for unknown ids and for processes that already
    /// exited, including ones whose output is still being collected
    /// (those stay retrievable).
    pub fn stop_process(&self, id: &str) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get(id) else {
            return false;
        };
        let kill = {
            let e = lock(entry);
            if e.status.is_terminal() {
                return false;
            }
            e.kill.clone()
        };
        let Some(kill) = kill else {
            return false;
        };
        kill.cancel();
        entries.remove(id);
        info!("[{id}] stop requested");
        true
    }

    /// Summaries of every tracked process, oldest first.
    pub fn list(&self) -> Vec<ProcessSummary> {
        let mut out: Vec<ProcessSummary> = self
            .entries()
            .iter()
            .map(|(id, entry)| {
                let e = lock(entry);
                ProcessSummary {
                    id: id.clone(),
                    command: e.command.clone(),
                    status: e.status,
                    exit_code: e.exit_code,
                    started_at: e.started_at,
                }
            })
            .collect();
        out.sort_by_key(|s| id_number(&s.id));
        out
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundRegistry for ProcessRegistry {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn status(&self, id: &str) -> Option<UnitStatus> {
        self.get(id).map(|e| lock(&e).status)
    }

    fn probe(&self, id: &str) -> Option<UnitView> {
        let entry = self.get(id)?;
        let e = lock(&entry);
        Some(UnitView {
            status: e.status,
            output: e.output(None),
            exit_code: e.exit_code,
            error: e.error.clone(),
        })
    }

    fn stop(&self, id: &str) -> bool {
        self.stop_process(id)
    }
}

/// Program and arguments used to run `command` through a shell.
///
/// POSIX: the user's `$SHELL` when it exists, else `/bin/bash`, else `sh`.
/// Windows: PowerShell.
pub fn shell_launcher(command: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        return (
            "powershell.exe".to_string(),
            vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                command.to_string(),
            ],
        );
    }
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty() && Path::new(s).exists())
        .unwrap_or_else(|| {
            if Path::new("/bin/bash").exists() {
                "/bin/bash".to_string()
            } else {
                "sh".to_string()
            }
        });
    (shell, vec!["-c".to_string(), command.to_string()])
}

fn id_number(id: &str) -> u64 {
    id.rsplit('_')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Read `pipe` line by line into the entry's buffer for `stream`.
async fn capture_lines<R>(pipe: R, entry: SharedEntry, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let output_file = lock(&entry).output_file.clone();
    let mut mirror = match output_file {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Cannot open process output file {}: {e}", path.display());
                None
            }
        },
        None => None,
    };

    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        trace!("captured line: {line}");
        if let Some(file) = mirror.as_mut()
            && let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await
        {
            warn!("Process output mirror write failed: {e}");
            mirror = None;
        }
        let mut e = lock(&entry);
        match stream {
            Stream::Stdout => e.stdout.push(line),
            Stream::Stderr => e.stderr.push(line),
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped,
    TimedOut,
}

async fn monitor(
    id: String,
    mut child: Child,
    entry: SharedEntry,
    kill: CancellationToken,
    timeout: Duration,
    readers: Vec<JoinHandle<()>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = kill.cancelled() => Outcome::Stopped,
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
    };

    // Once the process has exited there is nothing left to stop, even
    // while the readers are still draining.
    if matches!(outcome, Outcome::Exited(_)) {
        lock(&entry).kill = None;
    }

    if matches!(outcome, Outcome::Stopped | Outcome::TimedOut) {
        terminate(&mut child).await;
    }
    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, futures::future::join_all(readers)).await;

    let mut e = lock(&entry);
    match outcome {
        Outcome::Exited(Ok(status)) => match status.code() {
            Some(0) => {
                info!("[{id}] completed");
                e.finish(UnitStatus::Completed, Some(0), None);
            }
            Some(code) => {
                info!("[{id}] exited with code {code}");
                e.finish(
                    UnitStatus::Failed,
                    Some(code),
                    Some(format!("Process exited with code {code}")),
                );
            }
            None => {
                info!("[{id}] terminated by signal");
                e.finish(
                    UnitStatus::Failed,
                    None,
                    Some("Process terminated by signal".to_string()),
                );
            }
        },
        Outcome::Exited(Err(err)) => {
            warn!("[{id}] wait failed: {err}");
            e.finish(
                UnitStatus::Failed,
                None,
                Some(format!("Failed to wait for process: {err}")),
            );
        }
        Outcome::Stopped => {
            e.finish(UnitStatus::Failed, None, Some(STOPPED_MESSAGE.to_string()));
        }
        Outcome::TimedOut => {
            info!("[{id}] timed out after {}ms", timeout.as_millis());
            e.finish(
                UnitStatus::Failed,
                None,
                Some(format!(
                    "Command timed out after {}ms and was terminated",
                    timeout.as_millis()
                )),
            );
        }
    }
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            // Leader is gone; make sure stragglers in the group follow.
            signal_group(pid, libc::SIGKILL);
            return;
        }
        signal_group(pid, libc::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        debug!("kill after termination signal failed: {e}");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group led by
    // `pid`, which was created with process_group(0) at spawn.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        debug!(
            "kill(-{pid}, {signal}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}
