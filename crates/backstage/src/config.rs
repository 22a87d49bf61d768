//! Runtime configuration with sensible defaults.
//!
//! [`RuntimeConfig`] captures every tunable the runtime reads: inline output
//! limits, overflow behaviour, background timeouts, and polling cadence.
//! All fields have defaults, so a config file only needs the keys it
//! overrides.
//!
//! # Example JSON
//!
//! ```json
//! {
//!   "max_output_chars": 20000,
//!   "process_timeout_ms": 120000,
//!   "overflow_enabled": false
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RuntimeError};

/// Default inline character limit for tool output.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;

/// Default line limit for line-mode truncation.
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 2_000;

/// Default per-line character cap in line-mode truncation.
pub const DEFAULT_MAX_LINE_CHARS: usize = 2_000;

/// Default overflow sweep age: seven days.
pub const DEFAULT_OVERFLOW_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Default background process timeout: ten minutes.
pub const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 600_000;

/// Default blocking-retrieval poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default sub-agent link poll interval.
pub const DEFAULT_LINK_POLL_INTERVAL_MS: u64 = 100;

/// Tunables for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Inline character limit for tool results. Default: 30 000.
    pub max_output_chars: usize,
    /// Line limit for line-mode truncation. Default: 2 000.
    pub max_output_lines: usize,
    /// Per-line character cap in line mode. Default: 2 000.
    pub max_line_chars: usize,
    /// Keep head and tail instead of only the head. Default: `true`.
    pub middle_truncation: bool,
    /// Spill truncated content to disk. Default: `true`.
    pub overflow_enabled: bool,
    /// Age threshold for overflow cleanup. Default: seven days.
    pub overflow_max_age_ms: u64,
    /// Root under which `.letta/projects/...` lives. Default: the user's home.
    pub home_dir: Option<PathBuf>,
    /// Background process timeout. Default: ten minutes.
    pub process_timeout_ms: u64,
    /// Blocking retrieval poll interval. Default: 50ms.
    pub poll_interval_ms: u64,
    /// Sub-agent link poll interval. Default: 100ms.
    pub link_poll_interval_ms: u64,
    /// Directory for background task logs. Default: `<tmp>/backstage-tasks`.
    pub task_output_dir: Option<PathBuf>,
    /// Timeout for foreground tool calls. `None` disables it.
    pub tool_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_line_chars: DEFAULT_MAX_LINE_CHARS,
            middle_truncation: true,
            overflow_enabled: true,
            overflow_max_age_ms: DEFAULT_OVERFLOW_MAX_AGE_MS,
            home_dir: None,
            process_timeout_ms: DEFAULT_PROCESS_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            link_poll_interval_ms: DEFAULT_LINK_POLL_INTERVAL_MS,
            task_output_dir: None,
            tool_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Load config from a JSON file.
    ///
    /// A missing file yields the defaults. A file that exists but does not
    /// parse is an error, so a typo never silently reverts every setting.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                RuntimeError::Config {
                    path: path.to_path_buf(),
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(RuntimeError::io(path, e)),
        }
    }

    /// Like [`load`](Self::load), but logs and falls back to defaults on any
    /// error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Failed to load runtime config: {e}");
            Self::default()
        })
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    pub fn with_middle_truncation(mut self, enabled: bool) -> Self {
        self.middle_truncation = enabled;
        self
    }

    pub fn with_overflow(mut self, enabled: bool) -> Self {
        self.overflow_enabled = enabled;
        self
    }

    /// Override the home directory used for overflow storage.
    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home.into());
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_task_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_output_dir = Some(dir.into());
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Resolved home directory: the override, else the user's home.
    pub fn resolved_home(&self) -> Option<PathBuf> {
        self.home_dir.clone().or_else(dirs::home_dir)
    }

    /// Resolved background task log directory.
    pub fn resolved_task_output_dir(&self) -> PathBuf {
        self.task_output_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("backstage-tasks"))
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    /// Poll interval, clamped below 100ms so blocking retrieval stays
    /// responsive.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 99))
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms.max(1))
    }

    pub fn overflow_max_age(&self) -> Duration {
        Duration::from_millis(self.overflow_max_age_ms)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_output_chars, 30_000);
        assert!(config.middle_truncation);
        assert!(config.overflow_enabled);
        assert_eq!(config.process_timeout(), Duration::from_secs(600));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn poll_interval_is_clamped_below_100ms() {
        let config = RuntimeConfig::default().with_poll_interval(Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(99));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"max_output_chars": 500, "overflow_enabled": false}"#)
                .unwrap();
        assert_eq!(config.max_output_chars, 500);
        assert!(!config.overflow_enabled);
        assert_eq!(config.max_output_lines, DEFAULT_MAX_OUTPUT_LINES);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(config.max_output_chars, DEFAULT_MAX_OUTPUT_CHARS);
    }

    #[test]
    fn load_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RuntimeConfig::load(&path),
            Err(RuntimeError::Config { .. })
        ));
        // The lenient loader falls back instead.
        let config = RuntimeConfig::load_or_default(&path);
        assert!(config.overflow_enabled);
    }

    #[test]
    fn builder_setters() {
        let config = RuntimeConfig::default()
            .with_max_output_chars(10)
            .with_middle_truncation(false)
            .with_overflow(false)
            .with_home_dir("/tmp/home")
            .with_tool_timeout(Some(Duration::from_secs(5)));
        assert_eq!(config.max_output_chars, 10);
        assert!(!config.middle_truncation);
        assert_eq!(config.resolved_home(), Some(PathBuf::from("/tmp/home")));
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(5)));
    }
}
