//! On-disk spill area for truncated tool output.
//!
//! When a tool result is truncated, the full content is written here and
//! the model gets a path it can read later. Files live under a per-project
//! directory derived deterministically from the working directory:
//!
//! ```text
//! <home>/.letta/projects/<sanitized cwd>/agent-tools/<tool>-<uuid>.txt
//! ```
//!
//! Filenames carry a random UUID, so concurrent writers never collide.
//! [`OverflowStore::cleanup`] is the only operation that enumerates the
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};

/// Summary of an overflow directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowStats {
    pub dir: PathBuf,
    pub exists: bool,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Writes, sweeps, and reports on overflow files.
#[derive(Debug, Clone)]
pub struct OverflowStore {
    home: PathBuf,
}

impl OverflowStore {
    /// Create a store rooted at `home` (normally the user's home directory).
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Create a store from config, resolving the home directory.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        config
            .resolved_home()
            .map(Self::new)
            .ok_or(RuntimeError::NoHomeDir)
    }

    /// Overflow directory for `working_dir`.
    pub fn dir_for(&self, working_dir: &Path) -> PathBuf {
        self.home
            .join(".letta")
            .join("projects")
            .join(sanitize_cwd(working_dir))
            .join("agent-tools")
    }

    /// Write `content` to a fresh file and return its absolute path.
    pub fn write(
        &self,
        content: &str,
        working_dir: &Path,
        tool_name: Option<&str>,
    ) -> Result<PathBuf> {
        let dir = self.dir_for(working_dir);
        fs::create_dir_all(&dir).map_err(|e| RuntimeError::io(&dir, e))?;

        let id = uuid::Uuid::new_v4();
        let filename = match tool_name {
            Some(name) if !name.is_empty() => format!("{}-{id}.txt", name.to_lowercase()),
            _ => format!("{id}.txt"),
        };
        let path = dir.join(filename);
        fs::write(&path, content).map_err(|e| RuntimeError::io(&path, e))?;
        debug!("Wrote {} bytes of overflow to {}", content.len(), path.display());
        Ok(path)
    }

    /// Delete regular files older than `max_age` by modification time.
    ///
    /// Returns the number of files removed. A missing directory yields 0.
    /// Subdirectories are skipped and the directory itself is never removed.
    pub fn cleanup(&self, working_dir: &Path, max_age: Duration) -> usize {
        let dir = self.dir_for(working_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read overflow dir {}: {e}", dir.display());
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove overflow file {}: {e}", path.display()),
            }
        }
        if removed > 0 {
            info!("Removed {removed} overflow file(s) from {}", dir.display());
        }
        removed
    }

    /// Report existence, file count, and total size of the overflow dir.
    pub fn stats(&self, working_dir: &Path) -> OverflowStats {
        let dir = self.dir_for(working_dir);
        let mut stats = OverflowStats {
            dir: dir.clone(),
            exists: false,
            file_count: 0,
            total_bytes: 0,
        };
        let Ok(entries) = fs::read_dir(&dir) else {
            return stats;
        };
        stats.exists = true;
        for meta in entries.flatten().filter_map(|e| e.metadata().ok()) {
            if meta.is_file() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
        stats
    }
}

/// Turn a working directory into a single path segment.
///
/// Strips one leading separator, then replaces separators and colons with
/// `_` and collapses each whitespace run into a single `_`.
pub fn sanitize_cwd(working_dir: &Path) -> String {
    let lossy = working_dir.to_string_lossy();
    let raw: &str = &lossy;
    let trimmed = raw.strip_prefix(['/', '\\']).unwrap_or(raw);

    let mut out = String::with_capacity(trimmed.len());
    let mut in_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        out.push(if matches!(c, '/' | '\\' | ':') { '_' } else { c });
    }
    out
}
