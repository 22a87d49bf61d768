//! Stale-read detection for parallel writers.
//!
//! Records a SHA-256 digest of a file every time an agent reads it. Before
//! applying an edit, a write tool asks [`FileConflictTracker::has_changed`]
//! whether the file moved on since that agent last looked. The check is
//! advisory: nothing is locked and writes are never refused.
//!
//! Records are keyed by `(agent_id, path)`, so agents never see each
//! other's baselines. Unreadable files hash to the empty string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// Last known digest of one file for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file bytes, or `""` if unreadable.
    pub hash: String,
    pub read_at: DateTime<Utc>,
    pub agent_id: String,
}

type Key = (String, PathBuf);

/// Per-agent map of path → content digest.
///
/// Shared via `Arc<FileConflictTracker>` between the file tools.
#[derive(Debug, Default)]
pub struct FileConflictTracker {
    entries: Mutex<HashMap<Key, FileState>>,
}

impl FileConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, FileState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(agent_id: &str, path: &Path) -> Key {
        (agent_id.to_string(), path.to_path_buf())
    }

    fn store(&self, agent_id: &str, path: &Path, hash: String) -> FileState {
        let state = FileState {
            path: path.to_path_buf(),
            hash,
            read_at: Utc::now(),
            agent_id: agent_id.to_string(),
        };
        self.entries()
            .insert(Self::key(agent_id, path), state.clone());
        state
    }

    /// Record the current digest of `path` as `agent_id`'s baseline.
    pub async fn record_read(&self, agent_id: &str, path: &Path) -> FileState {
        let state = self.store(agent_id, path, hash_file(path).await);
        trace!("[{agent_id}] recorded read of {}", path.display());
        state
    }

    /// Record `bytes`, the content the agent actually saw, as its baseline
    /// for `path`.
    pub fn record_read_bytes(&self, agent_id: &str, path: &Path, bytes: &[u8]) -> FileState {
        let state = self.store(agent_id, path, hex_digest(bytes));
        trace!("[{agent_id}] recorded read of {}", path.display());
        state
    }

    /// Whether `path` differs from `agent_id`'s last recorded digest.
    ///
    /// A path the agent never read is reported unchanged.
    pub async fn has_changed(&self, agent_id: &str, path: &Path) -> bool {
        let Some(recorded) = self.get(agent_id, path) else {
            return false;
        };
        let current = hash_file(path).await;
        let changed = current != recorded.hash;
        if changed {
            debug!("[{agent_id}] {} changed since last read", path.display());
        }
        changed
    }

    /// Refresh the baseline after `agent_id` wrote `path`.
    pub async fn record_write(&self, agent_id: &str, path: &Path) -> FileState {
        self.store(agent_id, path, hash_file(path).await)
    }

    /// The current record for `(agent_id, path)`.
    pub fn get(&self, agent_id: &str, path: &Path) -> Option<FileState> {
        self.entries().get(&Self::key(agent_id, path)).cloned()
    }

    /// Forget every record owned by `agent_id`. Returns how many were dropped.
    pub fn clear_agent(&self, agent_id: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(owner, _), _| owner != agent_id);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hex SHA-256 of a file's bytes, or `""` if it cannot be read.
pub async fn hash_file(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => hex_digest(&bytes),
        Err(e) => {
            trace!("Cannot hash {}: {e}", path.display());
            String::new()
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn external_change_is_detected_and_write_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one").unwrap();

        let tracker = FileConflictTracker::new();
        tracker.record_read("agent-1", &path).await;
        assert!(!tracker.has_changed("agent-1", &path).await);

        std::fs::write(&path, "two").unwrap();
        assert!(tracker.has_changed("agent-1", &path).await);

        tracker.record_write("agent-1", &path).await;
        assert!(!tracker.has_changed("agent-1", &path).await);
    }

    #[tokio::test]
    async fn never_read_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, "x").unwrap();
        let tracker = FileConflictTracker::new();
        assert!(!tracker.has_changed("agent-1", &path).await);
    }

    #[tokio::test]
    async fn agents_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        std::fs::write(&path, "x").unwrap();

        let tracker = FileConflictTracker::new();
        tracker.record_read("a", &path).await;
        std::fs::write(&path, "y").unwrap();
        tracker.record_read("b", &path).await;

        assert!(tracker.has_changed("a", &path).await);
        assert!(!tracker.has_changed("b", &path).await);
        assert_eq!(tracker.len(), 2);

        assert_eq!(tracker.clear_agent("a"), 1);
        assert!(tracker.get("a", &path).is_none());
        assert!(tracker.get("b", &path).is_some());
    }

    #[tokio::test]
    async fn unreadable_file_hashes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let tracker = FileConflictTracker::new();
        let state = tracker.record_read("a", &path).await;
        assert_eq!(state.hash, "");
        // Creating it afterwards counts as a change.
        std::fs::write(&path, "now here").unwrap();
        assert!(tracker.has_changed("a", &path).await);
    }

    #[tokio::test]
    async fn baseline_from_seen_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.txt");
        std::fs::write(&path, "newer").unwrap();

        let tracker = FileConflictTracker::new();
        // The agent saw an older version than what is on disk now.
        tracker.record_read_bytes("a", &path, b"older");
        assert!(tracker.has_changed("a", &path).await);

        tracker.record_read_bytes("a", &path, b"newer");
        assert!(!tracker.has_changed("a", &path).await);
    }

    #[tokio::test]
    async fn rereading_overwrites_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.txt");
        std::fs::write(&path, "1").unwrap();
        let tracker = FileConflictTracker::new();
        let first = tracker.record_read("a", &path).await;
        std::fs::write(&path, "2").unwrap();
        let second = tracker.record_read("a", &path).await;
        assert_ne!(first.hash, second.hash);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("a", &path).unwrap().hash, second.hash);
    }
}
