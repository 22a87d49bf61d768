//! Error types for the runtime.
//!
//! Most runtime outcomes are *not* errors: an unknown background id, a
//! retrieval that times out, and a stopped task are all normal results.
//! [`RuntimeError`] covers the infrastructure failures a caller can
//! actually act on.

use std::path::PathBuf;

/// Infrastructure failure surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No home directory could be determined for the overflow store.
    #[error("could not determine a home directory for overflow storage")]
    NoHomeDir,

    /// A filesystem operation on `path` failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration file exists but could not be parsed.
    #[error("invalid config at {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RuntimeError {
    /// Wrap an [`std::io::Error`] with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Why a tool name did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown tool '{name}'")]
    ToolNotFound { name: String },

    #[error("unknown execution context '{id}'")]
    ContextNotFound { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path() {
        let err = RuntimeError::io(
            "/tmp/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/missing"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn resolve_errors_render() {
        let err = ResolveError::ToolNotFound {
            name: "grep".into(),
        };
        assert_eq!(err.to_string(), "unknown tool 'grep'");
        let err = ResolveError::ContextNotFound { id: "ctx-1".into() };
        assert_eq!(err.to_string(), "unknown execution context 'ctx-1'");
    }
}
