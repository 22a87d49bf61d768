//! Tool abstraction and snapshot-aware dispatch.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static API definition (name, description, JSON schema) and an async
//! `execute` method. Tools are collected into an immutable [`ToolSet`].
//!
//! [`ToolRegistry`] holds the *live* set in a single mutable slot. Every
//! mutation builds a new set and swaps the slot, so a set handed out earlier
//! is never changed underneath its holder. [`ToolRegistry::capture`] records
//! the current set under an opaque context id; calls that carry that id
//! resolve strictly against the captured set, even after the live set has
//! been swapped for a different tool dialect.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::ToolDef;
use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::overflow::OverflowStore;
use crate::truncate::{Overflow, TruncateOptions, truncate_by_chars};

/// Boxed future returned by [`Tool::execute`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that an LLM agent can invoke via function-calling.
///
/// Implementors provide:
/// - A static definition ([`Tool::definition`]) describing the tool's name,
///   description, and JSON Schema parameters for the LLM.
/// - An async [`Tool::execute`] method that receives the raw JSON arguments
///   string and returns a result string.
pub trait Tool: Send + Sync {
    /// The tool definition sent to the LLM API.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given raw JSON arguments string.
    ///
    /// Errors are returned as `"Error: ..."` strings rather than panics;
    /// the caller passes the string back to the model either way.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    /// The tool's name (convenience, delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// An immutable name → implementation map.
///
/// Builder methods consume and return the set; cloning is cheap because
/// implementations are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn with(self, tool: impl Tool + 'static) -> Self {
        self.with_arc(Arc::new(tool))
    }

    /// Add a shared tool.
    pub fn with_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name(), tool);
        self
    }

    /// Conditionally add a tool.
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Drop a tool by name.
    pub fn without(mut self, name: &str) -> Self {
        self.tools.remove(name);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// All tool definitions for the LLM API, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── OutputPolicy ───────────────────────────────────────────────────

/// How [`ToolRegistry::execute`] bounds tool results.
#[derive(Debug, Clone)]
pub struct OutputPolicy {
    pub max_chars: usize,
    pub middle: bool,
    /// Spill target; `None` disables overflow.
    pub overflow: Option<OverflowStore>,
    /// Project directory the overflow path is derived from.
    pub working_dir: PathBuf,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            max_chars: crate::config::DEFAULT_MAX_OUTPUT_CHARS,
            middle: true,
            overflow: None,
            working_dir: PathBuf::from("."),
        }
    }
}

impl OutputPolicy {
    /// Policy from config. Overflow is disabled when no home directory can
    /// be resolved.
    pub fn from_config(config: &RuntimeConfig, working_dir: impl Into<PathBuf>) -> Self {
        let overflow = if config.overflow_enabled {
            OverflowStore::from_config(config).ok()
        } else {
            None
        };
        Self {
            max_chars: config.max_output_chars,
            middle: config.middle_truncation,
            overflow,
            working_dir: working_dir.into(),
        }
    }

    /// Apply the policy to `output` produced by `tool_name`.
    pub fn apply(&self, output: &str, tool_name: &str) -> String {
        let mut opts = if self.middle {
            TruncateOptions::middle()
        } else {
            TruncateOptions::head()
        };
        if let Some(store) = &self.overflow {
            opts = opts.with_overflow(Overflow {
                store,
                working_dir: &self.working_dir,
                tool_name: Some(tool_name),
            });
        }
        truncate_by_chars(output, self.max_chars, &opts).content
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// Live tool set plus captured execution-context snapshots.
///
/// Share it via `Arc<ToolRegistry>`; every method takes `&self`.
pub struct ToolRegistry {
    live: RwLock<Arc<ToolSet>>,
    snapshots: Mutex<HashMap<String, Arc<ToolSet>>>,
    validate_args: bool,
    timeout: Option<Duration>,
    output: OutputPolicy,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("live", &self.live_set().names())
            .field("snapshots", &self.snapshot_count())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(tools: ToolSet) -> Self {
        Self {
            live: RwLock::new(Arc::new(tools)),
            snapshots: Mutex::new(HashMap::new()),
            validate_args: false,
            timeout: None,
            output: OutputPolicy::default(),
        }
    }

    /// Enable JSON Schema argument validation before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Per-call timeout. `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_policy(mut self, policy: OutputPolicy) -> Self {
        self.output = policy;
        self
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<String, Arc<ToolSet>>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The current live set.
    pub fn live_set(&self) -> Arc<ToolSet> {
        Arc::clone(&self.live.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Copy-on-write update of the live set.
    fn update(&self, f: impl FnOnce(ToolSet) -> ToolSet) {
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        let next = f(ToolSet::clone(&live));
        *live = Arc::new(next);
    }

    /// Swap the whole live set.
    pub fn replace(&self, tools: ToolSet) {
        info!("Replacing live tool set ({} tools)", tools.len());
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(tools);
    }

    /// Add or replace one tool in the live set.
    pub fn register(&self, tool: impl Tool + 'static) {
        self.update(|set| set.with(tool));
    }

    /// Remove one tool from the live set. Returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        self.update(|set| {
            removed = set.contains(name);
            set.without(name)
        });
        removed
    }

    /// Freeze the live set and return an opaque context id for it.
    pub fn capture(&self) -> String {
        let id = format!("ctx-{}", uuid::Uuid::new_v4());
        let set = self.live_set();
        debug!("Captured execution context {id} ({} tools)", set.len());
        self.snapshots().insert(id.clone(), set);
        id
    }

    /// The frozen set for a context id.
    pub fn snapshot(&self, context_id: &str) -> Option<Arc<ToolSet>> {
        self.snapshots().get(context_id).cloned()
    }

    /// Drop a captured context. Returns whether it existed.
    pub fn release(&self, context_id: &str) -> bool {
        self.snapshots().remove(context_id).is_some()
    }

    /// Drop every captured context.
    pub fn clear_snapshots(&self) {
        self.snapshots().clear();
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots().len()
    }

    /// Resolve `name` against the captured context if one is given,
    /// otherwise against the live set.
    pub fn resolve(
        &self,
        name: &str,
        context_id: Option<&str>,
    ) -> Result<Arc<dyn Tool>, ResolveError> {
        let set = match context_id {
            Some(id) => self.snapshot(id).ok_or_else(|| ResolveError::ContextNotFound {
                id: id.to_string(),
            })?,
            None => self.live_set(),
        };
        set.get(name).ok_or_else(|| ResolveError::ToolNotFound {
            name: name.to_string(),
        })
    }

    /// Execute a tool call with resolution, optional validation, timeout,
    /// and output truncation.
    ///
    /// Always returns a string; resolution and validation failures are
    /// `"Error: ..."` results.
    pub async fn execute(&self, name: &str, arguments: &str, context_id: Option<&str>) -> String {
        let tool = match self.resolve(name, context_id) {
            Ok(t) => t,
            Err(e) => return format!("Error: {e}"),
        };

        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool.as_ref(), arguments)
        {
            return error;
        }

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();

        let result = if let Some(limit) = self.timeout {
            match tokio::time::timeout(limit, tool.execute(arguments)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s",
                        start.elapsed().as_secs_f64()
                    );
                    format!(
                        "Error: tool '{name}' timed out after {:.0} seconds.",
                        limit.as_secs_f64()
                    )
                }
            }
        } else {
            tool.execute(arguments).await
        };

        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            result.len()
        );
        trace!(
            "Tool {name} result preview: {}",
            result.chars().take(300).collect::<String>()
        );

        self.output.apply(&result, name)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// Returns `None` if valid, or `Some(error_string)` if validation fails.
/// The error string is formatted for the LLM to understand and self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "Error: invalid JSON arguments for tool '{}': {e}.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Parse raw JSON arguments into a typed struct.
///
/// Returns a formatted error string suitable for returning directly from
/// [`Tool::execute`].
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "Error: invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    impl Tool for EchoTool {
        fn definition(&self) -> ToolDef {
            ToolDef::new(
                "echo",
                "Echo the input",
                serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            )
        }

        fn execute(&self, arguments: &str) -> ToolFuture<'_> {
            let args: serde_json::Value = serde_json::from_str(arguments).unwrap_or_default();
            let result = args
                .get("text")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| "Error: no text".into());
            Box::pin(async move { result })
        }
    }

    /// Same name as another tool, different behaviour: models a dialect swap.
    struct NamedTool {
        name: &'static str,
        reply: &'static str,
    }

    impl Tool for NamedTool {
        fn definition(&self) -> ToolDef {
            ToolDef::new(
                self.name,
                "Replies with a constant",
                serde_json::json!({"type": "object", "properties": {}}),
            )
        }

        fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
            Box::pin(async move { self.reply.to_string() })
        }
    }

    struct BigTool;

    impl Tool for BigTool {
        fn definition(&self) -> ToolDef {
            ToolDef::new(
                "big",
                "Returns a big result",
                serde_json::json!({"type": "object", "properties": {}}),
            )
        }

        fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
            Box::pin(async { format!("{}{}", "a".repeat(100), "z".repeat(100)) })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn definition(&self) -> ToolDef {
            ToolDef::new("slow", "Sleeps", serde_json::json!({"type": "object"}))
        }

        fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late".to_string()
            })
        }
    }

    #[test]
    fn toolset_is_a_value() {
        let a = ToolSet::new().with(EchoTool);
        let b = a.clone().without("echo");
        assert!(a.contains("echo"));
        assert!(!b.contains("echo"));
        assert_eq!(a.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn with_if_respects_condition() {
        assert_eq!(ToolSet::new().with_if(false, EchoTool).len(), 0);
        assert_eq!(ToolSet::new().with_if(true, EchoTool).len(), 1);
    }

    #[test]
    fn snapshot_survives_live_removal() {
        let reg = ToolRegistry::new(ToolSet::new().with(EchoTool));
        let ctx = reg.capture();
        assert!(reg.remove("echo"));

        assert!(reg.resolve("echo", Some(&ctx)).is_ok());
        assert_eq!(
            reg.resolve("echo", None).err(),
            Some(ResolveError::ToolNotFound {
                name: "echo".into()
            })
        );
    }

    #[test]
    fn snapshot_ignores_later_additions() {
        let reg = ToolRegistry::new(ToolSet::new());
        let ctx = reg.capture();
        reg.register(EchoTool);
        assert!(reg.resolve("echo", None).is_ok());
        assert!(matches!(
            reg.resolve("echo", Some(&ctx)),
            Err(ResolveError::ToolNotFound { .. })
        ));
    }

    #[test]
    fn unknown_context_is_not_found() {
        let reg = ToolRegistry::new(ToolSet::new().with(EchoTool));
        assert!(matches!(
            reg.resolve("echo", Some("ctx-missing")),
            Err(ResolveError::ContextNotFound { .. })
        ));
        let ctx = reg.capture();
        assert!(reg.release(&ctx));
        assert!(!reg.release(&ctx));
        assert_eq!(reg.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn dialect_swap_keeps_in_flight_calls_on_old_impl() {
        let reg = ToolRegistry::new(ToolSet::new().with(NamedTool {
            name: "search",
            reply: "old",
        }));
        let ctx = reg.capture();
        reg.replace(ToolSet::new().with(NamedTool {
            name: "search",
            reply: "new",
        }));

        assert_eq!(reg.execute("search", "{}", Some(&ctx)).await, "old");
        assert_eq!(reg.execute("search", "{}", None).await, "new");
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_error_string() {
        let reg = ToolRegistry::new(ToolSet::new());
        let result = reg.execute("nope", "{}", None).await;
        assert_eq!(result, "Error: unknown tool 'nope'");
    }

    #[tokio::test]
    async fn execute_validates_arguments() {
        let reg = ToolRegistry::new(ToolSet::new().with(EchoTool)).with_arg_validation(true);
        let result = reg.execute("echo", r#"{"text": 5}"#, None).await;
        assert!(result.starts_with("Error: argument validation failed"));
        assert_eq!(reg.execute("echo", r#"{"text": "hi"}"#, None).await, "hi");
    }

    #[tokio::test]
    async fn execute_times_out() {
        let reg = ToolRegistry::new(ToolSet::new().with(SlowTool))
            .with_timeout(Some(Duration::from_millis(50)));
        let result = reg.execute("slow", "{}", None).await;
        assert!(result.contains("timed out"));
    }

    #[tokio::test]
    async fn execute_middle_truncates_with_overflow() {
        let home = tempfile::tempdir().unwrap();
        let policy = OutputPolicy {
            max_chars: 20,
            middle: true,
            overflow: Some(OverflowStore::new(home.path())),
            working_dir: PathBuf::from("/proj"),
        };
        let reg = ToolRegistry::new(ToolSet::new().with(BigTool)).with_output_policy(policy);
        let result = reg.execute("big", "{}", None).await;
        assert!(result.starts_with(&"a".repeat(10)));
        assert!(result.contains("characters omitted from the middle"));
        assert!(result.contains(&"z".repeat(10)));
        assert!(result.contains("[Full output saved to: "));

        let stats = OverflowStore::new(home.path()).stats(std::path::Path::new("/proj"));
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.total_bytes, 200);
    }

    #[test]
    fn parse_tool_args_reports_errors() {
        #[derive(serde::Deserialize)]
        struct Args {
            #[allow(dead_code)]
            id: String,
        }
        assert!(parse_tool_args::<Args>(r#"{"id": "x"}"#).is_ok());
        let err = parse_tool_args::<Args>("{}").err().unwrap();
        assert!(err.starts_with("Error: invalid tool arguments"));
    }
}
