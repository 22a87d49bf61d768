//! Tool-execution runtime for agentic coding CLIs.
//!
//! `backstage` sits between a model-driven agent and the local machine. It
//! runs tool calls, keeps their output bounded, and tracks the work the
//! agent chose not to wait for.
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Define and dispatch tools:** see the [`Tool`](tools::core::Tool)
//!   trait, [`ToolSet`](tools::core::ToolSet), and
//!   [`ToolRegistry`](tools::core::ToolRegistry). Capture an execution
//!   context with [`ToolRegistry::capture`](tools::core::ToolRegistry::capture)
//!   before swapping the live set so in-flight calls keep resolving.
//!
//! - **Run commands in the background:** see
//!   [`ProcessRegistry`](process::ProcessRegistry), or the `shell` tool with
//!   `run_in_background`.
//!
//! - **Run sub-agents in the background:** see
//!   [`TaskRegistry`](task::TaskRegistry) and its collaborator traits
//!   [`SubagentState`](task::SubagentState),
//!   [`MessageQueue`](task::MessageQueue), and
//!   [`StopHooks`](hooks::StopHooks).
//!
//! - **Poll or stop either kind of background unit:**
//!   [`background::retrieve`] and [`background::stop`].
//!
//! - **Bound tool output:** [`truncate`] for the pure functions,
//!   [`overflow`] for spilling the full content to disk.
//!
//! - **Warn about stale reads:**
//!   [`FileConflictTracker`](tools::conflict::FileConflictTracker).
//!
//! - **Wire it all up at once:** [`Runtime`](runtime::Runtime).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`truncate`] | Character, line, and array truncation with head or head+tail policy |
//! | [`overflow`] | Per-project spill directory with age-based cleanup |
//! | [`process`] | Background OS processes (`bash_<n>`) |
//! | [`task`] | Background sub-agent tasks (`task_<n>`) |
//! | [`background`] | Uniform blocking retrieval and stop over both registries |
//! | [`tools`] | Tool trait, snapshot-aware registry, conflict tracker, built-in tools |
//! | [`hooks`] | Stop hooks run after every background task |
//! | [`config`] | [`RuntimeConfig`](config::RuntimeConfig) |
//! | [`error`] | [`RuntimeError`](error::RuntimeError), [`ResolveError`](error::ResolveError) |

pub mod background;
pub mod config;
pub mod error;
pub mod hooks;
pub mod overflow;
pub mod process;
pub mod runtime;
pub mod task;
pub mod tools;
pub mod truncate;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use config::RuntimeConfig;
pub use error::{ResolveError, Result, RuntimeError};
pub use runtime::Runtime;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types
/// and the `serde_json::Value` that the function-calling API expects.
///
/// # Example
///
/// ```
/// use backstage::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct OutputArgs {
///     bash_id: String,
///     #[serde(default)]
///     filter: Option<String>,
/// }
///
/// let schema = json_schema_for::<OutputArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"bash_id".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_def_serializes_as_function() {
        let def = ToolDef::new("shell", "Run a command", serde_json::json!({"type": "object"}));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "shell");
        assert_eq!(json["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn schema_marks_optional_fields() {
        #[derive(Deserialize, JsonSchema)]
        #[allow(dead_code)]
        struct Args {
            task_id: String,
            #[serde(default)]
            block: bool,
        }
        let schema = json_schema_for::<Args>();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&"task_id".into()));
        assert!(!required.contains(&"block".into()));
    }
}
