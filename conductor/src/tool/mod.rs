//! Tool contract and registration for agent tools.
//!
//! A *tool provider* is a value exposing one or more callable tools. Each
//! tool carries its argument names, a JSON-schema description of its
//! signature and an async callable that takes keyword-style arguments and
//! returns a string. Providers register their tools under the public name
//! `ProviderName.tool_name`; agents keep one registry per instance, built
//! once at construction and read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub mod schema;

/// Keyword-style arguments passed to a tool call.
pub type ToolArgs = Map<String, Value>;

/// A type alias for `Result<T, ToolError>`.
pub type ToolResult<T> = Result<T, ToolError>;

/// Error type for tool registration and execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool is not in the registry.
    #[error("tool '{0}' not found in registry")]
    NotFound(String),

    /// Two tools were registered under the same name.
    #[error("duplicate tool name '{0}'")]
    Duplicate(String),

    /// The arguments did not match the tool's signature.
    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments {
        /// Name of the tool.
        tool: String,
        /// What was wrong with the arguments.
        message: String,
    },

    /// The tool ran but failed.
    #[error("tool '{tool}' failed: {message}")]
    Execution {
        /// Name of the tool.
        tool: String,
        /// The underlying failure.
        message: String,
    },
}

impl ToolError {
    /// Create an invalid-arguments error.
    #[must_use]
    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an execution error.
    #[must_use]
    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Identity of a registered tool.
///
/// `name` is the full public name, `ProviderName.tool_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMeta {
    /// Full public name of the tool.
    pub name: String,
    /// Documentation shown to the model.
    pub docs: String,
}

impl ToolMeta {
    /// Create a new tool identity.
    #[must_use]
    pub fn new(name: impl Into<String>, docs: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: docs.into(),
        }
    }

    /// Build the full name from a provider and a tool name.
    #[must_use]
    pub fn qualified(provider: &str, tool: &str) -> String {
        format!("{provider}.{tool}")
    }
}

/// Schema description of a tool, in the function-calling wire format.
///
/// Serializes to:
/// ```json
/// {"type": "function", "function": {"name": ..., "description": ..., "parameters": {...}}}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    /// Full public name of the tool.
    pub name: String,
    /// Description of what the tool does.
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Function {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            parameters: Value,
        }

        #[derive(Deserialize)]
        struct Outer {
            function: Function,
        }

        let outer = Outer::deserialize(deserializer)?;
        Ok(Self {
            name: outer.function.name,
            description: outer.function.description,
            parameters: outer.function.parameters,
        })
    }
}

/// The contract every agent tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Identity of the tool (full name plus docs).
    fn meta(&self) -> &ToolMeta;

    /// Argument names, in declaration order. Used by the tool aligner.
    fn arg_names(&self) -> Vec<String>;

    /// JSON schema of the parameters object.
    fn parameters(&self) -> Value;

    /// Execute the tool with keyword-style arguments.
    async fn call(&self, args: &ToolArgs) -> ToolResult<String>;

    /// The wire-format definition of this tool.
    fn definition(&self) -> ToolDefinition {
        let meta = self.meta();
        ToolDefinition::new(meta.name.clone(), meta.docs.clone(), self.parameters())
    }
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.meta().name).finish()
    }
}

/// A shareable dynamic tool.
pub type SharedTool = Arc<dyn Tool>;

/// A value exposing one or more tools.
///
/// Providers hand out their tools as an enumerable list; registration walks
/// that list and indexes each tool by its full name.
pub trait ToolProvider: Send + Sync {
    /// Name used as the prefix of every tool this provider exposes.
    fn provider_name(&self) -> &str;

    /// Enumerate the provider's tools.
    fn tools(&self) -> Vec<SharedTool>;
}

/// Per-agent tool registry, keyed by full tool name.
///
/// A `BTreeMap` keeps enumeration deterministic.
pub type ToolRegistry = BTreeMap<String, SharedTool>;

/// Register every tool of `provider` into `registry`, rejecting duplicates.
pub fn register_provider(
    registry: &mut ToolRegistry,
    provider: &dyn ToolProvider,
) -> ToolResult<Vec<SharedTool>> {
    let tools = provider.tools();
    for tool in &tools {
        let name = tool.meta().name.clone();
        if registry.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        tracing::debug!(tool = %name, provider = %provider.provider_name(), "tool registered");
        registry.insert(name, Arc::clone(tool));
    }
    Ok(tools)
}

/// Fetch a required string argument.
pub fn require_str(args: &ToolArgs, key: &str, tool: &str) -> ToolResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ToolError::invalid_arguments(tool, format!("missing string '{key}'")))
}

/// Fetch an optional string argument, falling back to `default`.
#[must_use]
pub fn optional_str(args: &ToolArgs, key: &str, default: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .map_or_else(|| default.to_owned(), str::to_owned)
}

/// Fetch an optional boolean argument.
#[must_use]
pub fn optional_bool(args: &ToolArgs, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Fetch an optional number argument.
#[must_use]
pub fn optional_f64(args: &ToolArgs, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64)
}

/// Fetch an optional list-of-strings argument.
#[must_use]
pub fn optional_str_list(args: &ToolArgs, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Build the parameters object for a list of `(name, schema, required)`
/// entries, mirroring the function-calling layout.
#[must_use]
pub fn parameters_object(entries: &[(&str, Value, bool)]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, schema, is_required) in entries {
        properties.insert((*name).to_owned(), schema.clone());
        if *is_required {
            required.push(Value::String((*name).to_owned()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
