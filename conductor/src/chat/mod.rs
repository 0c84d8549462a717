//! Chat types, the per-LLM adapter trait and the induced tool-call protocol.
//!
//! A [`ChatModel`] wraps exactly one LLM. Tools bound to the adapter are
//! either passed through the backend's native tool-calling parameter or,
//! for backends without one, *induced*: a synthetic system message teaches
//! the model to emit `{"tool_calls": [...]}` in its content, which
//! [`parse_tool_calls`] recovers with lenient JSON repair.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::json_utils;
use crate::tool::{ToolArgs, ToolDefinition};

pub mod mock;
pub mod ollama;

/// A type alias for `Result<T, LlmError>`.
pub type LlmResult<T> = Result<T, LlmError>;

/// Error type for chat-model invocations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network or connection failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status from the backend.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The backend returned something that could not be understood.
    #[error("expected {expected}, got {got}")]
    ResponseFormat {
        /// Expected shape.
        expected: String,
        /// What actually arrived.
        got: String,
    },

    /// Internal adapter error.
    #[error("{0}")]
    Internal(String),
}

impl LlmError {
    /// Create a response-format error.
    #[must_use]
    pub fn response_format(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ResponseFormat {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Role of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Input from the caller.
    User,
    /// Output from the model.
    Assistant,
    /// A tool's response.
    Tool,
}

impl Role {
    /// String form of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single tool invocation requested by the model.
///
/// Immutable: the aligner produces a fresh value instead of editing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Full name of the tool to invoke.
    pub name: String,
    /// Keyword-style arguments.
    pub args: ToolArgs,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// A role-annotated message exchanged with a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls carried by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Name of the tool a tool-response message answers for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    /// Create an assistant message that carries tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_name: None,
        }
    }

    /// Create a tool-response message.
    #[must_use]
    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// Normalized response from a chat model. Single-use.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Role reported by the backend, when present.
    pub role: Option<String>,
    /// Text content, when present.
    pub content: Option<String>,
    /// Tool calls requested by the model; empty when none.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    /// Create a plain assistant text response.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant.as_str().to_owned()),
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Create a response that only requests tool calls.
    #[must_use]
    pub fn from_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Some(Role::Assistant.as_str().to_owned()),
            content: None,
            tool_calls,
        }
    }

    /// Whether the model asked for tools to run.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Abstraction over one LLM backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Name of the underlying model, used in logs.
    fn name(&self) -> &str;

    /// Bind tool definitions to the adapter. Appends; safe to call more
    /// than once.
    fn bind_tools(&mut self, tools: Vec<ToolDefinition>);

    /// The definitions currently bound.
    fn bound_tools(&self) -> Vec<ToolDefinition>;

    /// Send the conversation and return the normalized response.
    async fn invoke(&self, messages: &[ChatMessage]) -> LlmResult<ChatResponse>;
}

impl std::fmt::Debug for dyn ChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModel").field("name", &self.name()).finish()
    }
}

/// Protocol instruction for models driven through induced tool calls.
pub const TOOL_CALL_INSTRUCTION: &str = r#"# Tool Invocation Protocol
You have access to the following tools. When the user's request requires using a tool, follow this protocol:

1. **Format:** Output strictly valid JSON
2. **Structure:** {"tool_calls": [{"name": "<provider_name>.<tool_name>", "args": <arguments_dict>}]}
3. **Multiple Tools:** Include multiple tool call objects in the tool_calls array
4. **Important:** Do NOT include other fields when calling tools - ONLY the tool_calls field
5. **Tool Name:** Remember that tool names carry their provider prefix

## STRICT FORMATTING EXAMPLES

User: "What is the weather in Tokyo?"
Assistant:
{"tool_calls": [{"name": "Weather.get_weather", "args": {"location": "Tokyo", "unit": "celsius"}}]}

User: "Email John and check the server status."
Assistant:
{"tool_calls": [{"name": "Email.send_email", "args": {"recipient": "john@example.com", "body": "Hello"}}, {"name": "Server.check_server", "args": {"target": "localhost"}}]}

## Available Tools
"#;

/// Schema of the items inside a `tool_calls` array.
#[must_use]
pub fn tool_call_item_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "args": {"type": "object"}
        },
        "required": ["name", "args"]
    })
}

/// Schema of a full induced tool-call payload.
#[must_use]
pub fn tool_calls_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tool_calls": {
                "type": "array",
                "items": tool_call_item_schema()
            }
        },
        "required": ["tool_calls"],
        "description": "Tool invocation request"
    })
}

/// Build the synthetic system message content for induced tool calling:
/// the protocol instruction followed by every bound tool's schema.
#[must_use]
pub fn induced_instruction(tools: &[ToolDefinition]) -> String {
    let mut instruction = TOOL_CALL_INSTRUCTION.to_owned();
    for tool in tools {
        if let Ok(schema) = serde_json::to_string_pretty(tool) {
            instruction.push_str(&schema);
            instruction.push('\n');
        }
    }
    instruction
}

/// Parse induced tool calls out of model content.
///
/// The payload is expected to be `{"tool_calls": [{"name", "args"}, ...]}`,
/// possibly wrapped in fences or surrounding prose. Anything that does not
/// yield a well-formed list parses as empty.
#[must_use]
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let Some(value) = json_utils::parse_lenient(content) else {
        return Vec::new();
    };
    let Some(items) = value.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut calls = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.get("name").and_then(Value::as_str) else {
            return Vec::new();
        };
        let args: Map<String, Value> = match item.get("args") {
            Some(Value::Object(map)) => map.clone(),
            _ => return Vec::new(),
        };
        calls.push(ToolCall::new(name, args));
    }
    calls
}

/// Type alias for a boxed chat model.
pub type BoxedChatModel = Box<dyn ChatModel>;

#[cfg(test)]
mod tests {
    use super::*;

    mod messages {
        use super::*;

        #[test]
        fn constructors_set_roles() {
            assert_eq!(ChatMessage::system("s").role, Role::System);
            assert_eq!(ChatMessage::user("u").role, Role::User);
            assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
            assert_eq!(ChatMessage::tool("Fs.ls", "listing").role, Role::Tool);
        }

        #[test]
        fn tool_message_carries_tool_name() {
            let msg = ChatMessage::tool("Fs.ls", "listing");
            assert_eq!(msg.tool_name.as_deref(), Some("Fs.ls"));
            assert_eq!(msg.content, "listing");
        }

        #[test]
        fn role_as_str() {
            assert_eq!(Role::System.as_str(), "system");
            assert_eq!(Role::Tool.as_str(), "tool");
        }

        #[test]
        fn serde_skips_empty_fields() {
            let text = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
            assert!(!text.contains("tool_calls"));
            assert!(!text.contains("tool_name"));
        }
    }

    mod response {
        use super::*;

        #[test]
        fn from_text_has_no_tool_calls() {
            let resp = ChatResponse::from_text("hello");
            assert!(!resp.has_tool_calls());
            assert_eq!(resp.content.as_deref(), Some("hello"));
        }

        #[test]
        fn from_tool_calls_has_them() {
            let resp =
                ChatResponse::from_tool_calls(vec![ToolCall::new("Fs.ls", ToolArgs::new())]);
            assert!(resp.has_tool_calls());
        }
    }

    mod induced {
        use super::*;
        use crate::tool::ToolDefinition;

        fn sample_tools() -> Vec<ToolDefinition> {
            vec![ToolDefinition::new(
                "Fs.ls",
                "List a directory.",
                json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            )]
        }

        #[test]
        fn instruction_embeds_every_schema() {
            let instruction = induced_instruction(&sample_tools());
            assert!(instruction.starts_with("# Tool Invocation Protocol"));
            assert!(instruction.contains("Fs.ls"));
            assert!(instruction.contains("\"type\": \"function\""));
        }

        #[test]
        fn instruction_without_tools_is_still_valid() {
            let instruction = induced_instruction(&[]);
            assert!(instruction.contains("tool_calls"));
        }

        #[test]
        fn schema_requires_tool_calls_key() {
            let schema = tool_calls_schema();
            assert_eq!(schema["required"][0], "tool_calls");
            assert_eq!(
                schema["properties"]["tool_calls"]["items"]["required"][1],
                "args"
            );
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn parses_plain_payload() {
            let calls =
                parse_tool_calls(r#"{"tool_calls": [{"name": "Fs.ls", "args": {"path": "/tmp"}}]}"#);
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "Fs.ls");
            assert_eq!(calls[0].args["path"], "/tmp");
        }

        #[test]
        fn parses_payload_with_prose_around_it() {
            let calls = parse_tool_calls(
                "prefix {\"tool_calls\":[{\"name\":\"Fs.ls\",\"args\":{\"path\":\"/tmp\"}}]} suffix",
            );
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "Fs.ls");
        }

        #[test]
        fn parses_multiple_calls_in_order() {
            let calls = parse_tool_calls(
                r#"{"tool_calls": [
                    {"name": "A.x", "args": {}},
                    {"name": "B.y", "args": {"k": 1}}
                ]}"#,
            );
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].name, "A.x");
            assert_eq!(calls[1].name, "B.y");
        }

        #[test]
        fn missing_tool_calls_key_is_empty() {
            assert!(parse_tool_calls(r#"{"content": "just text"}"#).is_empty());
        }

        #[test]
        fn non_array_tool_calls_is_empty() {
            assert!(parse_tool_calls(r#"{"tool_calls": "nope"}"#).is_empty());
        }

        #[test]
        fn malformed_item_discards_the_list() {
            assert!(parse_tool_calls(r#"{"tool_calls": [{"name": "A.x"}]}"#).is_empty());
        }

        #[test]
        fn plain_text_is_empty() {
            assert!(parse_tool_calls("I have no tools to call.").is_empty());
        }
    }
}
