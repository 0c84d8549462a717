//! Ollama chat adapter.
//!
//! Talks to an Ollama server's `/api/chat` endpoint. Tools are either passed
//! natively or induced through the JSON protocol for models without native
//! tool support; the `thinking` flag is forwarded when configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChatMessage, ChatModel, ChatResponse, LlmError, LlmResult, ToolCall, induced_instruction, parse_tool_calls};
use crate::tool::{ToolArgs, ToolDefinition};

/// Configuration of one Ollama-backed chat model.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server.
    pub host: String,
    /// Model identifier, e.g. `llama3.1`.
    pub model: String,
    /// Forwarded to Ollama's `think` parameter when set.
    pub thinking: Option<bool>,
    /// Drive tools through the induced JSON protocol instead of the native
    /// tool parameter.
    pub induced_tools: bool,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_owned(),
            model: "llama3.1".to_owned(),
            thinking: None,
            induced_tools: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireToolFunction {
    name: String,
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireToolFunction,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    message: WireResponseMessage,
}

/// Chat adapter for one Ollama model.
#[derive(Debug)]
pub struct OllamaChat {
    config: OllamaConfig,
    http: Client,
    tools: Vec<ToolDefinition>,
}

impl OllamaChat {
    /// Create an adapter from configuration.
    pub fn new(config: OllamaConfig) -> LlmResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let http = builder
            .build()
            .map_err(|e| LlmError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            tools: Vec::new(),
        })
    }

    /// The server base URL.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.config.host.trim_end_matches('/'))
    }

    fn convert_messages(&self, messages: &[ChatMessage]) -> Vec<WireMessage> {
        let mut converted: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str().to_owned(),
                content: m.content.clone(),
                tool_name: m.tool_name.clone(),
            })
            .collect();
        if self.config.induced_tools && !self.tools.is_empty() {
            converted.push(WireMessage {
                role: "system".to_owned(),
                content: induced_instruction(&self.tools),
                tool_name: None,
            });
        }
        converted
    }

    fn convert_native_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
        calls
            .into_iter()
            .map(|call| {
                let args: ToolArgs = match call.function.arguments {
                    Value::Object(map) => map,
                    Value::String(text) => serde_json::from_str(&text).unwrap_or_default(),
                    _ => ToolArgs::new(),
                };
                ToolCall::new(call.function.name, args)
            })
            .collect()
    }

    fn parse_response(&self, response: WireResponse) -> ChatResponse {
        let content = response.message.content;
        let tool_calls = if self.config.induced_tools {
            parse_tool_calls(&content)
        } else {
            response
                .message
                .tool_calls
                .map(Self::convert_native_calls)
                .unwrap_or_default()
        };
        ChatResponse {
            role: Some(response.message.role),
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls,
        }
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn bind_tools(&mut self, tools: Vec<ToolDefinition>) {
        tracing::info!(
            model = %self.config.model,
            count = tools.len(),
            induced = self.config.induced_tools,
            "tools bound to chat model"
        );
        self.tools.extend(tools);
    }

    fn bound_tools(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> LlmResult<ChatResponse> {
        let body = WireRequest {
            model: self.config.model.clone(),
            messages: self.convert_messages(messages),
            stream: false,
            tools: if self.config.induced_tools || self.tools.is_empty() {
                None
            } else {
                Some(self.tools.clone())
            },
            think: self.config.thinking,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            tools = self.tools.len(),
            "invoking chat model"
        );

        let response = self.http.post(self.chat_url()).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: WireResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::response_format("valid Ollama chat response", format!("{e}: {text}"))
        })?;
        Ok(self.parse_response(parsed))
    }
}
