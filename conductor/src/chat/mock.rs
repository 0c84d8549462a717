//! Scripted chat model for tests and dry runs.
//!
//! Returns predefined responses in sequence, cycling once they run out.
//! Also backs the `mock` LLM resource category so a pipeline can be wired
//! end to end without a live backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{ChatMessage, ChatModel, ChatResponse, LlmResult};
use crate::tool::ToolDefinition;

/// A chat model that replays a fixed script.
#[derive(Debug, Default)]
pub struct MockChat {
    name: String,
    responses: Vec<ChatResponse>,
    index: AtomicUsize,
    tools: Mutex<Vec<ToolDefinition>>,
}

impl MockChat {
    /// Create a mock with no scripted responses; every call answers with an
    /// empty assistant message.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Create a mock that cycles through `responses`.
    #[must_use]
    pub fn with_responses(name: impl Into<String>, responses: Vec<ChatResponse>) -> Self {
        Self {
            name: name.into(),
            responses,
            ..Self::default()
        }
    }

    /// Create a mock that cycles through plain text responses.
    #[must_use]
    pub fn from_texts(name: impl Into<String>, texts: Vec<String>) -> Self {
        Self::with_responses(
            name,
            texts.into_iter().map(ChatResponse::from_text).collect(),
        )
    }

    /// Append one more scripted response.
    pub fn push_response(&mut self, response: ChatResponse) {
        self.responses.push(response);
    }

    /// How many times the model has been invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for MockChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_tools(&mut self, tools: Vec<ToolDefinition>) {
        self.tools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tools);
    }

    fn bound_tools(&self) -> Vec<ToolDefinition> {
        self.tools.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn invoke(&self, _messages: &[ChatMessage]) -> LlmResult<ChatResponse> {
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        if self.responses.is_empty() {
            return Ok(ChatResponse::from_text(""));
        }
        Ok(self.responses[index % self.responses.len()].clone())
    }
}
