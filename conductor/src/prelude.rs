//! Convenience re-exports for building pipelines.

pub use crate::agent::{Agent, AgentBuilder, AgentError, AgentResult, ExecutionResult};
pub use crate::align::{AlignError, Aligner, AlignerPool, Embedder, ToolAligner};
pub use crate::chat::mock::MockChat;
pub use crate::chat::ollama::{OllamaChat, OllamaConfig};
pub use crate::chat::{ChatMessage, ChatModel, ChatResponse, LlmError, Role, ToolCall};
pub use crate::fsm::{Fsm, FsmError, FsmResult, State, StateKind, Transition, Verifier};
pub use crate::ledger::{Ledger, Snapshot, Socket};
pub use crate::process::{CommandOutput, CommandRunner, MonitorError, ProcessMonitor};
pub use crate::resources::{ResourceError, ResourceProvider};
pub use crate::tool::{
    SharedTool, Tool, ToolArgs, ToolDefinition, ToolError, ToolMeta, ToolProvider, ToolResult,
};
pub use crate::tools::{PythonWorkspace, WorkDir};

#[cfg(feature = "fastembed")]
pub use crate::align::FastEmbedder;
