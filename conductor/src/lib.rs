//! Conductor is a framework for authoring and executing multi-agent LLM
//! pipelines as finite-state machines.
//!
//! An operator declares a set of [`agent::Agent`]s, each wrapping one chat
//! model with system prompts, an output schema and a bundle of callable
//! tools, and wires them into an [`fsm::Fsm`] whose transitions are chosen
//! at runtime by verifiers. The runtime shepherds conversation state,
//! tool invocations, retries and inter-agent message exchange over
//! append-only [`ledger::Ledger`]s until the machine reaches a terminal
//! state.
//!
//! # Example
//!
//! ```rust,ignore
//! use conductor::prelude::*;
//!
//! let agent = Agent::builder("writer")
//!     .model("model", OllamaChat::new(OllamaConfig::default())?)
//!     .sysprompt("You write haikus.")
//!     .build()?;
//!
//! let mut fsm = Fsm::new();
//! fsm.add_state(State::start("start"))?;
//! fsm.add_state(State::stable("write", vec![], agent, Verifier::forward("done")))?;
//! fsm.add_state(State::end("done"))?;
//! fsm.add_transition(Transition::new("start", "write", ""))?;
//! fsm.add_transition(Transition::new("write", "done", "haiku written"))?;
//!
//! let output = fsm.run("a haiku about autumn").await?;
//! ```

// Core modules
pub mod json_utils;
pub mod ledger;
pub mod process;

// Tool surface
pub mod align;
pub mod tool;
pub mod tools;

// Model adapters
pub mod chat;

// Orchestration
pub mod agent;
pub mod fsm;
pub mod resources;

pub mod prelude;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder, AgentError, ExecutionResult};
pub use align::{Aligner, AlignerPool, AlignError, Embedder, ToolAligner};
pub use chat::{ChatMessage, ChatModel, ChatResponse, LlmError, Role, ToolCall};
pub use fsm::{Fsm, FsmError, State, StateKind, Transition, Verifier};
pub use ledger::{Ledger, Snapshot, Socket};
pub use process::{CommandOutput, CommandRunner, MonitorError, ProcessMonitor};
pub use resources::{ResourceError, ResourceProvider};
pub use tool::{Tool, ToolDefinition, ToolError, ToolMeta, ToolProvider};
