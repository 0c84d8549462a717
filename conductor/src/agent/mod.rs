//! Agent core: prompt assembly, the tool-call loop and schema-constrained
//! output.
//!
//! An [`Agent`] wraps one or more chat models, a set of system prompts, an
//! optional output schema, a bundle of registered tools and its own
//! append-only history ledger. `execute` assembles the prompt stack, drives
//! the model through tool-call rounds until it produces a final answer,
//! validates that answer against the schema and commits it to the ledger.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::align::{AlignError, ToolAligner};
use crate::chat::{
    BoxedChatModel, ChatMessage, ChatModel, LlmError, ToolCall, tool_call_item_schema,
};
use crate::ledger::{Ledger, Socket};
use crate::tool::{
    SharedTool, ToolArgs, ToolError, ToolProvider, ToolRegistry, register_provider,
};
use crate::json_utils;

/// A type alias for `Result<T, AgentError>`.
pub type AgentResult<T> = Result<T, AgentError>;

/// Error type for agent construction and execution.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent was wired to a model target that does not exist.
    #[error("model '{0}' is not configured for this agent")]
    UnknownModel(String),

    /// The agent is missing something it needs to run.
    #[error("agent configuration error: {0}")]
    Configuration(String),

    /// The chat backend failed.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A tool failed or could not be found.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The aligner failed while repairing a tool call.
    #[error(transparent)]
    Align(#[from] AlignError),

    /// The final model output could not be parsed as JSON, even after repair.
    #[error("failed to parse JSON output: {output}")]
    OutputParse {
        /// The offending output.
        output: String,
    },

    /// The final model output did not satisfy the output schema.
    #[error("model output failed schema validation: {message}")]
    OutputValidation {
        /// The first validation failure.
        message: String,
    },

    /// The declared output schema itself is invalid.
    #[error("invalid output schema: {0}")]
    Schema(String),
}

/// The outcome of one agent execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// The validated output text.
    pub output: String,
}

impl ExecutionResult {
    /// Render the result as JSON, the form verifiers receive.
    #[must_use]
    pub fn json_str(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

struct OutputSchema {
    preamble: ChatMessage,
    validator: jsonschema::Validator,
    schema_value: Value,
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("schema", &self.schema_value)
            .finish_non_exhaustive()
    }
}

/// The composite validator used when tools are bound: the model may answer
/// either with `{"content": <user schema>}` or `{"tool_calls": [...]}`.
fn composite_schema(user_schema: &Value) -> Value {
    json!({
        "type": "object",
        "properties": {
            "content": user_schema,
            "tool_calls": {
                "type": "array",
                "items": tool_call_item_schema(),
                "minItems": 1
            }
        },
        "anyOf": [
            {"required": ["content"]},
            {"required": ["tool_calls"]}
        ],
        "additionalProperties": false
    })
}

/// An LLM agent with prompts, tools, an output schema and a ledger.
pub struct Agent {
    name: String,
    models: HashMap<String, BoxedChatModel>,
    primary: String,
    sysprompts: Vec<ChatMessage>,
    schema: Option<OutputSchema>,
    sockets: BTreeMap<String, Socket>,
    history: Arc<Ledger>,
    registry: ToolRegistry,
    aligner: Option<ToolAligner>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("tools", &self.registry.keys().collect::<Vec<_>>())
            .field("sockets", &self.sockets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Start building an agent.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's history ledger, shareable with sockets.
    #[must_use]
    pub fn history_ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.history)
    }

    /// The most recent committed history entry, rendered.
    #[must_use]
    pub fn latest_history(&self) -> Option<String> {
        self.history.last_rendered()
    }

    /// The system prompts currently installed, schema preamble excluded.
    #[must_use]
    pub fn sysprompts(&self) -> &[ChatMessage] {
        &self.sysprompts
    }

    /// Whether an output schema is declared.
    #[must_use]
    pub fn has_output_schema(&self) -> bool {
        self.schema.is_some()
    }

    /// Names of the registered tools.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    /// Append a system prompt.
    pub fn add_sysprompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        debug!(agent = %self.name, "system prompt added");
        self.sysprompts.push(ChatMessage::system(prompt));
    }

    /// Subscribe this agent to another ledger through a named socket.
    pub fn add_socket(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        ledger: Arc<Ledger>,
    ) {
        let name = name.into();
        info!(agent = %self.name, socket = %name, "socket added");
        self.sockets
            .insert(name.clone(), Socket::new(name, description, ledger));
    }

    /// Declare the expected output schema.
    ///
    /// `hint` is the human-readable field map embedded in the preamble;
    /// `validator` is the JSON Schema the output must satisfy. When any
    /// bound model carries tools, the validator is widened so the model may
    /// answer with either `content` or `tool_calls`.
    pub fn set_output_schema(&mut self, hint: Value, validator: Value) -> AgentResult<()> {
        let has_tools = self
            .models
            .values()
            .any(|model| !model.bound_tools().is_empty());

        let (schema_value, preamble) = if has_tools {
            let schema_value = composite_schema(&validator);
            let preamble = format!(
                "Output must be in JSON format.\n\
                 When you need to call tools: {{\"tool_calls\": [{{\"name\": \"tool_name\", \"args\": {{...}}}}]}}\n\
                 When providing final answer: {{\"content\": {hint}}}\n\
                 Note: Output only 'tool_calls' when calling tools, then 'content' with the final result after tools execute."
            );
            (schema_value, preamble)
        } else {
            let preamble =
                format!("Output must be in JSON format with the following fields: {hint}");
            (validator, preamble)
        };

        let compiled = jsonschema::validator_for(&schema_value)
            .map_err(|e| AgentError::Schema(e.to_string()))?;
        debug!(agent = %self.name, has_tools, "output schema defined");
        self.schema = Some(OutputSchema {
            preamble: ChatMessage::system(preamble),
            validator: compiled,
            schema_value,
        });
        Ok(())
    }

    /// Run the agent on a task context.
    ///
    /// Prompt order: system prompts (schema preamble last), the agent's own
    /// last history entry, one line per subscribed socket's latest message,
    /// then the task itself. The model is re-invoked after every round of
    /// tool calls until it answers without any.
    pub async fn execute(&mut self, task_context: &str) -> AgentResult<ExecutionResult> {
        let mut prompts = self.sysprompts.clone();
        if let Some(schema) = &self.schema {
            prompts.push(schema.preamble.clone());
        }

        prompts.push(ChatMessage::assistant(
            self.history.last_rendered().unwrap_or_default(),
        ));

        let mut socket_lines = Vec::with_capacity(self.sockets.len());
        for (name, socket) in &mut self.sockets {
            let latest = socket.read_latest().unwrap_or_default();
            socket_lines.push(format!("{name}: {latest}"));
        }
        prompts.push(ChatMessage::assistant(socket_lines.join("\n")));
        prompts.push(ChatMessage::user(task_context));

        let mut iteration = 0usize;
        let output = loop {
            iteration += 1;
            let response = {
                let model = self
                    .models
                    .get(&self.primary)
                    .ok_or_else(|| AgentError::UnknownModel(self.primary.clone()))?;
                model.invoke(&prompts).await?
            };
            let content = response.content.clone().unwrap_or_default();
            debug!(
                agent = %self.name,
                iteration,
                tool_calls = response.tool_calls.len(),
                "model response received"
            );
            prompts.push(ChatMessage::assistant_with_tool_calls(
                content.clone(),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                break content;
            }
            for message in self.handle_tool_calls(&response.tool_calls).await? {
                prompts.push(message);
            }
        };

        let output = self.validate_output(output)?;
        self.history
            .commit(output.clone(), Some(task_context.to_owned()));
        Ok(ExecutionResult { output })
    }

    /// Execute every requested tool call, in model order.
    ///
    /// Unknown names go through the aligner when one is configured. Tool
    /// failures and unresolvable names are fatal to the execution.
    async fn handle_tool_calls(&mut self, calls: &[ToolCall]) -> AgentResult<Vec<ChatMessage>> {
        info!(agent = %self.name, count = calls.len(), "model requested tool calls");
        let mut results = Vec::with_capacity(calls.len());
        for (idx, call) in calls.iter().enumerate() {
            info!(agent = %self.name, tool = %call.name, "tool call {}/{}", idx + 1, calls.len());
            results.push(self.dispatch_tool_call(call).await?);
        }
        Ok(results)
    }

    async fn dispatch_tool_call(&mut self, call: &ToolCall) -> AgentResult<ChatMessage> {
        if let Some(tool) = self.registry.get(&call.name) {
            let tool = Arc::clone(tool);
            return run_tool(&tool, &call.args).await;
        }

        warn!(tool = %call.name, "tool not found, attempting alignment");
        let aligned = match self.aligner.as_mut() {
            Some(aligner) => aligner.align_tool_call(call)?,
            None => None,
        };
        let Some(fixed) = aligned else {
            return Err(ToolError::NotFound(call.name.clone()).into());
        };

        info!(from = %call.name, to = %fixed.name, "tool call aligned");
        let tool = self
            .registry
            .get(&fixed.name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(fixed.name.clone()))?;
        run_tool(&tool, &fixed.args).await
    }

    /// Repair, parse and validate the final output against the schema.
    fn validate_output(&self, output: String) -> AgentResult<String> {
        let Some(schema) = &self.schema else {
            return Ok(output);
        };

        let stripped = json_utils::strip_code_fences(&output);
        let Some((repaired, value)) = json_utils::repair_json(stripped) else {
            return Err(AgentError::OutputParse { output });
        };
        schema
            .validator
            .validate(&value)
            .map_err(|e| AgentError::OutputValidation {
                message: e.to_string(),
            })?;
        debug!(agent = %self.name, "output validated");
        Ok(repaired)
    }
}

async fn run_tool(tool: &SharedTool, args: &ToolArgs) -> AgentResult<ChatMessage> {
    let name = tool.meta().name.clone();
    let start = Instant::now();
    let result = tool.call(args).await?;
    info!(
        tool = %name,
        duration_ms = start.elapsed().as_millis() as u64,
        "tool completed"
    );
    Ok(ChatMessage::tool(name, result))
}

/// Builder for [`Agent`].
///
/// Tool providers are declared against a target model name; at `build` time
/// every provider's tools are registered under unique full names, their
/// definitions bound to the target's adapter, and the aligner populated.
pub struct AgentBuilder {
    name: String,
    models: Vec<(String, BoxedChatModel)>,
    primary: Option<String>,
    sysprompts: Vec<String>,
    providers: Vec<(String, Arc<dyn ToolProvider>)>,
    aligner: Option<ToolAligner>,
    schema: Option<(Value, Value)>,
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("models", &self.models.len())
            .field("providers", &self.providers.len())
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create a builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: Vec::new(),
            primary: None,
            sysprompts: Vec::new(),
            providers: Vec::new(),
            aligner: None,
            schema: None,
        }
    }

    /// Add a chat model under a target name. The first model added becomes
    /// the primary unless [`primary`](Self::primary) overrides it.
    #[must_use]
    pub fn model(mut self, target: impl Into<String>, model: impl ChatModel + 'static) -> Self {
        self.models.push((target.into(), Box::new(model)));
        self
    }

    /// Add an already-boxed chat model under a target name.
    #[must_use]
    pub fn boxed_model(mut self, target: impl Into<String>, model: BoxedChatModel) -> Self {
        self.models.push((target.into(), model));
        self
    }

    /// Choose which model target drives the execution loop.
    #[must_use]
    pub fn primary(mut self, target: impl Into<String>) -> Self {
        self.primary = Some(target.into());
        self
    }

    /// Add a system prompt.
    #[must_use]
    pub fn sysprompt(mut self, prompt: impl Into<String>) -> Self {
        self.sysprompts.push(prompt.into());
        self
    }

    /// Bind a tool provider to a target model.
    #[must_use]
    pub fn provider(mut self, target: impl Into<String>, provider: Arc<dyn ToolProvider>) -> Self {
        self.providers.push((target.into(), provider));
        self
    }

    /// Attach a tool aligner.
    #[must_use]
    pub fn aligner(mut self, aligner: ToolAligner) -> Self {
        self.aligner = Some(aligner);
        self
    }

    /// Declare the output schema: a human-readable field map and the JSON
    /// Schema the output must satisfy.
    #[must_use]
    pub fn output_schema(mut self, hint: Value, validator: Value) -> Self {
        self.schema = Some((hint, validator));
        self
    }

    /// Build the agent: register tools, bind them to their targets and
    /// compile the output schema.
    pub fn build(self) -> AgentResult<Agent> {
        let mut models: HashMap<String, BoxedChatModel> = HashMap::new();
        let mut first_target = None;
        for (target, model) in self.models {
            if first_target.is_none() {
                first_target = Some(target.clone());
            }
            models.insert(target, model);
        }

        let primary = self
            .primary
            .or(first_target)
            .ok_or_else(|| AgentError::Configuration("agent has no chat model".into()))?;
        if !models.contains_key(&primary) {
            return Err(AgentError::UnknownModel(primary));
        }

        let mut registry = ToolRegistry::new();
        let mut aligner = self.aligner;

        // Group providers by target, preserving declaration order.
        let mut grouped: Vec<(String, Vec<Arc<dyn ToolProvider>>)> = Vec::new();
        for (target, provider) in self.providers {
            match grouped.iter_mut().find(|(t, _)| *t == target) {
                Some((_, providers)) => providers.push(provider),
                None => grouped.push((target, vec![provider])),
            }
        }

        for (target, providers) in grouped {
            let model = models
                .get_mut(&target)
                .ok_or_else(|| AgentError::UnknownModel(target.clone()))?;
            let mut definitions = Vec::new();
            for provider in providers {
                let tools = register_provider(&mut registry, provider.as_ref())?;
                for tool in &tools {
                    if let Some(aligner) = aligner.as_mut() {
                        aligner.add_tool(&tool.meta().name, &tool.arg_names())?;
                    }
                    definitions.push(tool.definition());
                }
            }
            info!(target = %target, count = definitions.len(), "tools bound to model");
            model.bind_tools(definitions);
        }

        let mut agent = Agent {
            name: self.name,
            models,
            primary,
            sysprompts: self.sysprompts.iter().map(ChatMessage::system).collect(),
            schema: None,
            sockets: BTreeMap::new(),
            history: Ledger::shared(),
            registry,
            aligner,
        };
        if let Some((hint, validator)) = self.schema {
            agent.set_output_schema(hint, validator)?;
        }
        Ok(agent)
    }
}
