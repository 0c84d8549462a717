//! The finite-state machine runtime.
//!
//! States wrap agents; transitions are chosen at runtime by verifiers.
//! [`Fsm::compile`] validates the topology, teaches every verifier its
//! legal `{target, constraint}` choices and wires subscription sockets.
//! [`Fsm::run`] then drives the machine until an End state, recovering
//! through the singleton Error state while retry budgets last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentError, AgentResult};
use crate::ledger::Ledger;

/// Name of the synthetic socket carrying the caller's initial request.
pub const INITIAL_CONTEXT_SOCKET: &str = "__initial_context__";

/// Default system prompt prefix compiled into every verifier.
pub const DEFAULT_VERIFIER_PREAMBLE: &str = "You decide which state of a workflow runs next. \
Below are the legal transitions as JSON records with the fields \"target\" and \"constraint\". \
Pick the target whose constraint matches the execution result and answer with exactly that \
target name in the next_state field.";

/// Result literal returned when recovery is exhausted.
pub const FAILED: &str = "FAILED";

const ERROR_STATE_NAME: &str = "__error__";

/// A type alias for `Result<T, FsmError>`.
pub type FsmResult<T> = Result<T, FsmError>;

/// Error type for FSM construction and compilation.
#[derive(Debug, Error)]
pub enum FsmError {
    /// A state with this name already exists.
    #[error("duplicate state '{0}'")]
    DuplicateState(String),

    /// A transition references a missing source state.
    #[error("source state '{0}' does not exist")]
    UnknownSource(String),

    /// A transition references a missing target state.
    #[error("target state '{0}' does not exist")]
    UnknownTarget(String),

    /// The machine must have exactly one Start state.
    #[error("FSM must have exactly one Start state, found {0}")]
    StartStateCount(usize),

    /// The machine must have at least one End state.
    #[error("FSM must have at least one End state")]
    NoEndState,

    /// No declared transition reaches any End state.
    #[error("no transition reaches an End state")]
    EndUnreachable,

    /// The Start state needs exactly one outgoing transition.
    #[error("Start state '{0}' must have exactly one outgoing transition")]
    StartTransitions(String),

    /// A state with outgoing transitions has no verifier to choose among
    /// them.
    #[error("state '{0}' has outgoing transitions but no verifier")]
    MissingVerifier(String),

    /// A subscription names a state that does not exist.
    #[error("state '{state}' subscribes to unknown state '{subscription}'")]
    UnknownSubscription {
        /// The subscribing state.
        state: String,
        /// The missing subscription target.
        subscription: String,
    },

    /// `run` was entered before a successful `compile`.
    #[error("FSM is not compiled")]
    NotCompiled,
}

/// Kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateKind {
    /// Entry point; forwards the initial context.
    Start,
    /// A checkpoint the machine can recover back to.
    Stable,
    /// A pass-through step, never a recovery target.
    Transient,
    /// The synthetic recovery state.
    Error,
    /// A terminal state.
    End,
}

/// A declared edge of the machine.
///
/// `constraint` is guidance text the verifier reads to decide whether this
/// edge applies.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// Source state name.
    pub source: String,
    /// Target state name.
    pub target: String,
    /// Verifier guidance for taking this edge.
    pub constraint: String,
}

impl Transition {
    /// Create a transition.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            constraint: constraint.into(),
        }
    }

    /// Render the transition as JSON.
    #[must_use]
    pub fn json_str(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The `{target, constraint}` record verifiers are taught.
    #[must_use]
    pub fn choice_record(&self) -> String {
        json!({"target": self.target, "constraint": self.constraint}).to_string()
    }
}

/// Decides the next state from an execution result.
///
/// Either a fixed forward edge or a dedicated verifier agent whose output
/// schema is `{"next_state": string}`.
#[derive(Debug)]
pub enum Verifier {
    /// Always answers with a fixed target.
    Forward {
        /// The target to forward to.
        target: String,
    },
    /// Delegates the decision to an agent.
    Agent {
        /// The deciding agent.
        agent: Agent,
    },
}

impl Verifier {
    /// Create a forward verifier.
    #[must_use]
    pub fn forward(target: impl Into<String>) -> Self {
        Self::Forward {
            target: target.into(),
        }
    }

    /// Create an agent verifier. When the agent declares no output schema,
    /// the `{"next_state": string}` schema is installed for it.
    pub fn agent(mut agent: Agent) -> AgentResult<Self> {
        if !agent.has_output_schema() {
            agent.set_output_schema(
                json!({"next_state": "name of the next state"}),
                json!({
                    "type": "object",
                    "properties": {"next_state": {"type": "string"}},
                    "required": ["next_state"]
                }),
            )?;
        }
        Ok(Self::Agent { agent })
    }

    /// Decide the next state name for an execution result.
    pub async fn decide(&mut self, context: &str) -> AgentResult<String> {
        match self {
            Self::Forward { target } => Ok(target.clone()),
            Self::Agent { agent } => {
                let result = agent.execute(context).await?;
                let value: serde_json::Value =
                    serde_json::from_str(&result.output).map_err(|_| AgentError::OutputParse {
                        output: result.output.clone(),
                    })?;
                value
                    .get("next_state")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
                    .ok_or(AgentError::OutputValidation {
                        message: "verifier output carries no next_state".into(),
                    })
            }
        }
    }

    /// Append a system prompt to the deciding agent. No-op for forward
    /// verifiers.
    pub fn add_sysprompt(&mut self, prompt: &str) {
        if let Self::Agent { agent } = self {
            agent.add_sysprompt(prompt);
        }
    }
}

/// Result of executing one state.
#[derive(Debug, Clone)]
pub struct StateExecutionResult {
    /// The verifier's chosen next state name.
    pub next_state: String,
    /// The state's output, which becomes the next state's input.
    pub output: String,
}

/// One node of the machine.
#[derive(Debug)]
pub struct State {
    name: String,
    kind: StateKind,
    subscriptions: Vec<String>,
    agent: Option<Agent>,
    verifier: Option<Verifier>,
    description: String,
    max_retries: u32,
    retries_left: u32,
    forward_target: Option<String>,
}

const DEFAULT_MAX_RETRIES: u32 = 3;

impl State {
    fn new(
        name: impl Into<String>,
        kind: StateKind,
        subscriptions: Vec<String>,
        agent: Option<Agent>,
        verifier: Option<Verifier>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            subscriptions,
            agent,
            verifier,
            description: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retries_left: DEFAULT_MAX_RETRIES,
            forward_target: None,
        }
    }

    /// Create a stable state: a recovery checkpoint with a retry budget.
    #[must_use]
    pub fn stable(
        name: impl Into<String>,
        subscriptions: Vec<String>,
        agent: Agent,
        verifier: Verifier,
    ) -> Self {
        Self::new(
            name,
            StateKind::Stable,
            subscriptions,
            Some(agent),
            Some(verifier),
        )
    }

    /// Create a transient state: executed like a stable state but never a
    /// recovery target.
    #[must_use]
    pub fn transient(
        name: impl Into<String>,
        subscriptions: Vec<String>,
        agent: Agent,
        verifier: Verifier,
    ) -> Self {
        Self::new(
            name,
            StateKind::Transient,
            subscriptions,
            Some(agent),
            Some(verifier),
        )
    }

    /// Create the entry state.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Start, Vec::new(), None, None)
    }

    /// Create a terminal state.
    #[must_use]
    pub fn end(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::End, Vec::new(), None, None)
    }

    fn error(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Error, Vec::new(), None, None)
    }

    /// Set the human description, shown to subscribers of this state.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the retry budget consumed by recovery.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retries_left = max_retries;
        self
    }

    /// The state's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The state's kind.
    #[must_use]
    pub fn kind(&self) -> StateKind {
        self.kind
    }

    /// Retries still available.
    #[must_use]
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Refill the retry budget. Called on every fresh entry to a stable
    /// state.
    pub fn reset_retries(&mut self) {
        self.retries_left = self.max_retries;
    }

    /// Consume one retry if any are left. Returns whether one was consumed.
    pub fn retry(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            return true;
        }
        false
    }

    /// System prompts of the verifier agent, when there is one. Empty for
    /// forward verifiers.
    #[must_use]
    pub fn verifier_sysprompts(&self) -> Vec<String> {
        match &self.verifier {
            Some(Verifier::Agent { agent }) => agent
                .sysprompts()
                .iter()
                .map(|m| m.content.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Teach the verifier this state's legal transitions.
    fn compile_transitions(
        &mut self,
        transitions: &[Transition],
        preamble: &str,
    ) -> FsmResult<()> {
        if self.kind == StateKind::Start {
            if transitions.len() != 1 {
                return Err(FsmError::StartTransitions(self.name.clone()));
            }
            self.forward_target = Some(transitions[0].target.clone());
            return Ok(());
        }

        let Some(verifier) = self.verifier.as_mut() else {
            return Err(FsmError::MissingVerifier(self.name.clone()));
        };
        let mut prompt = preamble.to_owned();
        for transition in transitions {
            prompt.push('\n');
            prompt.push_str(&transition.choice_record());
        }
        verifier.add_sysprompt(&prompt);
        Ok(())
    }

    /// Execute the state on the current input.
    async fn execute(&mut self, context: &str) -> AgentResult<StateExecutionResult> {
        match self.kind {
            StateKind::Start => {
                let target = self.forward_target.clone().ok_or_else(|| {
                    AgentError::Configuration(format!("start state '{}' is not compiled", self.name))
                })?;
                Ok(StateExecutionResult {
                    next_state: target,
                    output: context.to_owned(),
                })
            }
            StateKind::End => Ok(StateExecutionResult {
                next_state: "END".to_owned(),
                output: context.to_owned(),
            }),
            _ => {
                let agent = self.agent.as_mut().ok_or_else(|| {
                    AgentError::Configuration(format!("state '{}' has no agent", self.name))
                })?;
                let result = agent.execute(context).await?;

                let verifier = self.verifier.as_mut().ok_or_else(|| {
                    AgentError::Configuration(format!("state '{}' has no verifier", self.name))
                })?;
                debug!(state = %self.name, "calling transition verifier");
                let next_state = verifier.decide(&result.json_str()).await?;
                info!(state = %self.name, next_state = %next_state, "verifier decision");
                Ok(StateExecutionResult {
                    next_state,
                    output: result.output,
                })
            }
        }
    }
}

/// The compiled graph and its driver loop.
#[derive(Debug)]
pub struct Fsm {
    states: HashMap<String, State>,
    transitions: HashMap<String, Vec<Transition>>,
    error_state: State,
    initial_state: Option<String>,
    initial_context: Arc<Ledger>,
    verifier_preamble: String,
    max_steps: usize,
    compiled: bool,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    /// Create an empty machine. The singleton Error state is synthesized
    /// here and never appears in the declared transition table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            transitions: HashMap::new(),
            error_state: State::error(ERROR_STATE_NAME),
            initial_state: None,
            initial_context: Ledger::shared(),
            verifier_preamble: DEFAULT_VERIFIER_PREAMBLE.to_owned(),
            max_steps: 1000,
            compiled: false,
        }
    }

    /// Name of the synthetic initial-context socket.
    #[must_use]
    pub fn initial_context_socket_name() -> &'static str {
        INITIAL_CONTEXT_SOCKET
    }

    /// Bound on the driver loop.
    #[must_use]
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Set the bound on the driver loop.
    pub fn set_max_steps(&mut self, max_steps: usize) {
        self.max_steps = max_steps;
    }

    /// Override the preamble compiled into every verifier prompt.
    pub fn set_verifier_preamble(&mut self, preamble: impl Into<String>) {
        self.verifier_preamble = preamble.into();
    }

    /// Borrow a state by name.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// Add a state. Names must be unique.
    pub fn add_state(&mut self, state: State) -> FsmResult<()> {
        if self.states.contains_key(state.name()) {
            return Err(FsmError::DuplicateState(state.name().to_owned()));
        }
        self.states.insert(state.name().to_owned(), state);
        Ok(())
    }

    /// Add a transition. Both endpoints must already exist.
    pub fn add_transition(&mut self, transition: Transition) -> FsmResult<()> {
        if !self.states.contains_key(&transition.source) {
            return Err(FsmError::UnknownSource(transition.source));
        }
        if !self.states.contains_key(&transition.target) {
            return Err(FsmError::UnknownTarget(transition.target));
        }
        self.transitions
            .entry(transition.source.clone())
            .or_default()
            .push(transition);
        Ok(())
    }

    /// Validate the topology, compile verifier prompts and wire sockets.
    ///
    /// Validation runs on every call; prompts and sockets are installed
    /// once, so a second `compile` leaves the machine unchanged.
    pub fn compile(&mut self) -> FsmResult<()> {
        let start_names: Vec<String> = self
            .states
            .values()
            .filter(|s| s.kind == StateKind::Start)
            .map(|s| s.name.clone())
            .collect();
        if start_names.len() != 1 {
            return Err(FsmError::StartStateCount(start_names.len()));
        }
        let initial = start_names[0].clone();

        let end_names: Vec<&str> = self
            .states
            .values()
            .filter(|s| s.kind == StateKind::End)
            .map(|s| s.name.as_str())
            .collect();
        if end_names.is_empty() {
            return Err(FsmError::NoEndState);
        }

        if !self.transitions.contains_key(&initial) {
            return Err(FsmError::StartTransitions(initial));
        }

        let end_reachable = self
            .transitions
            .values()
            .flatten()
            .any(|t| end_names.contains(&t.target.as_str()));
        if !end_reachable {
            return Err(FsmError::EndUnreachable);
        }

        self.initial_state = Some(initial);

        if self.compiled {
            return Ok(());
        }

        // Verifier prompts.
        for state in self.states.values_mut() {
            if let Some(transitions) = self.transitions.get(&state.name) {
                state.compile_transitions(transitions, &self.verifier_preamble)?;
                info!(
                    state = %state.name,
                    transitions = transitions.len(),
                    "state transitions compiled"
                );
            }
        }

        // Socket wiring: resolve every subscription to a ledger first, then
        // attach, because attaching borrows the subscribing state mutably.
        let mut wirings: Vec<(String, String, String, Arc<Ledger>)> = Vec::new();
        for state in self.states.values() {
            if state.agent.is_none() {
                continue;
            }
            for subscription in &state.subscriptions {
                if subscription == INITIAL_CONTEXT_SOCKET {
                    wirings.push((
                        state.name.clone(),
                        subscription.clone(),
                        "Initial Request".to_owned(),
                        Arc::clone(&self.initial_context),
                    ));
                    continue;
                }
                let Some(target) = self.states.get(subscription) else {
                    return Err(FsmError::UnknownSubscription {
                        state: state.name.clone(),
                        subscription: subscription.clone(),
                    });
                };
                match &target.agent {
                    Some(agent) => wirings.push((
                        state.name.clone(),
                        subscription.clone(),
                        target.description.clone(),
                        agent.history_ledger(),
                    )),
                    None => {
                        warn!(
                            state = %state.name,
                            subscription = %subscription,
                            "subscription target has no agent, skipping socket"
                        );
                    }
                }
            }
        }
        for (state_name, socket_name, description, ledger) in wirings {
            if let Some(agent) = self
                .states
                .get_mut(&state_name)
                .and_then(|s| s.agent.as_mut())
            {
                agent.add_socket(socket_name, description, ledger);
            }
        }

        self.compiled = true;
        Ok(())
    }

    /// Resolve the verifier's decision against the declared transitions.
    /// A miss routes to the Error state.
    fn resolve_transition(&self, current: &str, decided: &str) -> String {
        let matched = self
            .transitions
            .get(current)
            .into_iter()
            .flatten()
            .find(|t| t.target == decided);
        match matched {
            Some(transition) => {
                info!(from = %current, to = %transition.target, "transition");
                transition.target.clone()
            }
            None => {
                warn!(
                    from = %current,
                    decision = %decided,
                    "no transition matched decision, routing to error state"
                );
                self.error_state.name().to_owned()
            }
        }
    }

    fn kind_of(&self, name: &str) -> StateKind {
        if name == self.error_state.name() {
            self.error_state.kind()
        } else {
            self.states.get(name).map_or(StateKind::Error, State::kind)
        }
    }

    /// Drive the machine on an initial request.
    ///
    /// Returns the last successful state output, or [`FAILED`] when
    /// recovery is exhausted. Configuration problems surface as errors;
    /// execution failures route through the Error state instead.
    pub async fn run(&mut self, initial_request: &str) -> FsmResult<String> {
        self.initial_context.commit(initial_request, None);
        self.compile()?;
        let initial = self.initial_state.clone().ok_or(FsmError::NotCompiled)?;

        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, initial_state = %initial, "fsm run started");

        let mut current = initial.clone();
        let mut current_input = initial_request.to_owned();
        let mut last_stable = initial;
        let mut last_output = String::new();
        let mut final_output = String::new();

        for step in 0..self.max_steps {
            let kind = self.kind_of(&current);
            info!(run_id = %run_id, step, state = %current, kind = ?kind, "fsm step");

            if kind == StateKind::End {
                info!(run_id = %run_id, state = %current, "end state reached");
                final_output = last_output;
                break;
            }

            if kind == StateKind::Error {
                warn!(run_id = %run_id, last_stable = %last_stable, "in error state, attempting recovery");
                let Some(target) = self.states.get_mut(&last_stable) else {
                    final_output = FAILED.to_owned();
                    break;
                };
                if target.retry() {
                    info!(
                        run_id = %run_id,
                        target = %target.name,
                        retries_left = target.retries_left,
                        "recovering to last stable state"
                    );
                    current = last_stable.clone();
                    continue;
                }
                error!(run_id = %run_id, target = %target.name, "recovery failed, retries exhausted");
                final_output = FAILED.to_owned();
                break;
            }

            if kind == StateKind::Stable && current != last_stable {
                if let Some(state) = self.states.get_mut(&current) {
                    state.reset_retries();
                }
            }
            if kind == StateKind::Stable || kind == StateKind::Start {
                last_stable = current.clone();
            }

            let started = Instant::now();
            let result = match self.states.get_mut(&current) {
                Some(state) => state.execute(&current_input).await,
                None => Err(AgentError::Configuration(format!(
                    "state '{current}' disappeared"
                ))),
            };
            let result = match result {
                Ok(result) => {
                    debug!(
                        run_id = %run_id,
                        state = %current,
                        next = %result.next_state,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "state executed"
                    );
                    result
                }
                Err(e) => {
                    error!(
                        run_id = %run_id,
                        state = %current,
                        error = %e,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "state execution failed"
                    );
                    StateExecutionResult {
                        next_state: "ERROR".to_owned(),
                        output: e.to_string(),
                    }
                }
            };

            last_output = result.output.clone();
            current_input = result.output;
            let decided = result.next_state.trim().to_owned();
            current = self.resolve_transition(&current, &decided);
        }

        Ok(final_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::chat::{ChatResponse, mock::MockChat};

    fn plain_agent(outputs: Vec<&str>) -> Agent {
        Agent::builder("test-agent")
            .model(
                "model",
                MockChat::from_texts("m", outputs.into_iter().map(str::to_owned).collect()),
            )
            .build()
            .unwrap()
    }

    fn verifier_agent(decisions: Vec<&str>) -> Verifier {
        let responses: Vec<ChatResponse> = decisions
            .into_iter()
            .map(|d| ChatResponse::from_text(json!({"next_state": d}).to_string()))
            .collect();
        let agent = Agent::builder("verifier")
            .model("model", MockChat::with_responses("m", responses))
            .build()
            .unwrap();
        Verifier::agent(agent).unwrap()
    }

    mod topology {
        use super::*;

        #[test]
        fn requires_exactly_one_start() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::end("E")).unwrap();
            assert!(matches!(fsm.compile(), Err(FsmError::StartStateCount(0))));

            fsm.add_state(State::start("S1")).unwrap();
            fsm.add_state(State::start("S2")).unwrap();
            assert!(matches!(fsm.compile(), Err(FsmError::StartStateCount(2))));
        }

        #[test]
        fn requires_an_end_state() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            assert!(matches!(fsm.compile(), Err(FsmError::NoEndState)));
        }

        #[test]
        fn requires_start_transition() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            fsm.add_state(State::end("E")).unwrap();
            assert!(matches!(fsm.compile(), Err(FsmError::StartTransitions(_))));
        }

        #[test]
        fn requires_reachable_end() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            fsm.add_state(State::stable(
                "A",
                vec![],
                plain_agent(vec!["x"]),
                Verifier::forward("A"),
            ))
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "A", "loop")).unwrap();
            assert!(matches!(fsm.compile(), Err(FsmError::EndUnreachable)));
        }

        #[test]
        fn rejects_duplicate_states() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            assert!(matches!(
                fsm.add_state(State::start("S")),
                Err(FsmError::DuplicateState(_))
            ));
        }

        #[test]
        fn rejects_dangling_transitions() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            assert!(matches!(
                fsm.add_transition(Transition::new("S", "ghost", "")),
                Err(FsmError::UnknownTarget(_))
            ));
            assert!(matches!(
                fsm.add_transition(Transition::new("ghost", "S", "")),
                Err(FsmError::UnknownSource(_))
            ));
        }

        #[test]
        fn rejects_unknown_subscription() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            fsm.add_state(State::stable(
                "A",
                vec!["ghost".into()],
                plain_agent(vec!["x"]),
                Verifier::forward("E"),
            ))
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "E", "")).unwrap();
            assert!(matches!(
                fsm.compile(),
                Err(FsmError::UnknownSubscription { .. })
            ));
        }
    }

    mod compilation {
        use super::*;

        fn two_way_fsm() -> Fsm {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S")).unwrap();
            fsm.add_state(State::stable(
                "A",
                vec![],
                plain_agent(vec!["out"]),
                verifier_agent(vec!["B"]),
            ))
            .unwrap();
            fsm.add_state(State::end("B")).unwrap();
            fsm.add_state(State::end("C")).unwrap();
            fsm.add_transition(Transition::new("S", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "B", "on success"))
                .unwrap();
            fsm.add_transition(Transition::new("A", "C", "on failure"))
                .unwrap();
            fsm
        }

        #[test]
        fn verifier_prompt_lists_every_target() {
            let mut fsm = two_way_fsm();
            fsm.compile().unwrap();
            let prompts = fsm.state("A").unwrap().verifier_sysprompts();
            let compiled = prompts.last().unwrap();
            assert!(compiled.contains("\"target\":\"B\""));
            assert!(compiled.contains("\"target\":\"C\""));
            assert!(compiled.contains("on success"));
            assert!(compiled.starts_with(DEFAULT_VERIFIER_PREAMBLE));
        }

        #[test]
        fn compile_twice_is_idempotent() {
            let mut fsm = two_way_fsm();
            fsm.compile().unwrap();
            let before = fsm.state("A").unwrap().verifier_sysprompts();
            fsm.compile().unwrap();
            let after = fsm.state("A").unwrap().verifier_sysprompts();
            assert_eq!(before, after);
        }

        #[test]
        fn start_state_learns_its_target() {
            let mut fsm = two_way_fsm();
            fsm.compile().unwrap();
            assert_eq!(fsm.state("S").unwrap().forward_target.as_deref(), Some("A"));
        }
    }

    mod retries {
        use super::*;

        #[test]
        fn retry_consumes_budget() {
            let mut state = State::stable(
                "A",
                vec![],
                plain_agent(vec!["x"]),
                Verifier::forward("E"),
            )
            .with_max_retries(2);
            assert!(state.retry());
            assert!(state.retry());
            assert!(!state.retry());
            state.reset_retries();
            assert!(state.retry());
        }

        #[test]
        fn zero_budget_never_retries() {
            let mut state = State::stable(
                "A",
                vec![],
                plain_agent(vec!["x"]),
                Verifier::forward("E"),
            )
            .with_max_retries(0);
            assert!(!state.retry());
        }
    }

    mod driving {
        use super::*;

        #[tokio::test]
        async fn single_agent_happy_path() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(State::stable(
                "A",
                vec![],
                plain_agent(vec!["done"]),
                Verifier::forward("E"),
            ))
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "E", "")).unwrap();

            assert_eq!(fsm.run("go").await.unwrap(), "done");
        }

        #[tokio::test]
        async fn transition_miss_recovers_and_succeeds() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(
                State::stable(
                    "A",
                    vec![],
                    plain_agent(vec!["first", "second"]),
                    verifier_agent(vec!["nope", "B"]),
                )
                .with_max_retries(1),
            )
            .unwrap();
            fsm.add_state(State::end("B")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "B", "ok")).unwrap();

            assert_eq!(fsm.run("x").await.unwrap(), "second");
        }

        #[tokio::test]
        async fn recovery_exhaustion_fails() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(
                State::stable(
                    "A",
                    vec![],
                    plain_agent(vec!["out"]),
                    verifier_agent(vec!["nope"]),
                )
                .with_max_retries(1),
            )
            .unwrap();
            fsm.add_state(State::end("B")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "B", "ok")).unwrap();

            assert_eq!(fsm.run("x").await.unwrap(), FAILED);
        }

        #[tokio::test]
        async fn zero_retries_fail_immediately() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(
                State::stable(
                    "A",
                    vec![],
                    plain_agent(vec!["out"]),
                    verifier_agent(vec!["nope"]),
                )
                .with_max_retries(0),
            )
            .unwrap();
            fsm.add_state(State::end("B")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "B", "ok")).unwrap();

            assert_eq!(fsm.run("x").await.unwrap(), FAILED);
        }

        #[tokio::test]
        async fn agent_exception_routes_to_error_and_recovers() {
            // The agent's first output violates its schema, which is fatal
            // to the execution; the FSM captures it and retries.
            let agent = Agent::builder("a")
                .model(
                    "model",
                    MockChat::from_texts(
                        "m",
                        vec!["not json".into(), r#"{"decision": "ok"}"#.into()],
                    ),
                )
                .output_schema(
                    json!({"decision": "the decision"}),
                    json!({
                        "type": "object",
                        "properties": {"decision": {"type": "string"}},
                        "required": ["decision"]
                    }),
                )
                .build()
                .unwrap();

            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(
                State::stable("A", vec![], agent, Verifier::forward("E")).with_max_retries(1),
            )
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "E", "")).unwrap();

            assert_eq!(fsm.run("x").await.unwrap(), r#"{"decision":"ok"}"#);
        }

        #[tokio::test]
        async fn max_steps_bounds_the_loop() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(State::stable(
                "A",
                vec![],
                plain_agent(vec!["looping"]),
                Verifier::forward("A"),
            ))
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "A", "loop")).unwrap();
            fsm.add_transition(Transition::new("A", "E", "never")).unwrap();
            fsm.set_max_steps(5);

            // The loop halts; whatever it returns is bounded, not hung.
            let result = fsm.run("x").await.unwrap();
            assert_eq!(result, "");
        }

        #[tokio::test]
        async fn max_steps_one_halts_trivial_fsm() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "E", "")).unwrap();
            fsm.set_max_steps(1);
            let result = fsm.run("x").await.unwrap();
            assert!(result.is_empty() || result == "x");
        }

        #[tokio::test]
        async fn trivial_fsm_forwards_initial_request() {
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "E", "")).unwrap();
            assert_eq!(fsm.run("payload").await.unwrap(), "payload");
        }

        #[tokio::test]
        async fn subscriber_reads_producer_output() {
            // B subscribes to A and to the initial context; its sockets are
            // wired during compile and read during its execution.
            let mut fsm = Fsm::new();
            fsm.add_state(State::start("S0")).unwrap();
            fsm.add_state(
                State::stable(
                    "A",
                    vec![],
                    plain_agent(vec!["alpha output"]),
                    Verifier::forward("B"),
                )
                .with_description("produces alpha"),
            )
            .unwrap();
            fsm.add_state(State::stable(
                "B",
                vec!["A".into(), INITIAL_CONTEXT_SOCKET.into()],
                plain_agent(vec!["beta output"]),
                Verifier::forward("E"),
            ))
            .unwrap();
            fsm.add_state(State::end("E")).unwrap();
            fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
            fsm.add_transition(Transition::new("A", "B", "")).unwrap();
            fsm.add_transition(Transition::new("B", "E", "")).unwrap();

            assert_eq!(fsm.run("the request").await.unwrap(), "beta output");
        }
    }
}
