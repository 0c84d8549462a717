//! End-to-end tests for the conductor framework.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use conductor::chat::parse_tool_calls;
use conductor::prelude::*;
use conductor::tool::{parameters_object, schema};

/// A calculator provider with a single `Calc.add` tool.
struct Calc {
    invocations: Arc<AtomicUsize>,
}

impl Calc {
    fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                invocations: Arc::clone(&invocations),
            }),
            invocations,
        )
    }
}

struct AddTool {
    meta: ToolMeta,
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for AddTool {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn arg_names(&self) -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn parameters(&self) -> Value {
        parameters_object(&[
            ("a", schema::integer(), true),
            ("b", schema::integer(), true),
        ])
    }

    async fn call(&self, args: &ToolArgs) -> ToolResult<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
        let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
        Ok((a + b).to_string())
    }
}

impl ToolProvider for Calc {
    fn provider_name(&self) -> &str {
        "Calc"
    }

    fn tools(&self) -> Vec<SharedTool> {
        vec![Arc::new(AddTool {
            meta: ToolMeta::new("Calc.add", "Adds two integers."),
            invocations: Arc::clone(&self.invocations),
        })]
    }
}

/// Deterministic embedder for the alignment scenario: the misspelled tool
/// name shares a direction with the registered one, unknown text does not.
struct TestEmbedder;

impl Embedder for TestEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, AlignError> {
        let vector = match text {
            "Calc.add" | "Calculator.ad" => vec![1.0, 0.0, 0.0],
            "a" => vec![0.0, 1.0, 0.0],
            "b" => vec![0.0, 0.0, 1.0],
            _ => vec![-1.0, 0.0, 0.0],
        };
        Ok(vector)
    }
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

fn tool_call(name: &str, a: i64, b: i64) -> ToolCall {
    let mut args = ToolArgs::new();
    args.insert("a".into(), json!(a));
    args.insert("b".into(), json!(b));
    ToolCall::new(name, args)
}

#[tokio::test]
async fn single_agent_happy_path() {
    let agent = Agent::builder("worker")
        .model("model", MockChat::from_texts("m", vec!["done".into()]))
        .build()
        .unwrap();

    let mut fsm = Fsm::new();
    fsm.add_state(State::start("S0")).unwrap();
    fsm.add_state(State::stable("A", vec![], agent, Verifier::forward("E")))
        .unwrap();
    fsm.add_state(State::end("E")).unwrap();
    fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
    fsm.add_transition(Transition::new("A", "E", "")).unwrap();

    assert_eq!(fsm.run("go").await.unwrap(), "done");
}

#[tokio::test]
async fn transition_miss_then_recovery() {
    let agent = Agent::builder("worker")
        .model(
            "model",
            MockChat::from_texts("m", vec!["first try".into(), "second try".into()]),
        )
        .build()
        .unwrap();

    let mut fsm = Fsm::new();
    fsm.add_state(State::start("S0")).unwrap();
    fsm.add_state(
        State::stable("A", vec![], agent, verifier_agent(vec!["nope", "B"]))
            .with_max_retries(1),
    )
    .unwrap();
    fsm.add_state(State::end("B")).unwrap();
    fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
    fsm.add_transition(Transition::new("A", "B", "ok")).unwrap();

    assert_eq!(fsm.run("x").await.unwrap(), "second try");
}

#[tokio::test]
async fn recovery_exhausted_returns_failed() {
    let agent = Agent::builder("worker")
        .model("model", MockChat::from_texts("m", vec!["output".into()]))
        .build()
        .unwrap();

    let mut fsm = Fsm::new();
    fsm.add_state(State::start("S0")).unwrap();
    fsm.add_state(
        State::stable("A", vec![], agent, verifier_agent(vec!["nope"])).with_max_retries(1),
    )
    .unwrap();
    fsm.add_state(State::end("B")).unwrap();
    fsm.add_transition(Transition::new("S0", "A", "")).unwrap();
    fsm.add_transition(Transition::new("A", "B", "ok")).unwrap();

    assert_eq!(fsm.run("x").await.unwrap(), "FAILED");
}

#[tokio::test]
async fn misaligned_tool_name_is_repaired() {
    let (calc, invocations) = Calc::new();
    let chat = MockChat::with_responses(
        "m",
        vec![
            ChatResponse::from_tool_calls(vec![tool_call("Calculator.ad", 1, 2)]),
            ChatResponse::from_text("3"),
        ],
    );
    let aligner = ToolAligner::new(Arc::new(TestEmbedder), 85.0, 0.9, 80.0, 0.9);
    let mut agent = Agent::builder("calc-agent")
        .model("model", chat)
        .provider("model", calc)
        .aligner(aligner)
        .build()
        .unwrap();

    let result = agent.execute("add 1 and 2").await.unwrap();
    assert_eq!(result.output, "3");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn misaligned_tool_name_without_aligner_is_fatal() {
    let (calc, _) = Calc::new();
    let chat = MockChat::with_responses(
        "m",
        vec![ChatResponse::from_tool_calls(vec![tool_call(
            "Calculator.ad",
            1,
            2,
        )])],
    );
    let mut agent = Agent::builder("calc-agent")
        .model("model", chat)
        .provider("model", calc)
        .build()
        .unwrap();

    let err = agent.execute("add 1 and 2").await.unwrap_err();
    assert!(matches!(err, AgentError::Tool(ToolError::NotFound(_))));
}

#[test]
fn induced_tool_call_round_trip() {
    let content = "prefix {\"tool_calls\":[{\"name\":\"Fs.ls\",\"args\":{\"path\":\"/tmp\"}}]} suffix";
    let calls = parse_tool_calls(content);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "Fs.ls");
    assert_eq!(calls[0].args["path"], "/tmp");
}

#[test]
fn background_subprocess_drains_in_order() {
    let runner = CommandRunner::new();
    let monitor = runner
        .run_background(
            "sh",
            &[
                "-c".to_owned(),
                "echo hello; sleep 0.2; echo world".to_owned(),
            ],
            1,
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !monitor.has_new_stdout() {
        assert!(Instant::now() < deadline, "no stdout before deadline");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(monitor.drain_stdout(), "hello\n");

    while !monitor.is_finished() {
        assert!(Instant::now() < deadline, "process did not finish");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(monitor.drain_stdout(), "world\n");
    assert_eq!(monitor.exit_code(), Some(0));
}

#[tokio::test]
async fn full_pipeline_with_tools_schema_and_subscriptions() {
    // A coder agent calls a tool, then reports through a schema; a reviewer
    // subscribed to the coder and the initial request approves it.
    let (calc, _) = Calc::new();
    let coder_chat = MockChat::with_responses(
        "coder-m",
        vec![
            ChatResponse::from_tool_calls(vec![tool_call("Calc.add", 20, 22)]),
            ChatResponse::from_text(r#"{"content": {"answer": "42"}}"#),
        ],
    );
    let coder = Agent::builder("coder")
        .model("model", coder_chat)
        .provider("model", calc)
        .output_schema(
            json!({"answer": "the computed answer"}),
            json!({
                "type": "object",
                "properties": {"answer": {"type": "string"}},
                "required": ["answer"]
            }),
        )
        .build()
        .unwrap();

    let reviewer = Agent::builder("reviewer")
        .model(
            "model",
            MockChat::from_texts("reviewer-m", vec![r#"{"decision": "APPROVE"}"#.into()]),
        )
        .output_schema(
            json!({"decision": "APPROVE or DISAPPROVE"}),
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
        State::stable("code", vec![], coder, Verifier::forward("review"))
            .with_description("writes the answer"),
    )
    .unwrap();
    fsm.add_state(State::stable(
        "review",
        vec!["code".into(), "__initial_context__".into()],
        reviewer,
        verifier_agent(vec!["done"]),
    ))
    .unwrap();
    fsm.add_state(State::end("done")).unwrap();
    fsm.add_transition(Transition::new("S0", "code", "")).unwrap();
    fsm.add_transition(Transition::new("code", "review", "answer produced"))
        .unwrap();
    fsm.add_transition(Transition::new("review", "done", "approved"))
        .unwrap();

    let output = fsm.run("compute the answer").await.unwrap();
    assert_eq!(output, r#"{"decision":"APPROVE"}"#);
}
