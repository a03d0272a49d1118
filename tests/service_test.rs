mod support;

use std::sync::Arc;
use std::time::Duration;
use flowline::config::{EngineConfig, TimeoutConfig};
use flowline::dsl::builder::WorkflowBuilder;
use flowline::dsl::{FieldBinding, NodeKind, NodeType, WorkflowDefinition};
use flowline::runtime::engine::Engine;
use flowline::runtime::error::{DefinitionError, EngineError, ErrorKind};
use flowline::runtime::record::{ExecutionStatus, NodeState};
use flowline::services::{AggregateFunction, DataOperation};
use serde_json::json;

/// start -> prep(echo) -> step -> end(result = step)
fn around(step: NodeType, inputs: Vec<(&str, FieldBinding)>, timeout_ms: Option<u64>) -> WorkflowDefinition {
    let mut node = WorkflowBuilder::new("svc")
        .start("start")
        .node("prep", NodeType::Plugin { plugin_key: "echo".into() })
        .build()
        .node("step", step);
    for (name, binding) in inputs {
        node = node.input(name, binding);
    }
    if let Some(ms) = timeout_ms {
        node = node.timeout_ms(ms);
    }
    node.build()
        .node("end", NodeType::End)
        .input("result", FieldBinding::variable("step"))
        .build()
        .connect("start", "prep")
        .connect("prep", "step")
        .connect("step", "end")
        .build()
}

fn plugin(key: &str) -> NodeType {
    NodeType::Plugin { plugin_key: key.into() }
}

#[tokio::test]
async fn test_plugin_receives_resolved_inputs() {
    let (engine, plugin_runtime) = support::engine();
    let workflow = around(
        plugin("echo"),
        vec![("city", FieldBinding::variable("input.city")), ("units", FieldBinding::fixed("metric"))],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({ "city": "Oslo" })).await.expect("Run failed");
    assert_eq!(execution.final_output, Some(json!({ "result": { "city": "Oslo", "units": "metric" } })));
    assert_eq!(plugin_runtime.calls_to("echo").last(), Some(&json!({ "city": "Oslo", "units": "metric" })));
}

#[tokio::test]
async fn test_plugin_timeout_fails_the_node() {
    let (engine, _) = support::engine();
    engine.register_definition(around(plugin("hang"), vec![], Some(50))).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.count_in_state(NodeState::Failed), 1);
    assert_eq!(execution.records_for("prep").next().map(|r| r.state), Some(NodeState::Completed));
    assert_eq!(execution.records_for("start").next().map(|r| r.state), Some(NodeState::Completed));

    let step = execution.records_for("step").next().expect("step record");
    let info = step.error.as_ref().expect("error info");
    assert_eq!(info.kind, ErrorKind::ExternalService);
    assert!(info.message.contains("timed out after 50ms"), "{}", info.message);
}

#[tokio::test]
async fn test_configured_timeout_applies_per_node_type() {
    let config = EngineConfig {
        timeouts: TimeoutConfig { plugin_ms: 40, ..TimeoutConfig::default() },
        ..EngineConfig::default()
    };
    let engine = support::engine_with(config, Arc::new(support::FakePlugin::default()));
    engine.register_definition(around(plugin("hang"), vec![], None)).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let step = execution.records_for("step").next().expect("step record");
    assert!(step.error.as_ref().is_some_and(|e| e.message.contains("timed out after 40ms")));
}

#[tokio::test]
async fn test_cancellation_stops_a_running_node() {
    let (engine, _) = support::engine();
    let engine = Arc::new(engine);
    engine.register_definition(around(plugin("hang"), vec![], None)).await.expect("Failed to register");

    let id = engine.start_execution("svc", json!({})).await.expect("Failed to start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel_execution(id));

    let execution = tokio::time::timeout(Duration::from_secs(5), engine.wait_for(id))
        .await
        .expect("cancelled run did not stop")
        .expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(execution.final_output.is_none());
    let step = execution.records_for("step").next().expect("step record");
    assert_eq!(step.state, NodeState::Failed);
    assert_eq!(step.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
    assert_eq!(execution.records_for("end").count(), 0);
    assert!(!engine.cancel_execution(id));
}

#[tokio::test]
async fn test_cancellation_reaches_loop_iterations() {
    let (engine, plugin_runtime) = support::engine();
    let engine = Arc::new(engine);
    let workflow = WorkflowBuilder::new("slow-loop")
        .start("start")
        .node("each", NodeType::ForEach { concurrency: None })
        .input("items", FieldBinding::variable("input.list"))
        .build()
        .node("step", plugin("slow"))
        .input("delay_ms", FieldBinding::fixed(40))
        .build()
        .end("end")
        .connect("start", "each")
        .connect_item("each", "step")
        .connect("each", "end")
        .build();
    engine.register_definition(workflow).await.expect("Failed to register");

    let id = engine
        .start_execution("slow-loop", json!({ "list": [1, 2, 3, 4, 5, 6, 7, 8, 9, 10] }))
        .await
        .expect("Failed to start");
    tokio::time::sleep(Duration::from_millis(60)).await;
    engine.cancel_execution(id);

    let execution = engine.wait_for(id).await.expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(plugin_runtime.call_count() < 10);
    assert!(execution.history.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn test_cancellation_reaches_every_fork_branch() {
    let (engine, plugin_runtime) = support::engine();
    let engine = Arc::new(engine);
    let workflow = WorkflowBuilder::new("stuck-fan")
        .start("start")
        .node("fan", NodeType::Fork)
        .build()
        .node("left", plugin("hang"))
        .build()
        .node("right", plugin("hang"))
        .build()
        .end("end")
        .connect("start", "fan")
        .connect_labeled("fan", "left", "branch-a")
        .connect_labeled("fan", "right", "branch-b")
        .connect("fan", "end")
        .build();
    engine.register_definition(workflow).await.expect("Failed to register");

    let id = engine.start_execution("stuck-fan", json!({})).await.expect("Failed to start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(plugin_runtime.call_count(), 2);
    assert!(engine.cancel_execution(id));

    let execution = tokio::time::timeout(Duration::from_secs(5), engine.wait_for(id))
        .await
        .expect("cancelled fork did not stop")
        .expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    for key in ["left", "right", "fan"] {
        let record = execution.records_for(key).next().expect("record");
        assert_eq!(record.state, NodeState::Failed, "{}", key);
        assert_eq!(record.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled), "{}", key);
    }
    assert_eq!(execution.records_for("end").count(), 0);
}

#[tokio::test]
async fn test_plugin_failure_is_external_service() {
    let (engine, _) = support::engine();
    engine.register_definition(around(plugin("fail"), vec![], None)).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.as_deref().expect("error message");
    assert!(error.contains("plugin call failed: plugin exploded"), "{}", error);
}

#[tokio::test]
async fn test_wiki_returns_documents() {
    let (engine, _) = support::engine();
    let workflow = around(
        NodeType::Wiki { wiki_ids: vec!["kb1".into(), "kb2".into()] },
        vec![("query", FieldBinding::template("what is {input.topic}"))],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({ "topic": "rust" })).await.expect("Run failed");
    let output = execution.final_output.expect("final output");
    let documents = output["result"]["documents"].as_array().expect("documents");
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0]["id"], "kb1-1");
    assert_eq!(documents[1]["content"], "about what is rust");
}

#[tokio::test]
async fn test_wiki_query_must_be_text() {
    let (engine, _) = support::engine();
    let workflow = around(
        NodeType::Wiki { wiki_ids: vec!["kb1".into()] },
        vec![("query", FieldBinding::fixed(42))],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    let step = execution.records_for("step").next().expect("step record");
    assert_eq!(step.error.as_ref().map(|e| e.kind), Some(ErrorKind::TypeMismatch));
}

#[tokio::test]
async fn test_ai_chat_builds_conversation() {
    let (engine, _) = support::engine();
    let workflow = around(
        NodeType::AiChat {
            model_id: "small".into(),
            settings: json!({ "temperature": 0.2 }),
            system_prompt: Some("be brief".into()),
        },
        vec![
            ("messages", FieldBinding::fixed(json!([{ "role": "assistant", "content": "hello" }]))),
            ("prompt", FieldBinding::template("hi {input.name}")),
        ],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({ "name": "Ada" })).await.expect("Run failed");
    let output = execution.final_output.expect("final output");
    assert_eq!(output["result"]["text"], "[small] system:be brief|assistant:hello|user:hi Ada");
    assert_eq!(output["result"]["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn test_ai_chat_rejects_malformed_messages() {
    let (engine, _) = support::engine();
    let workflow = around(
        NodeType::AiChat { model_id: "small".into(), settings: json!(null), system_prompt: None },
        vec![("messages", FieldBinding::fixed(json!(["not a message"])))],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    let step = execution.records_for("step").next().expect("step record");
    assert_eq!(step.error.as_ref().map(|e| e.kind), Some(ErrorKind::TypeMismatch));
}

#[tokio::test]
async fn test_javascript_gets_inputs_and_timeout() {
    let (engine, _) = support::engine();
    let code = NodeType::JavaScript { code: "return x + 1".into() };

    engine
        .register_definition(around(code.clone(), vec![("x", FieldBinding::variable("input.x"))], Some(500)))
        .await
        .expect("Failed to register");
    let execution = engine.execute("svc", json!({ "x": 1 })).await.expect("Run failed");
    assert_eq!(
        execution.final_output,
        Some(json!({ "result": { "code": "return x + 1", "inputs": { "x": 1 }, "timeout_ms": 500 } }))
    );

    // Without a node timeout the configured default is used.
    engine
        .register_definition(around(code, vec![], None))
        .await
        .expect("Failed to register");
    let execution = engine.execute("svc", json!({})).await.expect("Run failed");
    let output = execution.final_output.expect("final output");
    assert_eq!(output["result"]["timeout_ms"], engine.config().timeouts.javascript_ms);
}

#[tokio::test]
async fn test_data_process_transforms_data() {
    let (engine, _) = support::engine();
    let workflow = around(
        NodeType::DataProcess { operation: DataOperation::Aggregate { function: AggregateFunction::Sum, field: Some("price".into()) } },
        vec![("data", FieldBinding::variable("input.cart"))],
        None,
    );
    engine.register_definition(workflow).await.expect("Failed to register");

    let cart = json!([{ "price": 3 }, { "price": 4.5 }, { "name": "free" }]);
    let execution = engine.execute("svc", json!({ "cart": cart })).await.expect("Run failed");
    assert_eq!(execution.final_output, Some(json!({ "result": 7.5 })));

    let execution = engine.execute("svc", json!({ "cart": "oops" })).await.expect("Run failed");
    let step = execution.records_for("step").next().expect("step record");
    assert_eq!(step.error.as_ref().map(|e| e.kind), Some(ErrorKind::ExternalService));
}

#[tokio::test]
async fn test_missing_collaborator_rejects_definition() {
    let engine = Engine::builder().build();
    let result = engine.register_definition(around(plugin("echo"), vec![], None)).await;
    assert!(matches!(
        result,
        Err(EngineError::Definition(DefinitionError::UnsupportedNode { kind: NodeKind::Plugin, .. }))
    ));
}
