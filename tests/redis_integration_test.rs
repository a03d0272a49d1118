mod support;

use std::sync::Arc;
use flowline::config::EngineConfig;
use flowline::dsl::builder::WorkflowBuilder;
use flowline::dsl::{FieldBinding, NodeKind, NodeType};
use flowline::runtime::engine::Engine;
use flowline::runtime::record::{ExecutionStatus, Finalization, NodeExecutionRecord, NodeState, WorkflowExecution};
use flowline::runtime::redis_storage::{RedisDefinitionStore, RedisExecutionStore};
use flowline::runtime::storage::ExecutionStore;
use serde_json::json;
use uuid::Uuid;

fn redis_client() -> redis::Client {
    let url = std::env::var("FLOWLINE_TEST_REDIS").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    redis::Client::open(url).expect("Invalid Redis URL")
}

#[tokio::test]
#[ignore] // Needs a running Redis; set FLOWLINE_TEST_REDIS to point elsewhere
async fn test_redis_backed_execution() {
    let client = redis_client();
    let plugin = Arc::new(support::FakePlugin::default());
    let engine = Engine::builder()
        .config(EngineConfig::default())
        .definition_store(Arc::new(RedisDefinitionStore::new(client.clone())))
        .execution_store(Arc::new(RedisExecutionStore::new(client.clone())))
        .plugin_runtime(plugin)
        .build();

    let workflow = WorkflowBuilder::new("redis-flow")
        .start("start")
        .node("each", NodeType::ForEach { concurrency: Some(2) })
        .input("items", FieldBinding::variable("input.values"))
        .build()
        .node("double", NodeType::Plugin { plugin_key: "double".into() })
        .input("value", FieldBinding::variable("loop.item"))
        .build()
        .node("end", NodeType::End)
        .input("doubled", FieldBinding::variable("each"))
        .build()
        .connect("start", "each")
        .connect_item("each", "double")
        .connect("each", "end")
        .build();
    engine.register_definition(workflow).await.expect("Failed to register");

    let execution = engine.execute("redis-flow", json!({ "values": [1, 2, 3] })).await.expect("Run failed");
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.final_output, Some(json!({ "doubled": [2, 4, 6] })));
    assert_eq!(execution.records_for("double").count(), 3);

    // A second engine over the same Redis sees the same run.
    let reader = RedisExecutionStore::new(client);
    let stored = reader.load_execution(execution.execution_id).await.expect("load").expect("exists");
    assert_eq!(stored, execution);
    let doubles = reader.load_records(execution.execution_id, Some("double")).await.expect("records");
    assert!(doubles.iter().all(|r| r.state == NodeState::Completed));
}

#[tokio::test]
#[ignore]
async fn test_redis_store_refuses_late_writes() {
    let store = RedisExecutionStore::new(redis_client());
    let id = Uuid::new_v4();
    let definition = WorkflowBuilder::new("late").start("start").end("end").connect("start", "end").build();
    store
        .create_execution(&WorkflowExecution::new(id, definition, json!({})))
        .await
        .expect("create");

    let mut record = NodeExecutionRecord::pending(0, "start", NodeKind::Start, "root");
    store.append_record(id, &record).await.expect("pending");
    record.start(json!({}));
    record.complete(json!({}));
    store.append_record(id, &record).await.expect("completed");
    assert!(store.append_record(id, &record).await.is_err());

    let finalization = Finalization {
        status: ExecutionStatus::Completed,
        final_output: None,
        error: None,
        completed_at: chrono::Utc::now(),
    };
    assert!(store.finalize_execution(id, &finalization).await.expect("finalize"));
    assert!(!store.finalize_execution(id, &finalization).await.expect("finalize"));

    let late = NodeExecutionRecord::pending(1, "end", NodeKind::End, "root");
    assert!(store.append_record(id, &late).await.is_err());
}
