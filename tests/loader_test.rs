use flowline::compiler::{load_definition_from_yaml, parse_definition, Compiler};
use flowline::config::EngineConfig;
use flowline::dsl::builder::WorkflowBuilder;
use flowline::dsl::{FieldBinding, FieldType, NodeType};
use flowline::services::{AggregateFunction, DataOperation};
use serde_json::json;
use std::fs;
use std::time::Duration;

#[test]
fn test_load_yaml_workflow() {
    let yaml_content = r#"
id: "greeting"
name: "Greeting Flow"
version: 3
nodes:
  - key: "start"
    type: "start"
  - key: "each"
    type: "for_each"
    concurrency: 2
    inputs:
      items:
        type: "variable"
        expression: "input.names"
        field_type: "array"
  - key: "hello"
    type: "plugin"
    plugin_key: "greet"
    timeout_ms: 500
    inputs:
      text:
        type: "string_interpolation"
        expression: "Hello {loop.item}"
  - key: "end"
    type: "end"
    inputs:
      all:
        type: "variable"
        expression: "each"
edges:
  - source: "start"
    target: "each"
  - source: "each"
    target: "hello"
    label: "item"
  - source: "each"
    target: "end"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("greeting.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let loaded = load_definition_from_yaml(&file_path).expect("Failed to load workflow from YAML");

    let expected = WorkflowBuilder::new("greeting")
        .name("Greeting Flow")
        .version(3)
        .start("start")
        .node("each", NodeType::ForEach { concurrency: Some(2) })
        .input("items", FieldBinding::variable("input.names").typed(FieldType::Array))
        .build()
        .node("hello", NodeType::Plugin { plugin_key: "greet".into() })
        .input("text", FieldBinding::template("Hello {loop.item}"))
        .timeout_ms(500)
        .build()
        .node("end", NodeType::End)
        .input("all", FieldBinding::variable("each"))
        .build()
        .connect("start", "each")
        .connect_item("each", "hello")
        .connect("each", "end")
        .build();

    assert_eq!(loaded, expected);
    assert!(Compiler::new().compile(loaded).is_ok());

    temp_dir.close().expect("Failed to close temp dir");
}

#[test]
fn test_load_json_workflow() {
    let definition = json!({
        "id": "sum-cart",
        "nodes": [
            { "key": "start", "type": "start" },
            {
                "key": "total",
                "type": "data_process",
                "operation": { "op": "aggregate", "function": "sum", "field": "price" },
                "inputs": { "data": { "type": "json_path", "expression": "$.input.cart" } }
            },
            {
                "key": "end",
                "type": "end",
                "inputs": { "total": { "type": "variable", "expression": "total" } }
            }
        ],
        "edges": [
            { "source": "start", "target": "total" },
            { "source": "total", "target": "end" }
        ]
    });

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("sum.json");
    fs::write(&file_path, serde_json::to_string_pretty(&definition).expect("serialize")).expect("write");

    let loaded = load_definition_from_yaml(&file_path).expect("Failed to load workflow from JSON");
    assert_eq!(loaded.id, "sum-cart");
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.name, "");
    let total = loaded.node("total").expect("total node");
    assert_eq!(
        total.kind,
        NodeType::DataProcess {
            operation: DataOperation::Aggregate { function: AggregateFunction::Sum, field: Some("price".into()) }
        }
    );
    assert_eq!(total.inputs["data"], FieldBinding::json_path("$.input.cart"));
}

#[test]
fn test_fixed_binding_keeps_any_literal() {
    let yaml = r#"
id: "literals"
nodes:
  - key: "start"
    type: "start"
  - key: "end"
    type: "end"
    inputs:
      limits:
        type: "fixed"
        expression: { max: 3, tags: ["a", "b"] }
      enabled:
        type: "fixed"
        expression: true
edges:
  - source: "start"
    target: "end"
"#;
    let loaded = parse_definition(yaml).expect("parse");
    let end = loaded.node("end").expect("end node");
    assert_eq!(end.inputs["limits"], FieldBinding::fixed(json!({ "max": 3, "tags": ["a", "b"] })));
    assert_eq!(end.inputs["enabled"], FieldBinding::fixed(true));
}

#[test]
fn test_load_errors_name_the_file() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = temp_dir.path().join("missing.yaml");
    let err = load_definition_from_yaml(&missing).expect_err("missing file should fail");
    assert!(format!("{:#}", err).contains("missing.yaml"));

    let broken = temp_dir.path().join("broken.yaml");
    fs::write(&broken, "id: x\nnodes:\n  - key: a\n    type: teleport\n").expect("write");
    let err = load_definition_from_yaml(&broken).expect_err("unknown node type should fail");
    assert!(format!("{:#}", err).contains("broken.yaml"));
}

#[test]
fn test_engine_config_from_yaml() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("engine.yaml");
    fs::write(&path, "foreach_concurrency: 8\ntimeouts:\n  plugin_ms: 1500\n").expect("write");

    let config = EngineConfig::from_yaml_file(&path).expect("Failed to load config");
    assert_eq!(config.foreach_concurrency(), 8);
    assert_eq!(config.timeouts.plugin_ms, 1500);
    // Unset fields keep their defaults.
    assert_eq!(config.timeouts.ai_chat_ms, 120_000);

    let plugin = WorkflowBuilder::new("x")
        .node("p", NodeType::Plugin { plugin_key: "k".into() })
        .build()
        .node("q", NodeType::Plugin { plugin_key: "k".into() })
        .timeout_ms(20)
        .build()
        .node("c", NodeType::Condition { expression: Some("true".into()) })
        .build()
        .build();
    let timeout = |key: &str| plugin.node(key).and_then(|n| config.timeout_for(n));
    assert_eq!(timeout("p"), Some(Duration::from_millis(1500)));
    assert_eq!(timeout("q"), Some(Duration::from_millis(20)));
    assert_eq!(timeout("c"), None);
}

#[test]
fn test_empty_config_uses_defaults() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("empty.yaml");
    fs::write(&path, "{}\n").expect("write");

    let config = EngineConfig::from_yaml_file(&path).expect("Failed to load config");
    assert_eq!(config, EngineConfig::default());

    let zero = EngineConfig { foreach_concurrency: 0, ..EngineConfig::default() };
    assert_eq!(zero.foreach_concurrency(), 1);
}
