use crate::dsl::{WorkflowDefinition, Node, Edge, NodeType, FieldBinding, labels};
use std::collections::BTreeMap;

pub struct WorkflowBuilder {
    id: String,
    name: String,
    version: u32,
    pub nodes: Vec<Node>, // public so tests can tweak nodes by hand
    edges: Vec<Edge>,
}

impl WorkflowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn start(self, key: &str) -> Self {
        self.node(key, NodeType::Start).build()
    }

    /// End node without output bindings. Use `node(key, NodeType::End)` to bind outputs.
    pub fn end(self, key: &str) -> Self {
        self.node(key, NodeType::End).build()
    }

    /// Condition evaluated from a comparison expression such as `input.age >= 18`.
    pub fn condition(self, key: &str, expression: &str) -> Self {
        self.node(key, NodeType::Condition { expression: Some(expression.to_string()) }).build()
    }

    pub fn node(self, key: &str, kind: NodeType) -> NodeBuilder {
        NodeBuilder {
            workflow_builder: self,
            key: key.to_string(),
            kind,
            inputs: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            label: None,
        });
        self
    }

    pub fn connect_labeled(mut self, source: &str, target: &str, label: &str) -> Self {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            label: Some(label.to_string()),
        });
        self
    }

    pub fn connect_if(self, source: &str, target: &str, branch: bool) -> Self {
        let label = if branch { labels::TRUE } else { labels::FALSE };
        self.connect_labeled(source, target, label)
    }

    pub fn connect_item(self, source: &str, target: &str) -> Self {
        self.connect_labeled(source, target, labels::ITEM)
    }

    pub fn connect_error(self, source: &str, target: &str) -> Self {
        self.connect_labeled(source, target, labels::ERROR)
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id,
            name: self.name,
            version: self.version,
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

pub struct NodeBuilder {
    workflow_builder: WorkflowBuilder,
    key: String,
    kind: NodeType,
    inputs: BTreeMap<String, FieldBinding>,
    timeout_ms: Option<u64>,
}

impl NodeBuilder {
    pub fn input(mut self, name: &str, binding: FieldBinding) -> Self {
        self.inputs.insert(name.to_string(), binding);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn build(mut self) -> WorkflowBuilder {
        self.workflow_builder.nodes.push(Node {
            key: self.key,
            kind: self.kind,
            inputs: self.inputs,
            timeout_ms: self.timeout_ms,
        });
        self.workflow_builder
    }
}
