use std::collections::HashMap;
use std::sync::Arc;

use crate::dsl::{labels, Node, WorkflowDefinition};

pub type NodeIndex = usize;

/// 编译后的蓝图
///
/// A validated definition plus the lookup tables the scheduler needs: node
/// index by key and outgoing edges per node. Produced only by the compiler.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub definition: Arc<WorkflowDefinition>,
    pub start: String,
    index: HashMap<String, NodeIndex>,
    /// node key -> [(label, target)] in declaration order
    outgoing: HashMap<String, Vec<(Option<String>, String)>>,
    /// node key -> node keys its bindings read
    dependencies: HashMap<String, Vec<String>>,
}

impl Blueprint {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        start: String,
        index: HashMap<String, NodeIndex>,
        outgoing: HashMap<String, Vec<(Option<String>, String)>>,
        dependencies: HashMap<String, Vec<String>>,
    ) -> Self {
        Self { definition, start, index, outgoing, dependencies }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.index.get(key).map(|&i| &self.definition.nodes[i])
    }

    /// Targets of `key`'s edges carrying `label`; `None` selects unlabeled edges.
    pub fn successors(&self, key: &str, label: Option<&str>) -> Vec<String> {
        self.outgoing
            .get(key)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(l, _)| l.as_deref() == label)
                    .map(|(_, target)| target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Node keys whose outputs `key` reads.
    pub fn dependencies(&self, key: &str) -> &[String] {
        self.dependencies.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every edge target of `key`, whatever the label.
    pub fn targets(&self, key: &str) -> impl Iterator<Item = &str> {
        self.outgoing.get(key).into_iter().flatten().map(|(_, target)| target.as_str())
    }

    /// Distinct fork branch labels leaving `key`, sorted.
    pub fn branch_labels(&self, key: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .outgoing
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|(l, _)| l.as_deref())
            .filter(|l| labels::is_branch(l))
            .map(str::to_string)
            .collect();
        found.sort();
        found.dedup();
        found
    }
}
