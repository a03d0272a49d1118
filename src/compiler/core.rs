use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::dsl::{labels, Node, NodeKind, NodeType, WorkflowDefinition};
use crate::runtime::blueprint::{Blueprint, NodeIndex};
use crate::runtime::context::{INPUT, LOOP, RESERVED_NAMESPACES, SYS};
use crate::runtime::error::DefinitionError;
use crate::runtime::node::NodeRegistry;
use crate::runtime::{eval, expression};

type Outgoing = HashMap<String, Vec<(Option<String>, String)>>;

const ROOT_REGION: &str = "";

/// A scope in the static graph: the root, a for-each body, or a fork branch.
#[derive(Debug, Clone)]
struct Region {
    owner: Option<String>,
    in_loop: bool,
}

/// 编译器: 静态校验工作流定义并生成可执行蓝图
///
/// Nothing runs for a definition that fails here.
#[derive(Debug, Default)]
pub struct Compiler {
    supported: Option<HashSet<NodeKind>>,
}

impl Compiler {
    /// Structural validation only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also rejects node types with no executor in `registry`.
    pub fn for_registry(registry: &NodeRegistry) -> Self {
        Self {
            supported: Some(registry.kinds().collect()),
        }
    }

    pub fn compile(&self, workflow: WorkflowDefinition) -> Result<Blueprint, DefinitionError> {
        // 1. Pass 1: Indexing
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        for (idx, node) in workflow.nodes.iter().enumerate() {
            check_key(&node.key)?;
            if index.insert(node.key.clone(), idx).is_some() {
                return Err(DefinitionError::DuplicateNode(node.key.clone()));
            }
        }

        let starts: Vec<String> = workflow.nodes.iter()
            .filter(|n| n.kind() == NodeKind::Start)
            .map(|n| n.key.clone())
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(DefinitionError::MissingStart),
            [only] => only.clone(),
            _ => return Err(DefinitionError::MultipleStarts(starts)),
        };
        if !workflow.nodes.iter().any(|n| n.kind() == NodeKind::End) {
            return Err(DefinitionError::MissingEnd);
        }

        // 2. Pass 2: Adjacency
        let mut outgoing: Outgoing = HashMap::new();
        for edge in &workflow.edges {
            if !index.contains_key(&edge.source) || !index.contains_key(&edge.target) {
                return Err(DefinitionError::UnknownEdgeNode {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                });
            }
            outgoing.entry(edge.source.clone()).or_default().push((edge.label.clone(), edge.target.clone()));
        }
        let no_edges = Vec::new();
        for node in &workflow.nodes {
            check_edges(node, outgoing.get(&node.key).unwrap_or(&no_edges))?;
        }

        // 3. Pass 3: Shape
        check_acyclic(&workflow, &outgoing)?;
        let regions = assign_regions(&workflow, &start, &outgoing)?;

        // 4. Pass 4: Bindings
        let ancestors = Ancestors::new(&workflow, &outgoing);
        let mut dependencies = HashMap::new();
        for node in &workflow.nodes {
            check_inputs(node)?;
            let owners = owner_chain(&node.key, &regions);
            let region = regions.get(&node.key).and_then(|r| r.as_ref());
            let deps = check_references(node, region, &owners, &index, &ancestors)?;
            dependencies.insert(node.key.clone(), deps);
            if let Some(supported) = &self.supported {
                if !supported.contains(&node.kind()) {
                    return Err(DefinitionError::UnsupportedNode {
                        node: node.key.clone(),
                        kind: node.kind(),
                    });
                }
            }
        }

        Ok(Blueprint::new(Arc::new(workflow), start, index, outgoing, dependencies))
    }
}

fn check_key(key: &str) -> Result<(), DefinitionError> {
    let malformed = key.is_empty()
        || key.chars().any(|c| c.is_whitespace() || matches!(c, '.' | '[' | ']' | '{' | '}'))
        || RESERVED_NAMESPACES.contains(&key);
    if malformed {
        return Err(DefinitionError::InvalidNodeKey(key.to_string()));
    }
    Ok(())
}

fn check_edges(node: &Node, edges: &[(Option<String>, String)]) -> Result<(), DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidEdges {
        node: node.key.clone(),
        reason: reason.to_string(),
    };
    let count = |wanted: Option<&str>| edges.iter().filter(|(l, _)| l.as_deref() == wanted).count();

    let kind = node.kind();
    for (label, _) in edges {
        let Some(label) = label.as_deref() else { continue };
        let allowed = match kind {
            NodeKind::Start | NodeKind::End => false,
            NodeKind::Condition => matches!(label, labels::TRUE | labels::FALSE | labels::ERROR),
            NodeKind::ForEach => matches!(label, labels::ITEM | labels::ERROR),
            NodeKind::Fork => label == labels::ERROR || labels::is_branch(label),
            _ => label == labels::ERROR,
        };
        if !allowed {
            return Err(DefinitionError::InvalidEdgeLabel {
                node: node.key.clone(),
                label: label.to_string(),
            });
        }
    }

    match kind {
        NodeKind::Start if count(None) != 1 => Err(invalid("start needs exactly one default successor")),
        NodeKind::End if !edges.is_empty() => Err(invalid("end nodes have no successors")),
        NodeKind::Condition if count(None) > 0 => Err(invalid("condition edges must be labeled true or false")),
        NodeKind::ForEach if count(Some(labels::ITEM)) != 1 => Err(invalid("for-each needs exactly one item edge")),
        NodeKind::Fork if !edges.iter().any(|(l, _)| l.as_deref().is_some_and(labels::is_branch)) => {
            Err(invalid("fork needs at least one branch edge"))
        }
        _ => Ok(()),
    }
}

fn check_acyclic(workflow: &WorkflowDefinition, outgoing: &Outgoing) -> Result<(), DefinitionError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(key: &'a str, outgoing: &'a Outgoing, marks: &mut HashMap<&'a str, Mark>) -> Result<(), DefinitionError> {
        match marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(DefinitionError::Cycle(key.to_string())),
            None => {}
        }
        marks.insert(key, Mark::Visiting);
        for (_, target) in outgoing.get(key).into_iter().flatten() {
            visit(target, outgoing, marks)?;
        }
        marks.insert(key, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for node in &workflow.nodes {
        visit(&node.key, outgoing, &mut marks)?;
    }
    Ok(())
}

/// Breadth-first from Start. A for-each `item` edge or a fork branch edge opens a
/// new region; every other edge stays in the source's region. Returns each node's
/// region, `None` meaning the root.
fn assign_regions(
    workflow: &WorkflowDefinition,
    start: &str,
    outgoing: &Outgoing,
) -> Result<HashMap<String, Option<Region>>, DefinitionError> {
    let mut region_of: HashMap<String, String> = HashMap::new();
    let mut regions: HashMap<String, Region> = HashMap::new();
    regions.insert(ROOT_REGION.to_string(), Region { owner: None, in_loop: false });
    region_of.insert(start.to_string(), ROOT_REGION.to_string());

    let kinds: HashMap<&str, NodeKind> = workflow.nodes.iter().map(|n| (n.key.as_str(), n.kind())).collect();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(source) = queue.pop_front() {
        let current = region_of[&source].clone();
        for (label, target) in outgoing.get(&source).into_iter().flatten() {
            let kind = kinds[source.as_str()];
            let opens = match (kind, label.as_deref()) {
                (NodeKind::ForEach, Some(labels::ITEM)) => true,
                (NodeKind::Fork, Some(l)) => labels::is_branch(l),
                _ => false,
            };
            let wanted = if opens {
                let id = format!("{}/{}", source, label.as_deref().unwrap_or_default());
                let in_loop = kind == NodeKind::ForEach || regions[&current].in_loop;
                regions.entry(id.clone()).or_insert(Region { owner: Some(source.clone()), in_loop });
                id
            } else {
                current.clone()
            };

            match region_of.get(target) {
                Some(existing) if *existing != wanted => {
                    return Err(DefinitionError::ScopeConflict(target.clone()));
                }
                Some(_) => {}
                None => {
                    region_of.insert(target.clone(), wanted);
                    queue.push_back(target.clone());
                }
            }
        }
    }

    let mut unreachable: Vec<String> = workflow.nodes.iter()
        .filter(|n| !region_of.contains_key(&n.key))
        .map(|n| n.key.clone())
        .collect();
    if !unreachable.is_empty() {
        unreachable.sort();
        return Err(DefinitionError::Unreachable(unreachable));
    }

    let mut assigned = HashMap::new();
    for node in &workflow.nodes {
        let region = regions[&region_of[&node.key]].clone();
        if node.kind() == NodeKind::End {
            if let Some(owner) = region.owner {
                return Err(DefinitionError::EndInsideScope { node: node.key.clone(), owner });
            }
        }
        let region = if region_of[&node.key] == ROOT_REGION { None } else { Some(region) };
        assigned.insert(node.key.clone(), region);
    }
    Ok(assigned)
}

fn check_inputs(node: &Node) -> Result<(), DefinitionError> {
    let missing = |input: &str| DefinitionError::MissingInput {
        node: node.key.clone(),
        input: input.to_string(),
    };
    match &node.kind {
        NodeType::ForEach { .. } if !node.inputs.contains_key("items") => return Err(missing("items")),
        NodeType::Wiki { .. } if !node.inputs.contains_key("query") => return Err(missing("query")),
        NodeType::DataProcess { .. } if !node.inputs.contains_key("data") => return Err(missing("data")),
        NodeType::AiChat { .. } if !node.inputs.contains_key("prompt") && !node.inputs.contains_key("messages") => {
            return Err(missing("prompt"));
        }
        NodeType::Condition { expression } => {
            let invalid = |reason: String| DefinitionError::InvalidCondition { node: node.key.clone(), reason };
            match (expression, node.inputs.contains_key("condition")) {
                (Some(_), true) => return Err(invalid("give either an expression or a condition input, not both".into())),
                (None, false) => return Err(invalid("needs an expression or a condition input".into())),
                (Some(expr), false) => {
                    eval::references(expr).map_err(|e| invalid(e.to_string()))?;
                }
                (None, true) => {}
            }
        }
        _ => {}
    }

    for (name, binding) in &node.inputs {
        expression::references(binding).map_err(|e| DefinitionError::InvalidBinding {
            node: node.key.clone(),
            input: name.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// The for-each/fork nodes enclosing `key`, innermost first.
fn owner_chain(key: &str, regions: &HashMap<String, Option<Region>>) -> Vec<String> {
    let mut owners = Vec::new();
    let mut current = regions.get(key).and_then(|r| r.as_ref()).and_then(|r| r.owner.clone());
    while let Some(owner) = current {
        current = regions.get(&owner).and_then(|r| r.as_ref()).and_then(|r| r.owner.clone());
        owners.push(owner);
    }
    owners
}

/// Returns the node keys `node` reads from.
fn check_references(
    node: &Node,
    region: Option<&Region>,
    owners: &[String],
    index: &HashMap<String, NodeIndex>,
    ancestors: &Ancestors,
) -> Result<Vec<String>, DefinitionError> {
    let mut roots = BTreeSet::new();
    for binding in node.inputs.values() {
        // Syntax was checked by check_inputs.
        roots.extend(expression::references(binding).unwrap_or_default());
    }
    if let NodeType::Condition { expression: Some(expr) } = &node.kind {
        roots.extend(eval::references(expr).unwrap_or_default());
    }

    let mut deps = Vec::new();
    for root in roots {
        match root.as_str() {
            SYS | INPUT => {}
            LOOP => {
                if !region.is_some_and(|r| r.in_loop) {
                    return Err(DefinitionError::LoopOutsideScope(node.key.clone()));
                }
            }
            // An enclosing for-each/fork has no output until its body is done.
            key if owners.iter().any(|o| o == key) => {
                return Err(DefinitionError::UnresolvableReference {
                    node: node.key.clone(),
                    reference: root,
                });
            }
            key if index.contains_key(key) && ancestors.is_ancestor(key, &node.key) => deps.push(root),
            _ => {
                return Err(DefinitionError::UnresolvableReference {
                    node: node.key.clone(),
                    reference: root,
                });
            }
        }
    }
    Ok(deps)
}

/// Reverse reachability over every edge.
struct Ancestors {
    incoming: HashMap<String, Vec<String>>,
}

impl Ancestors {
    fn new(workflow: &WorkflowDefinition, outgoing: &Outgoing) -> Self {
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for node in &workflow.nodes {
            for (_, target) in outgoing.get(&node.key).into_iter().flatten() {
                incoming.entry(target.clone()).or_default().push(node.key.clone());
            }
        }
        Self { incoming }
    }

    fn is_ancestor(&self, candidate: &str, of: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([of]);
        while let Some(key) = queue.pop_front() {
            for parent in self.incoming.get(key).into_iter().flatten() {
                if parent == candidate {
                    return true;
                }
                if seen.insert(parent.as_str()) {
                    queue.push_back(parent.as_str());
                }
            }
        }
        false
    }
}
