use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value, json};
use uuid::Uuid;

pub const SYS: &str = "sys";
pub const INPUT: &str = "input";
pub const LOOP: &str = "loop";
pub const ROOT_SCOPE: &str = "root";

/// Namespaces that can never be used as node keys.
pub const RESERVED_NAMESPACES: [&str; 3] = [SYS, INPUT, LOOP];

/// Run-wide values shared by every scope of one execution.
struct RunVars {
    execution_id: Uuid,
    workflow_id: String,
    started_at: DateTime<Utc>,
    now_ms: AtomicI64,
    input: Value,
}

struct Scope {
    label: String,
    parent: Option<ExecutionContext>,
    run: Arc<RunVars>,
    /// `{"item": .., "index": ..}` for for-each iteration scopes
    frame: Option<Value>,
    outputs: DashMap<String, Value>,
}

/// 运行时上下文 (Execution Context)
///
/// Holds `sys`, `input` and the outputs of completed nodes. Loop iterations and
/// fork branches get child scopes: a child reads everything its ancestors have
/// completed but writes only into itself. Cloning is cheap (one `Arc`).
#[derive(Clone)]
pub struct ExecutionContext {
    scope: Arc<Scope>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, workflow_id: impl Into<String>, input: Value) -> Self {
        let started_at = Utc::now();
        let run = RunVars {
            execution_id,
            workflow_id: workflow_id.into(),
            started_at,
            now_ms: AtomicI64::new(started_at.timestamp_millis()),
            input,
        };
        Self {
            scope: Arc::new(Scope {
                label: ROOT_SCOPE.to_string(),
                parent: None,
                run: Arc::new(run),
                frame: None,
                outputs: DashMap::new(),
            }),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.scope.run.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.scope.run.workflow_id
    }

    pub fn scope_label(&self) -> &str {
        &self.scope.label
    }

    pub fn input(&self) -> &Value {
        &self.scope.run.input
    }

    /// Refresh `sys.timestamp`. Called by the scheduler before each dispatch.
    pub fn tick(&self) {
        self.scope.run.now_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn sys(&self) -> Value {
        let run = &self.scope.run;
        json!({
            "execution_id": run.execution_id.to_string(),
            "workflow_id": run.workflow_id,
            "started_at": run.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "timestamp": run.now_ms.load(Ordering::Relaxed),
        })
    }

    /// Value of a whole namespace: `sys`, `input`, `loop`, or a node key.
    pub fn namespace(&self, root: &str) -> Option<Value> {
        match root {
            SYS => Some(self.sys()),
            INPUT => Some(self.scope.run.input.clone()),
            LOOP => self.loop_frame(),
            key => self.output(key),
        }
    }

    /// Dotted lookup (`input.user.name`, `fetch.items.0`).
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let mut current = self.namespace(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(mut map) => map.remove(part)?,
                Value::Array(mut items) => {
                    let index: usize = part.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Output of a completed node, searching this scope then its ancestors.
    pub fn output(&self, node_key: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            if let Some(v) = ctx.scope.outputs.get(node_key) {
                return Some(v.value().clone());
            }
            scope = ctx.scope.parent.as_ref();
        }
        None
    }

    pub fn has_output(&self, node_key: &str) -> bool {
        self.output(node_key).is_some()
    }

    /// Record a node's output in this scope.
    ///
    /// # Panics
    /// If the key was already written in this scope. Outputs are write-once and the
    /// scheduler dispatches a node at most once per scope, so a second write is a bug.
    pub fn set_node_output(&self, node_key: &str, value: Value) {
        match self.scope.outputs.entry(node_key.to_string()) {
            Entry::Occupied(_) => panic!(
                "output for node '{}' already written in scope '{}'",
                node_key, self.scope.label
            ),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    /// Child scope for a fork branch.
    pub fn fork(&self, label: impl Into<String>) -> Self {
        self.child(label.into(), None)
    }

    /// Child scope for one for-each iteration, exposing `loop.item` and `loop.index`.
    pub fn fork_iteration(&self, label: impl Into<String>, item: Value, index: usize) -> Self {
        self.child(label.into(), Some(json!({ "item": item, "index": index })))
    }

    fn child(&self, label: String, frame: Option<Value>) -> Self {
        Self {
            scope: Arc::new(Scope {
                label,
                parent: Some(self.clone()),
                run: self.scope.run.clone(),
                frame,
                outputs: DashMap::new(),
            }),
        }
    }

    fn loop_frame(&self) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            if let Some(frame) = &ctx.scope.frame {
                return Some(frame.clone());
            }
            scope = ctx.scope.parent.as_ref();
        }
        None
    }

    /// Outputs written in this scope only, excluding ancestors.
    pub fn outputs(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for entry in self.scope.outputs.iter() {
            map.insert(entry.key().clone(), entry.value().clone());
        }
        map
    }

    /// Join step of a fork: collect each branch's own outputs under its branch key,
    /// giving `{ "branch-a": { "node": .. }, .. }`. The caller stores the result as
    /// the fork node's output, which exposes `fork.branch-a.node.*` to later nodes.
    pub fn merge(branches: &[(String, ExecutionContext)]) -> Value {
        let mut merged = Map::new();
        for (label, child) in branches {
            merged.insert(label.clone(), Value::Object(child.outputs()));
        }
        Value::Object(merged)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.scope.run.execution_id)
            .field("scope", &self.scope.label)
            .field("outputs", &self.scope.outputs.len())
            .finish()
    }
}
