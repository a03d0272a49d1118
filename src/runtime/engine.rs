use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::dsl::WorkflowDefinition;
use crate::nodes::{
    AiChatExecutor, ConditionExecutor, DataProcessExecutor, EndExecutor, ForEachExecutor, ForkExecutor,
    JavaScriptExecutor, PluginExecutor, StartExecutor, WikiExecutor,
};
use crate::runtime::blueprint::Blueprint;
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::EngineError;
use crate::runtime::node::{NodeExecutor, NodeRegistry};
use crate::runtime::record::{ExecutionStatus, NodeExecutionRecord, WorkflowExecution};
use crate::runtime::recorder::Recorder;
use crate::runtime::scheduler::{ScopeExit, Scheduler};
use crate::runtime::storage::{DefinitionStore, ExecutionStore, InMemoryDefinitionStore, InMemoryExecutionStore};
use crate::services::{ChatCompletion, DataTransform, KnowledgeRetrieval, PluginRuntime, ScriptSandbox};

/// 工作流引擎
///
/// Owns the compiled blueprints, the executor registry and the run bookkeeping.
/// Runs either inline ([`Engine::execute`]) or on a spawned task
/// ([`Engine::start_execution`]).
pub struct Engine {
    config: EngineConfig,
    registry: NodeRegistry,
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    // Compiled definitions by id
    blueprints: DashMap<String, Arc<Blueprint>>,
    // Runs still in flight; an entry leaves when its run is finalized
    active: DashMap<Uuid, ActiveRun>,
}

#[derive(Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    // Fires once the run is finalized (or its task is gone)
    done: CancellationToken,
}

/// A run that has been created in the store but not driven yet.
struct PreparedRun {
    execution_id: Uuid,
    blueprint: Arc<Blueprint>,
    input: Value,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Validate and store a definition. Replaces any cached blueprint for the same id.
    pub async fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        let blueprint = Compiler::for_registry(&self.registry).compile(definition)?;
        self.definitions.save_definition(&blueprint.definition).await?;
        info!(workflow_id = %blueprint.id(), nodes = blueprint.definition.nodes.len(), "Definition registered");
        self.blueprints.insert(blueprint.id().to_string(), Arc::new(blueprint));
        Ok(())
    }

    async fn prepare_blueprint(&self, definition_id: &str) -> Result<Arc<Blueprint>, EngineError> {
        if let Some(blueprint) = self.blueprints.get(definition_id) {
            return Ok(blueprint.clone());
        }

        let definition = self.definitions
            .load_definition(definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))?;
        let blueprint = Arc::new(Compiler::for_registry(&self.registry).compile(definition)?);
        self.blueprints.insert(definition_id.to_string(), blueprint.clone());
        Ok(blueprint)
    }

    async fn begin(&self, definition_id: &str, input: Value) -> Result<PreparedRun, EngineError> {
        if !input.is_object() {
            return Err(EngineError::InvalidInput);
        }
        let blueprint = self.prepare_blueprint(definition_id).await?;

        let execution_id = Uuid::new_v4();
        let execution = WorkflowExecution::new(execution_id, blueprint.definition.as_ref().clone(), input.clone());
        self.executions.create_execution(&execution).await?;

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        self.active.insert(execution_id, ActiveRun { cancel: cancel.clone(), done: done.clone() });
        Ok(PreparedRun { execution_id, blueprint, input, cancel, done })
    }

    async fn drive(&self, run: PreparedRun) {
        let span = info_span!("execution", execution_id = %run.execution_id, workflow_id = %run.blueprint.id());
        self.run_to_end(run).instrument(span).await
    }

    async fn run_to_end(&self, run: PreparedRun) {
        let _finished = run.done.clone().drop_guard();
        let recorder = Recorder::new(run.execution_id, self.executions.clone());
        let ctx = ExecutionContext::new(run.execution_id, run.blueprint.id(), run.input);
        info!("Execution started");

        let scheduler = Scheduler::new(&run.blueprint, &self.registry, &recorder, &self.config, &run.cancel);
        let (status, final_output, failure) = match scheduler.run(&ctx).await {
            Ok(ScopeExit::Finished(output)) => (ExecutionStatus::Completed, Some(output), None),
            Ok(ScopeExit::Drained(_)) => {
                warn!("Root scope drained without reaching an end node");
                (ExecutionStatus::Completed, None, None)
            }
            Err(f) if f.error.is_cancelled() => (ExecutionStatus::Cancelled, None, Some(f.error.to_string())),
            Err(f) => (
                ExecutionStatus::Failed,
                None,
                Some(format!("node '{}' failed: {}", f.node_key, f.error)),
            ),
        };

        match recorder.finalize(status, final_output, failure.clone()).await {
            Ok(_) => match &failure {
                Some(reason) => info!(status = ?status, error = %reason, "Execution finished"),
                None => info!(status = ?status, "Execution finished"),
            },
            Err(e) => error!(error = %e, "Failed to finalize execution"),
        }
        self.active.remove(&run.execution_id);
    }

    /// Run to completion on the current task and return the finished execution.
    pub async fn execute(&self, definition_id: &str, input: Value) -> Result<WorkflowExecution, EngineError> {
        let run = self.begin(definition_id, input).await?;
        let execution_id = run.execution_id;
        self.drive(run).await;
        self.get_execution(execution_id).await
    }

    /// Start a run on a spawned task and return its id immediately.
    pub async fn start_execution(self: &Arc<Self>, definition_id: &str, input: Value) -> Result<Uuid, EngineError> {
        let run = self.begin(definition_id, input).await?;
        let execution_id = run.execution_id;
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(run).await });
        Ok(execution_id)
    }

    /// Wait for a run started with [`Engine::start_execution`] to finish.
    pub async fn wait_for(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let done = self.active.get(&execution_id).map(|run| run.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        self.get_execution(execution_id).await
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.executions
            .load_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// History of a run, optionally only the records of one node key.
    pub async fn records(&self, execution_id: Uuid, node_key: Option<&str>) -> Result<Vec<NodeExecutionRecord>, EngineError> {
        Ok(self.executions.load_records(execution_id, node_key).await?)
    }

    /// Number of runs not yet finalized.
    pub fn active_executions(&self) -> usize {
        self.active.len()
    }

    /// Signal cancellation. Returns `false` if the run is unknown or already over.
    pub fn cancel_execution(&self, execution_id: Uuid) -> bool {
        match self.active.get(&execution_id) {
            Some(run) => {
                info!(execution_id = %execution_id, "Cancellation requested");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Wires configuration, stores and collaborators into an [`Engine`].
/// Service node types are only registered when their collaborator is given.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    definitions: Option<Arc<dyn DefinitionStore>>,
    executions: Option<Arc<dyn ExecutionStore>>,
    plugin: Option<Arc<dyn PluginRuntime>>,
    knowledge: Option<Arc<dyn KnowledgeRetrieval>>,
    chat: Option<Arc<dyn ChatCompletion>>,
    sandbox: Option<Arc<dyn ScriptSandbox>>,
    transform: Option<Arc<dyn DataTransform>>,
    extra: Vec<Arc<dyn NodeExecutor>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definition_store(mut self, store: Arc<dyn DefinitionStore>) -> Self {
        self.definitions = Some(store);
        self
    }

    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(store);
        self
    }

    pub fn plugin_runtime(mut self, runtime: Arc<dyn PluginRuntime>) -> Self {
        self.plugin = Some(runtime);
        self
    }

    pub fn knowledge_retrieval(mut self, retrieval: Arc<dyn KnowledgeRetrieval>) -> Self {
        self.knowledge = Some(retrieval);
        self
    }

    pub fn chat_completion(mut self, chat: Arc<dyn ChatCompletion>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn script_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn data_transform(mut self, transform: Arc<dyn DataTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Register an executor, replacing the built-in one for the same node type.
    pub fn executor(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.extra.push(executor);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(StartExecutor));
        registry.register(Arc::new(EndExecutor));
        registry.register(Arc::new(ConditionExecutor));
        registry.register(Arc::new(ForEachExecutor::new(config.foreach_concurrency())));
        registry.register(Arc::new(ForkExecutor));

        if let Some(plugin) = self.plugin {
            registry.register(Arc::new(PluginExecutor::new(plugin)));
        }
        if let Some(knowledge) = self.knowledge {
            registry.register(Arc::new(WikiExecutor::new(knowledge)));
        }
        if let Some(chat) = self.chat {
            registry.register(Arc::new(AiChatExecutor::new(chat)));
        }
        if let Some(sandbox) = self.sandbox {
            let timeout = Duration::from_millis(config.timeouts.javascript_ms);
            registry.register(Arc::new(JavaScriptExecutor::new(sandbox, timeout)));
        }
        if let Some(transform) = self.transform {
            registry.register(Arc::new(DataProcessExecutor::new(transform)));
        }
        for executor in self.extra {
            registry.register(executor);
        }

        Engine {
            config,
            registry,
            definitions: self.definitions.unwrap_or_else(|| Arc::new(InMemoryDefinitionStore::new())),
            executions: self.executions.unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new())),
            blueprints: DashMap::new(),
            active: DashMap::new(),
        }
    }
}
