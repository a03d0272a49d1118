use std::collections::BTreeMap;
use async_trait::async_trait;
use uuid::Uuid;
use anyhow::{Result, anyhow, bail};
use dashmap::DashMap;

use crate::dsl::WorkflowDefinition;
use crate::runtime::record::{Finalization, NodeExecutionRecord, WorkflowExecution};

// --- Interfaces ---

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>>;
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()>;
}

/// Durable run history.
///
/// Records are keyed by `(execution_id, sequence)`. Appending the same sequence
/// again replaces the earlier state of that record, unless that state was
/// already terminal. Once an execution is finalized nothing about it changes.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn append_record(&self, execution_id: Uuid, record: &NodeExecutionRecord) -> Result<()>;

    /// Returns `false` when the execution was already finalized.
    async fn finalize_execution(&self, execution_id: Uuid, finalization: &Finalization) -> Result<bool>;

    /// Header plus full history ordered by sequence.
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>>;

    async fn load_records(&self, execution_id: Uuid, node_key: Option<&str>) -> Result<Vec<NodeExecutionRecord>>;
}

// --- In-Memory Implementations ---

#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.get(id).map(|d| d.value().clone()))
    }

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions.insert(definition.id.clone(), definition.clone());
        Ok(())
    }
}

struct StoredExecution {
    header: WorkflowExecution,
    records: BTreeMap<u64, NodeExecutionRecord>,
}

#[derive(Default)]
pub struct InMemoryExecutionStore {
    // Map<ExecutionID, header + records by sequence>
    executions: DashMap<Uuid, StoredExecution>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        if self.executions.contains_key(&execution.execution_id) {
            bail!("execution {} already exists", execution.execution_id);
        }
        let mut header = execution.clone();
        let records = header.history.drain(..).map(|r| (r.sequence, r)).collect();
        self.executions.insert(execution.execution_id, StoredExecution { header, records });
        Ok(())
    }

    async fn append_record(&self, execution_id: Uuid, record: &NodeExecutionRecord) -> Result<()> {
        let mut stored = self.executions.get_mut(&execution_id)
            .ok_or_else(|| anyhow!("execution {} not found", execution_id))?;
        if stored.header.status.is_terminal() {
            bail!("execution {} is already finalized", execution_id);
        }
        if let Some(existing) = stored.records.get(&record.sequence) {
            if existing.is_terminal() {
                bail!(
                    "record {} of execution {} is terminal and cannot be replaced",
                    record.sequence, execution_id
                );
            }
        }
        stored.records.insert(record.sequence, record.clone());
        Ok(())
    }

    async fn finalize_execution(&self, execution_id: Uuid, finalization: &Finalization) -> Result<bool> {
        let mut stored = self.executions.get_mut(&execution_id)
            .ok_or_else(|| anyhow!("execution {} not found", execution_id))?;
        if stored.header.status.is_terminal() {
            return Ok(false);
        }
        let header = &mut stored.header;
        header.status = finalization.status;
        header.final_output = finalization.final_output.clone();
        header.error = finalization.error.clone();
        header.completed_at = Some(finalization.completed_at);
        Ok(true)
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.get(&execution_id).map(|stored| {
            let mut execution = stored.header.clone();
            execution.history = stored.records.values().cloned().collect();
            execution
        }))
    }

    async fn load_records(&self, execution_id: Uuid, node_key: Option<&str>) -> Result<Vec<NodeExecutionRecord>> {
        let stored = self.executions.get(&execution_id)
            .ok_or_else(|| anyhow!("execution {} not found", execution_id))?;
        Ok(stored.records
            .values()
            .filter(|r| node_key.is_none_or(|key| r.node_key == key))
            .cloned()
            .collect())
    }
}
