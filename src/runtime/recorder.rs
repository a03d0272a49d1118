use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use chrono::Utc;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::dsl::Node;
use crate::runtime::error::NodeError;
use crate::runtime::record::{ExecutionStatus, Finalization, NodeExecutionRecord};
use crate::runtime::storage::ExecutionStore;

/// 执行记录器
///
/// Hands out record sequence numbers and writes every state change of a record
/// through to the execution store. Finalizes the run exactly once.
pub struct Recorder {
    execution_id: Uuid,
    store: Arc<dyn ExecutionStore>,
    sequence: AtomicU64,
    finalized: AtomicBool,
}

impl Recorder {
    pub fn new(execution_id: Uuid, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            execution_id,
            store,
            sequence: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// New `Pending` record for a node about to be scheduled in `scope`.
    pub fn open(&self, node: &Node, scope: &str) -> NodeExecutionRecord {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        NodeExecutionRecord::pending(sequence, &node.key, node.kind(), scope)
    }

    pub async fn append(&self, record: &NodeExecutionRecord) -> Result<(), NodeError> {
        self.store
            .append_record(self.execution_id, record)
            .await
            .map_err(|e| {
                error!(
                    execution_id = %self.execution_id,
                    node = %record.node_key,
                    sequence = record.sequence,
                    error = %e,
                    "Failed to persist node record"
                );
                NodeError::Storage(e.to_string())
            })
    }

    /// Returns `Ok(false)` if the run had already been finalized.
    pub async fn finalize(
        &self,
        status: ExecutionStatus,
        final_output: Option<Value>,
        error: Option<String>,
    ) -> anyhow::Result<bool> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let finalization = Finalization {
            status,
            final_output,
            error,
            completed_at: Utc::now(),
        };
        self.store.finalize_execution(self.execution_id, &finalization).await
    }
}
