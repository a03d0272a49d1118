use async_trait::async_trait;
use uuid::Uuid;
use anyhow::{Result, bail};
use redis::AsyncCommands;
use std::collections::HashMap;

use crate::dsl::WorkflowDefinition;
use crate::runtime::record::{Finalization, NodeExecutionRecord, WorkflowExecution};
use crate::runtime::storage::{DefinitionStore, ExecutionStore};

// KEYS[1] = records hash, KEYS[2] = final marker
// ARGV[1] = sequence (field), ARGV[2] = record json
// Returns 1 when written, 0 when the slot holds a terminal record, -1 when finalized.
const APPEND_RECORD: &str = r#"
    if redis.call("EXISTS", KEYS[2]) == 1 then
        return -1
    end
    local current = redis.call("HGET", KEYS[1], ARGV[1])
    if current then
        local state = cjson.decode(current)["state"]
        if state == "completed" or state == "failed" then
            return 0
        end
    end
    redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
    return 1
"#;

pub struct RedisDefinitionStore {
    client: redis::Client,
}

impl RedisDefinitionStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn key(&self, id: &str) -> String {
        format!("flowline:def:{}", id)
    }
}

#[async_trait]
impl DefinitionStore for RedisDefinitionStore {
    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.key(id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(definition)?;
        let _: () = conn.set(self.key(&definition.id), serialized).await?;
        Ok(())
    }
}

pub struct RedisExecutionStore {
    client: redis::Client,
}

impl RedisExecutionStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn header_key(&self, id: Uuid) -> String {
        format!("flowline:exec:{}", id)
    }

    fn records_key(&self, id: Uuid) -> String {
        format!("flowline:exec:{}:records", id)
    }

    fn final_key(&self, id: Uuid) -> String {
        format!("flowline:exec:{}:final", id)
    }

    async fn sorted_records(&self, conn: &mut redis::aio::MultiplexedConnection, id: Uuid) -> Result<Vec<NodeExecutionRecord>> {
        let raw: HashMap<String, String> = conn.hgetall(self.records_key(id)).await?;
        let mut records = raw
            .values()
            .map(|s| serde_json::from_str::<NodeExecutionRecord>(s))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}

#[async_trait]
impl ExecutionStore for RedisExecutionStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut header = execution.clone();
        header.history.clear();
        let created: bool = conn.set_nx(self.header_key(execution.execution_id), serde_json::to_string(&header)?).await?;
        if !created {
            bail!("execution {} already exists", execution.execution_id);
        }
        Ok(())
    }

    async fn append_record(&self, execution_id: Uuid, record: &NodeExecutionRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let written: i64 = redis::Script::new(APPEND_RECORD)
            .key(self.records_key(execution_id))
            .key(self.final_key(execution_id))
            .arg(record.sequence)
            .arg(serde_json::to_string(record)?)
            .invoke_async(&mut conn)
            .await?;
        match written {
            1 => Ok(()),
            0 => bail!("record {} of execution {} is terminal and cannot be replaced", record.sequence, execution_id),
            _ => bail!("execution {} is already finalized", execution_id),
        }
    }

    async fn finalize_execution(&self, execution_id: Uuid, finalization: &Finalization) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.header_key(execution_id)).await?;
        let Some(raw) = raw else {
            bail!("execution {} not found", execution_id);
        };
        let mut header: WorkflowExecution = serde_json::from_str(&raw)?;
        header.status = finalization.status;
        header.final_output = finalization.final_output.clone();
        header.error = finalization.error.clone();
        header.completed_at = Some(finalization.completed_at);
        // The marker decides who wins; the header is only rewritten by the winner.
        let applied: bool = conn.set_nx(self.final_key(execution_id), serde_json::to_string(&header)?).await?;
        Ok(applied)
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let finalized: Option<String> = conn.get(self.final_key(execution_id)).await?;
        let raw = match finalized {
            Some(f) => f,
            None => match conn.get::<_, Option<String>>(self.header_key(execution_id)).await? {
                Some(h) => h,
                None => return Ok(None),
            },
        };
        let mut execution: WorkflowExecution = serde_json::from_str(&raw)?;
        execution.history = self.sorted_records(&mut conn, execution_id).await?;
        Ok(Some(execution))
    }

    async fn load_records(&self, execution_id: Uuid, node_key: Option<&str>) -> Result<Vec<NodeExecutionRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut records = self.sorted_records(&mut conn, execution_id).await?;
        if let Some(key) = node_key {
            records.retain(|r| r.node_key == key);
        }
        Ok(records)
    }
}
