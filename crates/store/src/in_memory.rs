//! In-memory store, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use opsclaw_core::audit::{FlowStepRecord, LogicVersion};
use opsclaw_core::error::StoreError;
use opsclaw_core::message::Message;
use opsclaw_core::reference::ReferenceUsageRecord;
use opsclaw_core::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    turns: HashMap<String, Vec<Message>>,
    logic_versions: Vec<LogicVersion>,
    flow_steps: Vec<FlowStepRecord>,
    reference_usage: Vec<ReferenceUsageRecord>,
}

/// A store that keeps everything in process memory.
/// Contents are lost when the process exits.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Message) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .turns
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .turns
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_logic_version(&self, version: &LogicVersion) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables
            .logic_versions
            .iter_mut()
            .find(|v| v.version == version.version)
        {
            Some(existing) => *existing = version.clone(),
            None => tables.logic_versions.push(version.clone()),
        }
        Ok(())
    }

    async fn get_logic_version(&self, version: &str) -> Result<Option<LogicVersion>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .logic_versions
            .iter()
            .find(|v| v.version == version)
            .cloned())
    }

    async fn active_logic_version(&self) -> Result<Option<LogicVersion>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .logic_versions
            .iter()
            .find(|v| v.is_active)
            .cloned())
    }

    async fn list_logic_versions(&self) -> Result<Vec<LogicVersion>, StoreError> {
        let mut versions = self.tables.read().await.logic_versions.clone();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    async fn append_flow_step(&self, step: &FlowStepRecord) -> Result<(), StoreError> {
        self.tables.write().await.flow_steps.push(step.clone());
        Ok(())
    }

    async fn list_flow_steps(&self, request_id: &str) -> Result<Vec<FlowStepRecord>, StoreError> {
        let mut steps: Vec<FlowStepRecord> = self
            .tables
            .read()
            .await
            .flow_steps
            .iter()
            .filter(|s| s.request_id == request_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn list_flow_steps_for_version(&self, version: &str) -> Result<Vec<FlowStepRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .flow_steps
            .iter()
            .filter(|s| s.logic_version == version)
            .cloned()
            .collect())
    }

    async fn record_reference_usage(&self, record: &ReferenceUsageRecord) -> Result<(), StoreError> {
        self.tables.write().await.reference_usage.push(record.clone());
        Ok(())
    }

    async fn list_reference_usage(&self, conversation_id: &str) -> Result<Vec<ReferenceUsageRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .reference_usage
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsclaw_core::audit::{LogicConfig, StepType};

    fn version(label: &str, active: bool) -> LogicVersion {
        LogicVersion {
            version: label.into(),
            name: "test".into(),
            description: None,
            config: LogicConfig {
                max_iterations: 10,
                temperature: None,
                prompt_version: "v1.0".into(),
                features: vec![],
            },
            config_hash: "abc".into(),
            is_active: active,
            created_at: Utc::now(),
            deprecated_at: None,
        }
    }

    fn step(request_id: &str, order: u32) -> FlowStepRecord {
        FlowStepRecord {
            id: format!("{request_id}-{order}"),
            request_id: request_id.into(),
            conversation_id: "c1".into(),
            logic_version: "v1".into(),
            step_order: order,
            step_type: StepType::LlmCall,
            step_name: "call".into(),
            input: None,
            output: None,
            duration_ms: Some(5),
            tokens: None,
            metadata: Default::default(),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turns_are_kept_per_conversation_in_order() {
        let store = InMemoryStore::new();
        store.append_turn("a", &Message::user("one")).await.unwrap();
        store.append_turn("b", &Message::user("other")).await.unwrap();
        store.append_turn("a", &Message::assistant("two")).await.unwrap();

        let turns = store.list_turns("a").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "one");
        assert_eq!(turns[1].content, "two");
        assert!(store.list_turns("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logic_version_upsert_replaces() {
        let store = InMemoryStore::new();
        store.upsert_logic_version(&version("v1", true)).await.unwrap();
        store.upsert_logic_version(&version("v1", false)).await.unwrap();
        assert_eq!(store.list_logic_versions().await.unwrap().len(), 1);
        assert!(store.active_logic_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flow_steps_sorted_by_order() {
        let store = InMemoryStore::new();
        store.append_flow_step(&step("r1", 2)).await.unwrap();
        store.append_flow_step(&step("r1", 1)).await.unwrap();
        store.append_flow_step(&step("r2", 1)).await.unwrap();
        let steps = store.list_flow_steps("r1").await.unwrap();
        assert_eq!(steps.iter().map(|s| s.step_order).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.list_flow_steps_for_version("v1").await.unwrap().len(), 3);
    }
}
