//! Store trait: the durable collaborator behind the orchestrator.
//!
//! The core needs only these operations; the engine behind them is a
//! deployment choice. Implementations: in-memory (tests, ephemeral
//! sessions) and SQLite.

use async_trait::async_trait;
use crate::audit::{FlowStepRecord, LogicVersion};
use crate::error::StoreError;
use crate::message::Message;
use crate::reference::ReferenceUsageRecord;

#[async_trait]
pub trait Store: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    // ── Conversation turns ──────────────────────────────────────────────

    /// Append one turn to a conversation. Turns are never rewritten.
    async fn append_turn(&self, conversation_id: &str, turn: &Message) -> Result<(), StoreError>;

    /// All turns of a conversation in creation order.
    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    // ── Logic versions ──────────────────────────────────────────────────

    /// Insert or replace a logic version, keyed by `version`.
    async fn upsert_logic_version(&self, version: &LogicVersion) -> Result<(), StoreError>;

    async fn get_logic_version(&self, version: &str) -> Result<Option<LogicVersion>, StoreError>;

    async fn active_logic_version(&self) -> Result<Option<LogicVersion>, StoreError>;

    async fn list_logic_versions(&self) -> Result<Vec<LogicVersion>, StoreError>;

    // ── Flow steps ──────────────────────────────────────────────────────

    async fn append_flow_step(&self, step: &FlowStepRecord) -> Result<(), StoreError>;

    /// Steps of one request ordered by `step_order`.
    async fn list_flow_steps(&self, request_id: &str) -> Result<Vec<FlowStepRecord>, StoreError>;

    /// Every step recorded under a logic version.
    async fn list_flow_steps_for_version(&self, version: &str) -> Result<Vec<FlowStepRecord>, StoreError>;

    // ── Reference usage ─────────────────────────────────────────────────

    async fn record_reference_usage(&self, record: &ReferenceUsageRecord) -> Result<(), StoreError>;

    async fn list_reference_usage(&self, conversation_id: &str) -> Result<Vec<ReferenceUsageRecord>, StoreError>;
}
