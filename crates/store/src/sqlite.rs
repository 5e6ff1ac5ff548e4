//! SQLite store.
//!
//! One database file with four tables:
//! - `turns`: conversation turns, ordered by an autoincrement sequence
//! - `logic_versions`: keyed by version label
//! - `flow_steps`: indexed by request id and logic version
//! - `reference_usage`: indexed by conversation id
//!
//! Key columns are broken out for filtering; the full record is kept as a
//! JSON document in `body` so schema changes to the records need no
//! migration.

use async_trait::async_trait;
use opsclaw_core::audit::{FlowStepRecord, LogicVersion};
use opsclaw_core::error::StoreError;
use opsclaw_core::message::Message;
use opsclaw_core::reference::ReferenceUsageRecord;
use opsclaw_core::store::Store;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteStore {
    pool: SqlitePool,
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Storage(format!("Serialization: {e}")))
}

fn decode<T: DeserializeOwned>(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|row| {
            let body: String = row
                .try_get("body")
                .map_err(|e| StoreError::QueryFailed(format!("body column: {e}")))?;
            serde_json::from_str(&body).map_err(|e| StoreError::QueryFailed(format!("Corrupt record: {e}")))
        })
        .collect()
}

impl SqliteStore {
    /// Open (or create) a SQLite store.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A memory database exists per connection, so keep exactly one.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "turns table",
                r#"
                CREATE TABLE IF NOT EXISTS turns (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    id              TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    role            TEXT NOT NULL,
                    created_at      TEXT NOT NULL,
                    body            TEXT NOT NULL
                )
                "#,
            ),
            (
                "turns index",
                "CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, seq)",
            ),
            (
                "logic_versions table",
                r#"
                CREATE TABLE IF NOT EXISTS logic_versions (
                    version    TEXT PRIMARY KEY,
                    is_active  INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    body       TEXT NOT NULL
                )
                "#,
            ),
            (
                "flow_steps table",
                r#"
                CREATE TABLE IF NOT EXISTS flow_steps (
                    id            TEXT PRIMARY KEY,
                    request_id    TEXT NOT NULL,
                    logic_version TEXT NOT NULL,
                    step_order    INTEGER NOT NULL,
                    body          TEXT NOT NULL
                )
                "#,
            ),
            (
                "flow_steps request index",
                "CREATE INDEX IF NOT EXISTS idx_flow_steps_request ON flow_steps(request_id, step_order)",
            ),
            (
                "flow_steps version index",
                "CREATE INDEX IF NOT EXISTS idx_flow_steps_version ON flow_steps(logic_version)",
            ),
            (
                "reference_usage table",
                r#"
                CREATE TABLE IF NOT EXISTS reference_usage (
                    id              TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    created_at      TEXT NOT NULL,
                    body            TEXT NOT NULL
                )
                "#,
            ),
            (
                "reference_usage index",
                "CREATE INDEX IF NOT EXISTS idx_reference_usage_conversation ON reference_usage(conversation_id, created_at)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO turns (id, conversation_id, role, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&turn.id)
        .bind(conversation_id)
        .bind(turn.role.as_str())
        .bind(turn.timestamp.to_rfc3339())
        .bind(encode(turn)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT turn failed: {e}")))?;
        Ok(())
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT body FROM turns WHERE conversation_id = ?1 ORDER BY seq ASC")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("list turns: {e}")))?;
        decode(rows)
    }

    async fn upsert_logic_version(&self, version: &LogicVersion) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO logic_versions (version, is_active, created_at, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(version) DO UPDATE SET
                is_active = excluded.is_active,
                body = excluded.body
            "#,
        )
        .bind(&version.version)
        .bind(version.is_active)
        .bind(version.created_at.to_rfc3339())
        .bind(encode(version)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT logic version failed: {e}")))?;
        Ok(())
    }

    async fn get_logic_version(&self, version: &str) -> Result<Option<LogicVersion>, StoreError> {
        let rows = sqlx::query("SELECT body FROM logic_versions WHERE version = ?1")
            .bind(version)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get logic version: {e}")))?;
        Ok(decode(rows)?.into_iter().next())
    }

    async fn active_logic_version(&self) -> Result<Option<LogicVersion>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM logic_versions WHERE is_active = 1 ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("active logic version: {e}")))?;
        Ok(decode(rows)?.into_iter().next())
    }

    async fn list_logic_versions(&self) -> Result<Vec<LogicVersion>, StoreError> {
        let rows = sqlx::query("SELECT body FROM logic_versions ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("list logic versions: {e}")))?;
        decode(rows)
    }

    async fn append_flow_step(&self, step: &FlowStepRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO flow_steps (id, request_id, logic_version, step_order, body) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&step.id)
        .bind(&step.request_id)
        .bind(&step.logic_version)
        .bind(step.step_order as i64)
        .bind(encode(step)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT flow step failed: {e}")))?;
        Ok(())
    }

    async fn list_flow_steps(&self, request_id: &str) -> Result<Vec<FlowStepRecord>, StoreError> {
        let rows = sqlx::query("SELECT body FROM flow_steps WHERE request_id = ?1 ORDER BY step_order ASC")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("list flow steps: {e}")))?;
        decode(rows)
    }

    async fn list_flow_steps_for_version(&self, version: &str) -> Result<Vec<FlowStepRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM flow_steps WHERE logic_version = ?1 ORDER BY request_id, step_order",
        )
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list flow steps for version: {e}")))?;
        decode(rows)
    }

    async fn record_reference_usage(&self, record: &ReferenceUsageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reference_usage (id, conversation_id, created_at, body) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(record.created_at.to_rfc3339())
        .bind(encode(record)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT reference usage failed: {e}")))?;
        Ok(())
    }

    async fn list_reference_usage(&self, conversation_id: &str) -> Result<Vec<ReferenceUsageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM reference_usage WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list reference usage: {e}")))?;
        decode(rows)
    }
}
