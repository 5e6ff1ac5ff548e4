//! Flow/audit logging.
//!
//! Every request is bound to the active logic version and leaves an
//! ordered trail of typed, timed steps in the store. Payloads are cut
//! down before they are written so a large operation result cannot bloat
//! the audit tables. Store failures are logged and otherwise ignored: the
//! audit trail never takes a request down with it.

use chrono::Utc;
use opsclaw_config::FlowConfig;
use opsclaw_core::audit::{FlowStepRecord, LogicConfig, LogicVersion, StepType};
use opsclaw_core::error::StoreError;
use opsclaw_core::store::Store;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Payload truncation ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    pub max_string_len: usize,
    pub max_list_items: usize,
    pub max_depth: usize,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self::from(&FlowConfig::default())
    }
}

impl From<&FlowConfig> for FlowLimits {
    fn from(config: &FlowConfig) -> Self {
        Self {
            max_string_len: config.max_string_len,
            max_list_items: config.max_list_items,
            max_depth: config.max_depth,
        }
    }
}

/// Shrink a payload to fit the limits.
pub fn truncate_value(value: &Value, limits: &FlowLimits) -> Value {
    truncate_at(value, limits, 0)
}

fn truncate_at(value: &Value, limits: &FlowLimits, depth: usize) -> Value {
    if depth > limits.max_depth {
        return Value::String("[max depth]".into());
    }
    match value {
        Value::String(s) => Value::String(truncate_str(s, limits.max_string_len)),
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.max_list_items)
                .map(|v| truncate_at(v, limits, depth + 1))
                .collect();
            if items.len() > limits.max_list_items {
                out.push(Value::String(format!(
                    "... [truncated {} items]",
                    items.len() - limits.max_list_items
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_at(v, limits, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let prefix: String = s.chars().take(max).collect();
    format!("{prefix}... [truncated {} chars]", total - max)
}

// ── Logic versions ──────────────────────────────────────────────────────

/// First 16 hex chars of the SHA-256 of the config's canonical JSON.
pub fn compute_config_hash(config: &LogicConfig) -> String {
    // serde_json maps are key-sorted, so this is canonical.
    let canonical = serde_json::to_value(config)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Aggregates over every step recorded under one logic version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicVersionStats {
    pub version: String,
    pub request_count: usize,
    pub step_count: usize,
    pub error_count: usize,
    pub total_tokens: u64,
    /// Mean duration of `llm_call` steps
    pub avg_llm_duration_ms: Option<f64>,
}

/// Manages logic versions in the store. Exactly one version is active
/// after any successful activation.
pub struct LogicVersions {
    store: Arc<dyn Store>,
    write_lock: tokio::sync::Mutex<()>,
}

impl LogicVersions {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The active version, creating and activating the configured one when
    /// nothing is active yet.
    pub async fn ensure_active(&self, config: &FlowConfig, logic: LogicConfig) -> Result<LogicVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(active) = self.store.active_logic_version().await? {
            return Ok(active);
        }
        match self.store.get_logic_version(&config.logic_version).await? {
            Some(existing) => self.activate_locked(existing).await,
            None => {
                let version = new_version(&config.logic_version, &config.logic_name, None, logic, true);
                self.store.upsert_logic_version(&version).await?;
                info!(version = %version.version, hash = %version.config_hash, "Created initial logic version");
                Ok(version)
            }
        }
    }

    /// Register a new version. Fails if the label is taken.
    pub async fn create(
        &self,
        version: &str,
        name: &str,
        description: Option<String>,
        logic: LogicConfig,
        activate: bool,
    ) -> Result<LogicVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.store.get_logic_version(version).await?.is_some() {
            return Err(StoreError::Conflict(format!("logic version {version}")));
        }
        let created = new_version(version, name, description, logic, false);
        self.store.upsert_logic_version(&created).await?;
        info!(version = %created.version, hash = %created.config_hash, "Created logic version");
        if activate {
            self.activate_locked(created).await
        } else {
            Ok(created)
        }
    }

    /// Make `version` the only active version.
    pub async fn activate(&self, version: &str) -> Result<LogicVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        let target = self
            .store
            .get_logic_version(version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("logic version {version}")))?;
        self.activate_locked(target).await
    }

    async fn activate_locked(&self, mut target: LogicVersion) -> Result<LogicVersion, StoreError> {
        for mut other in self.store.list_logic_versions().await? {
            if other.is_active && other.version != target.version {
                other.is_active = false;
                self.store.upsert_logic_version(&other).await?;
            }
        }
        target.is_active = true;
        self.store.upsert_logic_version(&target).await?;
        info!(version = %target.version, "Activated logic version");
        Ok(target)
    }

    /// Retire a version. It stays queryable but is no longer active.
    pub async fn deprecate(&self, version: &str) -> Result<LogicVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut target = self
            .store
            .get_logic_version(version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("logic version {version}")))?;
        target.is_active = false;
        target.deprecated_at = Some(Utc::now());
        self.store.upsert_logic_version(&target).await?;
        info!(version = %target.version, "Deprecated logic version");
        Ok(target)
    }

    pub async fn list(&self) -> Result<Vec<LogicVersion>, StoreError> {
        self.store.list_logic_versions().await
    }

    pub async fn active(&self) -> Result<Option<LogicVersion>, StoreError> {
        self.store.active_logic_version().await
    }

    pub async fn stats(&self, version: &str) -> Result<LogicVersionStats, StoreError> {
        let steps = self.store.list_flow_steps_for_version(version).await?;
        let requests: HashSet<&str> = steps.iter().map(|s| s.request_id.as_str()).collect();
        let llm_durations: Vec<u64> = steps
            .iter()
            .filter(|s| s.step_type == StepType::LlmCall)
            .filter_map(|s| s.duration_ms)
            .collect();

        Ok(LogicVersionStats {
            version: version.to_string(),
            request_count: requests.len(),
            step_count: steps.len(),
            error_count: steps.iter().filter(|s| is_error(s)).count(),
            total_tokens: steps.iter().filter_map(|s| s.tokens).map(u64::from).sum(),
            avg_llm_duration_ms: (!llm_durations.is_empty())
                .then(|| llm_durations.iter().sum::<u64>() as f64 / llm_durations.len() as f64),
        })
    }
}

fn new_version(
    version: &str,
    name: &str,
    description: Option<String>,
    logic: LogicConfig,
    is_active: bool,
) -> LogicVersion {
    LogicVersion {
        version: version.to_string(),
        name: name.to_string(),
        description,
        config_hash: compute_config_hash(&logic),
        config: logic,
        is_active,
        created_at: Utc::now(),
        deprecated_at: None,
    }
}

fn is_error(step: &FlowStepRecord) -> bool {
    step.error.is_some() || step.step_type == StepType::FlowError
}

// ── Per-request logger ──────────────────────────────────────────────────

/// Totals for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    pub request_id: String,
    pub logic_version: String,
    pub step_count: usize,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub error_count: usize,
}

/// Records the steps of one request.
pub struct FlowLogger {
    store: Arc<dyn Store>,
    request_id: String,
    conversation_id: String,
    logic_version: String,
    limits: FlowLimits,
    next_order: AtomicU32,
    steps: Mutex<Vec<FlowStepRecord>>,
}

impl FlowLogger {
    pub fn new(
        store: Arc<dyn Store>,
        conversation_id: impl Into<String>,
        logic_version: impl Into<String>,
        limits: FlowLimits,
    ) -> Self {
        Self {
            store,
            request_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            logic_version: logic_version.into(),
            limits,
            next_order: AtomicU32::new(1),
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn logic_version(&self) -> &str {
        &self.logic_version
    }

    /// Start describing a step; nothing is written until [`StepBuilder::record`].
    pub fn step(&self, step_type: StepType, name: impl Into<String>) -> StepBuilder<'_> {
        StepBuilder {
            logger: self,
            step_type,
            name: name.into(),
            input: None,
            output: None,
            duration_ms: None,
            tokens: None,
            metadata: serde_json::Map::new(),
            error: None,
        }
    }

    /// Steps recorded so far, in order.
    pub fn steps(&self) -> Vec<FlowStepRecord> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn summary(&self) -> FlowSummary {
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        FlowSummary {
            request_id: self.request_id.clone(),
            logic_version: self.logic_version.clone(),
            step_count: steps.len(),
            total_duration_ms: steps.iter().filter_map(|s| s.duration_ms).sum(),
            total_tokens: steps.iter().filter_map(|s| s.tokens).map(u64::from).sum(),
            error_count: steps.iter().filter(|s| is_error(s)).count(),
        }
    }

    async fn write(&self, record: FlowStepRecord) -> FlowStepRecord {
        debug!(
            request_id = %record.request_id,
            order = record.step_order,
            step = %record.step_type,
            name = %record.step_name,
            duration_ms = ?record.duration_ms,
            tokens = ?record.tokens,
            error = ?record.error,
            "flow step"
        );
        if let Err(e) = self.store.append_flow_step(&record).await {
            warn!(
                request_id = %self.request_id,
                step = %record.step_type,
                error = %e,
                "Failed to persist flow step"
            );
        }
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        record
    }
}

/// Builder for one flow step.
#[must_use = "a step is only written by `record`"]
pub struct StepBuilder<'a> {
    logger: &'a FlowLogger,
    step_type: StepType,
    name: String,
    input: Option<Value>,
    output: Option<Value>,
    duration_ms: Option<u64>,
    tokens: Option<u32>,
    metadata: serde_json::Map<String, Value>,
    error: Option<String>,
}

impl StepBuilder<'_> {
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn error(mut self, error: impl Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Truncate, order, and persist the step.
    pub async fn record(self) -> FlowStepRecord {
        let logger = self.logger;
        let limits = logger.limits;
        let record = FlowStepRecord {
            id: Uuid::new_v4().to_string(),
            request_id: logger.request_id.clone(),
            conversation_id: logger.conversation_id.clone(),
            logic_version: logger.logic_version.clone(),
            step_order: logger.next_order.fetch_add(1, Ordering::SeqCst),
            step_type: self.step_type,
            step_name: self.name,
            input: self.input.map(|v| truncate_value(&v, &limits)),
            output: self.output.map(|v| truncate_value(&v, &limits)),
            duration_ms: self.duration_ms,
            tokens: self.tokens,
            metadata: self.metadata,
            error: self.error.map(|e| truncate_str(&e, limits.max_string_len)),
            created_at: Utc::now(),
        };
        logger.write(record).await
    }
}
