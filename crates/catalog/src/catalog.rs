//! The operation catalog service.
//!
//! One explicitly constructed instance per deployment (or per test). Both
//! maps sit behind their own lock and no lock is ever held across an
//! `.await`, so a confirm racing a registration cannot corrupt either.

use crate::definition::{OperationDefinition, OperationSummary};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use opsclaw_core::error::CatalogError;
use opsclaw_core::event::{DomainEvent, EventBus};
use opsclaw_core::operation::{Caller, ErrorCode, OperationKind, OperationOutcome};
use opsclaw_core::provider::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A validated invocation waiting for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub handle: String,
    pub operation: String,
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Switches for one `invoke` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    pub skip_confirmation: bool,
    pub skip_validation: bool,
}

/// Narrows the operations offered to a caller.
#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    /// Only these kinds; empty = all
    pub kinds: Vec<OperationKind>,
    /// At least one of these tags; empty = all
    pub tags: Vec<String>,
}

impl DefinitionFilter {
    fn admits(&self, def: &OperationDefinition) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&def.kind);
        let tag_ok = self.tags.is_empty() || self.tags.iter().any(|t| def.tags.contains(t));
        kind_ok && tag_ok
    }
}

pub struct OperationCatalog {
    operations: RwLock<HashMap<String, Arc<OperationDefinition>>>,
    pending: Mutex<HashMap<String, PendingConfirmation>>,
    confirmation_ttl: Option<Duration>,
    event_bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for OperationCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCatalog")
            .field("operations", &self.len())
            .field("pending", &self.pending_count())
            .field("confirmation_ttl", &self.confirmation_ttl)
            .finish()
    }
}

impl Default for OperationCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn valid_operation_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            confirmation_ttl: None,
            event_bus: None,
        }
    }

    /// Discard pending confirmations older than `ttl`.
    pub fn with_confirmation_ttl(mut self, ttl: Duration) -> Self {
        self.confirmation_ttl = Some(ttl);
        self
    }

    /// Publish invocation events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register an operation. Fails if the name is taken.
    pub fn register(&self, definition: OperationDefinition) -> Result<(), CatalogError> {
        if !valid_operation_name(&definition.name) {
            return Err(CatalogError::InvalidDefinition {
                name: definition.name.clone(),
                reason: "name must be 1-64 characters of [A-Za-z0-9_-]".into(),
            });
        }

        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        if operations.contains_key(&definition.name) {
            return Err(CatalogError::DuplicateName(definition.name));
        }
        debug!(operation = %definition.name, kind = ?definition.kind, "Registered operation");
        operations.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<OperationDefinition>> {
        self.operations.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.operations.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations `roles` may use, sorted by name.
    pub fn available(&self, roles: &[String], filter: &DefinitionFilter) -> Vec<Arc<OperationDefinition>> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<Arc<OperationDefinition>> = operations
            .values()
            .filter(|d| d.permits(roles) && filter.admits(d))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Signatures to send to the model for a caller.
    pub fn definitions_for(&self, roles: &[String], filter: &DefinitionFilter) -> Vec<ToolDefinition> {
        self.available(roles, filter)
            .iter()
            .map(|d| d.to_tool_definition())
            .collect()
    }

    pub fn summaries_for(&self, roles: &[String], filter: &DefinitionFilter) -> Vec<OperationSummary> {
        self.available(roles, filter).iter().map(|d| d.summary()).collect()
    }

    // ── Invocation ──────────────────────────────────────────────────────

    /// Run an operation on behalf of `caller`.
    ///
    /// Never returns an error: every failure is an outcome with an
    /// [`ErrorCode`] and, for validation failures, the field names involved.
    pub async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
        caller: &Caller,
        options: InvokeOptions,
    ) -> OperationOutcome {
        let Some(def) = self.get(name) else {
            warn!(operation = %name, "Unknown operation requested");
            return OperationOutcome::failure(
                ErrorCode::NotFound,
                format!("Operation '{name}' not found"),
            );
        };

        if !def.permits(&caller.roles) {
            warn!(operation = %name, user = ?caller.user_id, "Operation refused: missing role");
            let outcome = OperationOutcome::failure(
                ErrorCode::PermissionDenied,
                "You don't have permission to perform this operation",
            );
            self.publish_invoked(name, &outcome, Duration::ZERO);
            return outcome;
        }

        if !options.skip_validation {
            let report = def.schema.validate(&params);
            if !report.is_valid() {
                let code = if report.missing.is_empty() {
                    ErrorCode::InvalidFields
                } else {
                    ErrorCode::MissingRequiredFields
                };
                debug!(operation = %name, missing = ?report.missing, invalid = report.invalid.len(), "Validation failed");
                return OperationOutcome::failure(code, report.describe(&def.schema))
                    .with_data(report.to_data());
            }

            if let Some(outcome) = self.run_pre_check(&def, &params, caller).await {
                return outcome;
            }
        }

        if def.requires_confirmation && !options.skip_confirmation {
            return self.park(&def, params, caller);
        }

        self.execute(&def, params, caller).await
    }

    /// Execute a parked invocation. Validation is not repeated.
    pub async fn confirm(&self, handle: &str, caller: &Caller) -> OperationOutcome {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = pending.get(handle) else {
                return Self::confirmation_not_found();
            };

            if self.is_expired(entry) {
                if let Some(expired) = pending.remove(handle) {
                    self.publish_resolved(&expired, "expired");
                }
                return Self::confirmation_not_found();
            }

            if entry.requested_by != caller.user_id {
                warn!(handle = %handle, user = ?caller.user_id, "Confirmation refused: identity mismatch");
                return OperationOutcome::failure(
                    ErrorCode::PermissionDenied,
                    "You cannot confirm another user's operation",
                );
            }

            match pending.remove(handle) {
                Some(entry) => entry,
                None => return Self::confirmation_not_found(),
            }
        };

        info!(handle = %handle, operation = %pending.operation, "Confirmation accepted");
        self.publish_resolved(&pending, "confirmed");

        let Some(def) = self.get(&pending.operation) else {
            return OperationOutcome::failure(
                ErrorCode::NotFound,
                format!("Operation '{}' not found", pending.operation),
            );
        };

        self.execute(&def, pending.params, caller).await
    }

    /// Drop a parked invocation. Returns whether anything was removed.
    pub fn cancel(&self, handle: &str) -> bool {
        let removed = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(handle);
        match removed {
            Some(entry) => {
                info!(handle = %handle, operation = %entry.operation, "Confirmation cancelled");
                self.publish_resolved(&entry, "cancelled");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self, handle: &str) -> Option<PendingConfirmation> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).get(handle).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove every expired pending confirmation. No-op without a TTL.
    pub fn purge_expired(&self) -> usize {
        if self.confirmation_ttl.is_none() {
            return 0;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = pending
            .values()
            .filter(|p| self.is_expired(p))
            .map(|p| p.handle.clone())
            .collect();
        for handle in &expired {
            if let Some(entry) = pending.remove(handle) {
                self.publish_resolved(&entry, "expired");
            }
        }
        expired.len()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn confirmation_not_found() -> OperationOutcome {
        OperationOutcome::failure(ErrorCode::NotFound, "Confirmation not found or expired")
    }

    fn is_expired(&self, entry: &PendingConfirmation) -> bool {
        match self.confirmation_ttl {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(entry.created_at);
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
            None => false,
        }
    }

    async fn run_pre_check(
        &self,
        def: &OperationDefinition,
        params: &serde_json::Value,
        caller: &Caller,
    ) -> Option<OperationOutcome> {
        let check = def.pre_check.as_ref()?;
        match AssertUnwindSafe(check.check(params, caller)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => {
                debug!(operation = %def.name, reason = %failure.message, "Pre-check rejected invocation");
                let mut outcome =
                    OperationOutcome::failure(ErrorCode::PreValidationFailed, failure.message);
                outcome.data = failure.data;
                Some(outcome)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(operation = %def.name, reason = %reason, "Pre-check panicked");
                Some(OperationOutcome::failure(
                    ErrorCode::PreValidationFailed,
                    format!("Validation error: {reason}"),
                ))
            }
        }
    }

    fn park(&self, def: &OperationDefinition, params: serde_json::Value, caller: &Caller) -> OperationOutcome {
        let handle = uuid::Uuid::new_v4().to_string();
        let entry = PendingConfirmation {
            handle: handle.clone(),
            operation: def.name.clone(),
            params: params.clone(),
            requested_by: caller.user_id.clone(),
            created_at: Utc::now(),
        };
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(handle.clone(), entry);

        info!(operation = %def.name, handle = %handle, "Confirmation requested");
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ConfirmationRequested {
                handle: handle.clone(),
                operation: def.name.clone(),
                timestamp: Utc::now(),
            });
        }

        OperationOutcome::confirmation_required(
            handle,
            format!("Operation '{}' requires confirmation", def.display_name),
            Some(serde_json::json!({
                "operation": def.name,
                "display_name": def.display_name,
                "destructive": def.destructive,
                "parameters": params,
            })),
        )
    }

    async fn execute(&self, def: &OperationDefinition, params: serde_json::Value, caller: &Caller) -> OperationOutcome {
        let started = Instant::now();
        let result = AssertUnwindSafe(def.executor.execute(params, caller))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(output)) => OperationOutcome::ok(
                output
                    .message
                    .unwrap_or_else(|| "Operation completed successfully".to_string()),
                output.data,
            ),
            Ok(Err(err)) => {
                warn!(operation = %def.name, error = %err, "Operation failed");
                let mut outcome = OperationOutcome::failure(
                    ErrorCode::ExecutionError,
                    format!("Operation failed: {err}"),
                );
                if let opsclaw_core::operation::ExecutorError::Failed { data, .. } = err {
                    outcome.data = data;
                }
                outcome
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(operation = %def.name, reason = %reason, "Operation panicked");
                OperationOutcome::failure(ErrorCode::ExecutionError, format!("Operation failed: {reason}"))
            }
        };

        self.publish_invoked(&def.name, &outcome, started.elapsed());
        outcome
    }

    fn publish_invoked(&self, operation: &str, outcome: &OperationOutcome, elapsed: Duration) {
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::OperationInvoked {
                operation: operation.to_string(),
                success: outcome.success,
                error_code: outcome.error_code.map(|c| c.as_str().to_string()),
                duration_ms: elapsed.as_millis() as u64,
                timestamp: Utc::now(),
            });
        }
    }

    fn publish_resolved(&self, entry: &PendingConfirmation, resolution: &str) {
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ConfirmationResolved {
                handle: entry.handle.clone(),
                operation: entry.operation.clone(),
                resolution: resolution.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}
