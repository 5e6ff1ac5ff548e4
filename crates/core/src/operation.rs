//! Operation contract: what the catalog asks of domain handlers.
//!
//! Operations are the units of work the agent loop can trigger: restart a
//! VM, look up a ticket, delete a widget. Handlers live in the surrounding
//! application and implement [`Executor`] (and optionally [`PreCheck`]).
//! Every catalog call produces an [`OperationOutcome`], success or not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Who is invoking an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Requester identity; `None` for anonymous callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Roles held by the requester
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Capability classification of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Create,
    Update,
    Delete,
    Execute,
}

/// Machine-readable failure code carried by an unsuccessful outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    MissingRequiredFields,
    InvalidFields,
    PreValidationFailed,
    ExecutionError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::MissingRequiredFields => "missing_required_fields",
            Self::InvalidFields => "invalid_fields",
            Self::PreValidationFailed => "pre_validation_failed",
            Self::ExecutionError => "execution_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Result of any catalog call.
///
/// `requires_confirmation` is only ever set after validation passed, and
/// always comes with a `confirmation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_confirmation: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl OperationOutcome {
    /// A successful outcome.
    pub fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            requires_confirmation: false,
            confirmation_id: None,
            error_code: None,
        }
    }

    /// A failed outcome with a machine-readable code.
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            requires_confirmation: false,
            confirmation_id: None,
            error_code: Some(code),
        }
    }

    /// A validated invocation parked until the caller confirms it.
    pub fn confirmation_required(
        handle: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
            requires_confirmation: true,
            confirmation_id: Some(handle.into()),
            error_code: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// What an executor hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Human-readable summary; the catalog supplies a default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn data(data: serde_json::Value) -> Self {
        Self {
            message: None,
            data: Some(data),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Why an executor could not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// The handler ran and rejected the request (e.g. target not found upstream)
    #[error("{message}")]
    Failed {
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The handler could not run at all (network, upstream outage, bug)
    #[error("{0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            data: None,
        }
    }
}

/// A custom pre-check rejection, surfaced to the model so it can self-correct.
#[derive(Debug, Clone, PartialEq)]
pub struct PreCheckFailure {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl PreCheckFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The handler bound to an operation.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        params: serde_json::Value,
        caller: &Caller,
    ) -> std::result::Result<OperationOutput, ExecutorError>;
}

/// Domain-specific validation that runs after schema validation.
#[async_trait]
pub trait PreCheck: Send + Sync {
    async fn check(
        &self,
        params: &serde_json::Value,
        caller: &Caller,
    ) -> std::result::Result<(), PreCheckFailure>;
}

/// Adapter so plain async closures can serve as executors.
pub struct FnExecutor<F>(F);

/// Wrap an async closure as an [`Executor`].
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(serde_json::Value, Caller) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<OperationOutput, ExecutorError>> + Send,
{
    FnExecutor(f)
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(serde_json::Value, Caller) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<OperationOutput, ExecutorError>> + Send,
{
    async fn execute(
        &self,
        params: serde_json::Value,
        caller: &Caller,
    ) -> std::result::Result<OperationOutput, ExecutorError> {
        (self.0)(params, caller.clone()).await
    }
}

/// Adapter so plain async closures can serve as pre-checks.
pub struct FnPreCheck<F>(F);

/// Wrap an async closure as a [`PreCheck`].
pub fn pre_check_fn<F, Fut>(f: F) -> FnPreCheck<F>
where
    F: Fn(serde_json::Value, Caller) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), PreCheckFailure>> + Send,
{
    FnPreCheck(f)
}

#[async_trait]
impl<F, Fut> PreCheck for FnPreCheck<F>
where
    F: Fn(serde_json::Value, Caller) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), PreCheckFailure>> + Send,
{
    async fn check(
        &self,
        params: &serde_json::Value,
        caller: &Caller,
    ) -> std::result::Result<(), PreCheckFailure> {
        (self.0)(params.clone(), caller.clone()).await
    }
}
