//! # OpsClaw Core
//!
//! Domain types, traits, and error definitions for the OpsClaw operations
//! assistant. This crate has **no transport or storage dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Seams
//!
//! The orchestration core talks to three external collaborators, each
//! defined here as a narrow trait:
//! - [`Provider`] for model backends
//! - [`Executor`] / [`PreCheck`] for operation handlers
//! - [`Store`] for durable conversation and audit records

pub mod error;
pub mod message;
pub mod provider;
pub mod operation;
pub mod reference;
pub mod audit;
pub mod store;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Message, Role, ConversationId, MessageToolCall};
pub use provider::{
    FinishReason, ModelCapabilities, Provider, ProviderRequest, ProviderResponse,
    TokenLimitParam, ToolDefinition, Usage,
};
pub use operation::{
    Caller, ErrorCode, Executor, ExecutorError, OperationKind, OperationOutcome,
    OperationOutput, PreCheck, PreCheckFailure,
};
pub use reference::{Bundle, Fragment, FragmentCategory, ReferenceUsageRecord};
pub use audit::{FlowStepRecord, LogicConfig, LogicVersion, StepType};
pub use store::Store;
pub use event::{DomainEvent, EventBus};
