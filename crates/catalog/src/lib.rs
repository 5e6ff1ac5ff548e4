//! Operation catalog for OpsClaw.
//!
//! The catalog is the only way the agent loop touches the outside world.
//! It owns the registered operations and the pending-confirmation table,
//! and turns every call (including failures and panics) into an
//! [`OperationOutcome`](opsclaw_core::OperationOutcome).
//!
//! ```text
//! invoke ─► lookup ─► role check ─► schema ─► pre-check ─┬─► confirmation? ─► park (handle)
//!                                                        └─► execute ─► outcome
//! confirm(handle) ─► identity check ─► execute ─► outcome
//! ```

pub mod builtin;
pub mod catalog;
pub mod definition;
pub mod schema;

pub use catalog::{DefinitionFilter, InvokeOptions, OperationCatalog, PendingConfirmation};
pub use definition::{OperationDefinition, OperationSummary};
pub use schema::{FieldSpec, FieldType, InvalidField, ParameterSchema, ValidationReport};
