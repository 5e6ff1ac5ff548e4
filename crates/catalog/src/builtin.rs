//! Operations every deployment gets for free.

use crate::catalog::OperationCatalog;
use crate::definition::OperationDefinition;
use crate::schema::{FieldSpec, ParameterSchema};
use opsclaw_core::error::CatalogError;
use opsclaw_core::operation::{OperationKind, OperationOutput, executor_fn};
use serde_json::json;

/// Liveness check the model can call without side effects.
pub fn ping() -> OperationDefinition {
    OperationDefinition::new(
        "ping",
        OperationKind::Query,
        executor_fn(|_, _| async {
            Ok(OperationOutput::message("pong").with_data(json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        }),
    )
    .with_display_name("Ping")
    .with_description("Check that the assistant backend is reachable")
    .with_tags(["diagnostics"])
}

/// Repeats the given text back.
pub fn echo() -> OperationDefinition {
    OperationDefinition::new(
        "echo",
        OperationKind::Query,
        executor_fn(|params, _| async move {
            let text = params["text"].as_str().unwrap_or_default().to_string();
            Ok(OperationOutput::message(text.clone()).with_data(json!({ "text": text })))
        }),
    )
    .with_display_name("Echo")
    .with_description("Repeat a piece of text back to the caller")
    .with_schema(
        ParameterSchema::new().field(FieldSpec::string("text").describe("Text to repeat").required()),
    )
    .with_tags(["diagnostics"])
}

/// Register `ping` and `echo`.
pub fn register_defaults(catalog: &OperationCatalog) -> Result<(), CatalogError> {
    catalog.register(ping())?;
    catalog.register(echo())?;
    Ok(())
}
