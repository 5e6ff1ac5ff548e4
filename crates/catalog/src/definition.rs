//! Operation definitions.

use crate::schema::ParameterSchema;
use opsclaw_core::operation::{Executor, OperationKind, PreCheck};
use opsclaw_core::provider::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A registered unit of work. Immutable once registered.
#[derive(Clone)]
pub struct OperationDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub kind: OperationKind,
    pub schema: ParameterSchema,
    pub requires_confirmation: bool,
    pub destructive: bool,
    /// Empty = unrestricted
    pub allowed_roles: Vec<String>,
    pub tags: Vec<String>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) pre_check: Option<Arc<dyn PreCheck>>,
}

impl std::fmt::Debug for OperationDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("destructive", &self.destructive)
            .field("allowed_roles", &self.allowed_roles)
            .field("has_pre_check", &self.pre_check.is_some())
            .finish()
    }
}

impl OperationDefinition {
    pub fn new(name: impl Into<String>, kind: OperationKind, executor: impl Executor + 'static) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            kind,
            schema: ParameterSchema::default(),
            requires_confirmation: false,
            destructive: false,
            allowed_roles: Vec::new(),
            tags: Vec::new(),
            executor: Arc::new(executor),
            pre_check: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Park invocations until a matching `confirm`.
    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    /// Mark as destructive. Destructive operations always require confirmation.
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self.requires_confirmation = true;
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pre_check(mut self, check: impl PreCheck + 'static) -> Self {
        self.pre_check = Some(Arc::new(check));
        self
    }

    /// Whether a caller holding `roles` may use this operation.
    pub fn permits(&self, roles: &[String]) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.iter().any(|r| roles.contains(r))
    }

    /// Signature sent to the model.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }

    /// Serializable description for listings and prompts.
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            kind: self.kind,
            requires_confirmation: self.requires_confirmation,
            destructive: self.destructive,
            allowed_roles: self.allowed_roles.clone(),
            tags: self.tags.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }
}

/// Public view of a definition (no executor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub kind: OperationKind,
    pub requires_confirmation: bool,
    pub destructive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use opsclaw_core::operation::{OperationOutput, executor_fn};

    fn noop() -> impl Executor {
        executor_fn(|_, _| async { Ok(OperationOutput::default()) })
    }

    #[test]
    fn empty_roles_permit_everyone() {
        let def = OperationDefinition::new("ping", OperationKind::Query, noop());
        assert!(def.permits(&[]));
        assert!(def.permits(&["viewer".to_string()]));
    }

    #[test]
    fn restricted_roles_need_intersection() {
        let def = OperationDefinition::new("reboot", OperationKind::Execute, noop())
            .with_roles(["admin", "ops"]);
        assert!(!def.permits(&[]));
        assert!(!def.permits(&["viewer".to_string()]));
        assert!(def.permits(&["viewer".to_string(), "ops".to_string()]));
    }

    #[test]
    fn destructive_implies_confirmation() {
        let def = OperationDefinition::new("drop_db", OperationKind::Delete, noop()).destructive();
        assert!(def.requires_confirmation);
        assert!(def.destructive);
    }

    #[test]
    fn tool_definition_uses_schema() {
        let def = OperationDefinition::new("get_vm", OperationKind::Query, noop())
            .with_description("Look up a VM")
            .with_schema(ParameterSchema::new().field(FieldSpec::string("vm_id").required()));
        let tool = def.to_tool_definition();
        assert_eq!(tool.name, "get_vm");
        assert_eq!(tool.description, "Look up a VM");
        assert_eq!(tool.parameters["required"], serde_json::json!(["vm_id"]));
    }

    #[test]
    fn display_name_defaults_to_name() {
        let def = OperationDefinition::new("ping", OperationKind::Query, noop());
        assert_eq!(def.display_name, "ping");
        assert_eq!(def.summary().display_name, "ping");
    }
}
