//! Hand-authored parameter schemas and validation.
//!
//! Each operation declares its fields explicitly. The same descriptor
//! renders the JSON Schema sent to the model and validates what the model
//! sends back, so the two can never drift apart.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON type a field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// JSON type name of a value, as reported in validation messages.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One parameter of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: bool,

    /// Allowed values; empty means any value of the right type
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: false,
            allowed: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    fn to_json_schema(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(self.field_type.as_str()));
        if !self.description.is_empty() {
            prop.insert("description".into(), json!(self.description));
        }
        if !self.allowed.is_empty() {
            prop.insert("enum".into(), Value::Array(self.allowed.clone()));
        }
        Value::Object(prop)
    }
}

/// The full parameter list of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Render as a JSON Schema object for a tool definition.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.to_json_schema()))
            .collect();
        let required: Vec<&str> = self.required_fields().map(|f| f.name.as_str()).collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `params` against the schema.
    ///
    /// A required field is missing when absent, `null`, or a blank string.
    /// Fields not declared in the schema are ignored.
    pub fn validate(&self, params: &Value) -> ValidationReport {
        let mut report = ValidationReport::default();

        let Some(object) = params.as_object() else {
            report.invalid.push(InvalidField {
                field: "parameters".into(),
                reason: format!("Expected object, got {}", json_type_name(params)),
            });
            return report;
        };

        for field in &self.fields {
            let value = object.get(&field.name);
            let is_blank = match value {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };

            if is_blank {
                if field.required {
                    report.missing.push(field.name.clone());
                }
                continue;
            }

            // is_blank covered None
            let Some(value) = value else { continue };

            if !field.field_type.accepts(value) {
                report.invalid.push(InvalidField {
                    field: field.name.clone(),
                    reason: format!(
                        "Expected {}, got {}",
                        field.field_type.as_str(),
                        json_type_name(value)
                    ),
                });
                continue;
            }

            if !field.allowed.is_empty() && !field.allowed.contains(value) {
                let options: Vec<String> = field.allowed.iter().map(|v| v.to_string()).collect();
                report.invalid.push(InvalidField {
                    field: field.name.clone(),
                    reason: format!("Must be one of: [{}]", options.join(", ")),
                });
            }
        }

        report
    }
}

/// A field that is present but unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidField {
    pub field: String,
    pub reason: String,
}

/// What schema validation found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub missing: Vec<String>,
    pub invalid: Vec<InvalidField>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    /// Structured detail for the outcome, always carrying both lists.
    pub fn to_data(&self) -> Value {
        json!({
            "missing_fields": self.missing,
            "invalid_fields": self.invalid,
        })
    }

    /// Message a model (or a person) can act on.
    pub fn describe(&self, schema: &ParameterSchema) -> String {
        let mut sections = Vec::new();

        if !self.missing.is_empty() {
            let mut text = String::from("The following required fields are missing:");
            for name in &self.missing {
                let description = schema
                    .get(name)
                    .map(|f| f.description.as_str())
                    .filter(|d| !d.is_empty())
                    .unwrap_or("No description");
                text.push_str(&format!("\n- `{name}`: {description}"));
            }
            sections.push(text);
        }

        if !self.invalid.is_empty() {
            let mut text = String::from("The following fields are invalid:");
            for invalid in &self.invalid {
                text.push_str(&format!("\n- `{}`: {}", invalid.field, invalid.reason));
            }
            sections.push(text);
        }

        sections.join("\n\n")
    }
}
