//! Tool registry: capability-tagged handlers behind one invoke contract.

use crate::database::result::QueryResult;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Closed set of tool capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    DataQuery,
    ExternalCall,
    Completion,
}

/// Declared parameter types for tool inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One named, typed tool parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: description.into(),
        }
    }
}

/// Registered tool metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub capability: Capability,
    pub description: String,
    pub input_schema: Vec<ParamSpec>,
}

/// Validates `args` against the descriptor's schema.
///
/// Fails fast with [`AgentError::InvalidInput`] on a missing required
/// parameter or a type mismatch; the handler is never reached with
/// unvalidated input. Unknown keys are allowed.
pub fn validate_input(descriptor: &ToolDescriptor, args: &Value) -> Result<()> {
    let Some(object) = args.as_object() else {
        return Err(AgentError::InvalidInput(format!(
            "arguments for '{}' must be an object",
            descriptor.name
        )));
    };

    for param in &descriptor.input_schema {
        match object.get(&param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    return Err(AgentError::InvalidInput(format!(
                        "missing required parameter '{}' for tool '{}'",
                        param.name, descriptor.name
                    )));
                }
            }
            Some(value) => {
                if !param.param_type.matches(value) {
                    return Err(AgentError::InvalidInput(format!(
                        "parameter '{}' for tool '{}' must be of type {:?}",
                        param.name, descriptor.name, param.param_type
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Validated input handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolInput {
    /// Validated arguments (always a JSON object).
    pub args: Value,
    /// Raw request text the arguments were derived from.
    pub text: String,
    /// Outputs of earlier tools in a compound chain, in execution order.
    pub context: Vec<Value>,
}

impl ToolInput {
    pub fn new(args: Value, text: impl Into<String>) -> Self {
        Self {
            args,
            text: text.into(),
            context: Vec::new(),
        }
    }

    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

/// Tool execution result in one of the payload shapes the caller can render.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutput {
    Rows(QueryResult),
    Scalar(Value),
    Text(String),
}

impl ToolOutput {
    /// JSON snapshot stored in invocation records and chain context.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// One-line rendering for result summaries.
    pub fn brief(&self) -> String {
        match self {
            Self::Rows(result) => match result.rows_affected {
                Some(n) => format!("{n} row(s) affected"),
                None => format!("{} row(s)", result.row_count),
            },
            Self::Scalar(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// A registered, capability-tagged executable unit.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Whether a generic execution failure is safe to retry.
    fn idempotent(&self) -> bool {
        false
    }

    /// Derives arguments from raw request text for classified requests.
    /// Overrides with explicit arguments skip this step.
    async fn prepare(&self, _text: &str) -> Result<Value> {
        Ok(Value::Object(serde_json::Map::new()))
    }

    /// Executes the tool with validated input.
    async fn invoke(&self, input: ToolInput) -> Result<ToolOutput>;
}

impl std::fmt::Debug for dyn ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandler")
            .field("name", &self.descriptor().name)
            .finish()
    }
}

/// Name-keyed registry preserving declaration order.
///
/// Built once at startup; immutable afterward (shared as `Arc<ToolRegistry>`),
/// so lookups need no synchronization.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolHandler>>,
    descriptors: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            descriptors: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::DuplicateToolName`] if the name is taken.
    pub fn register<T: ToolHandler + 'static>(&mut self, tool: T) -> Result<()> {
        let descriptor = tool.descriptor();
        if self.by_name.contains_key(&descriptor.name) {
            return Err(AgentError::DuplicateToolName(descriptor.name));
        }
        debug!("Registering tool: {}", descriptor.name);
        self.by_name
            .insert(descriptor.name.clone(), self.tools.len());
        self.descriptors.push(descriptor);
        self.tools.push(Arc::new(tool));
        Ok(())
    }

    /// Resolves a handler by name.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownTool`] for unregistered names.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ToolHandler>> {
        self.by_name
            .get(name)
            .map(|&i| Arc::clone(&self.tools[i]))
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
    }

    /// Descriptors in declaration order.
    pub fn list(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    /// First registered tool with the given capability; declaration order
    /// breaks ties.
    pub fn first_with_capability(&self, capability: Capability) -> Option<Arc<dyn ToolHandler>> {
        self.descriptors
            .iter()
            .position(|d| d.capability == capability)
            .map(|i| Arc::clone(&self.tools[i]))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
