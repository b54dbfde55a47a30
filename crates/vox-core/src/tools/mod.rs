//! Tool system for remote function calling.
//!
//! The registry is built imperatively before a session starts and is
//! read-only for the session's lifetime. A tool-call request is looked up,
//! its arguments validated and coerced against the declared schema, and the
//! handler executed on a bounded worker pool with a timeout, so a slow or
//! missing tool never stalls inbound event processing or ends the session.

pub mod builtins;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Semaphore, mpsc};

use crate::config::{TOOL_TIMEOUT, TOOL_WORKERS};

/// Async tool handler function.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Parameter types a tool schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
}

/// One declared tool parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: false,
        }
    }
}

/// Declared shape of a tool: description plus parameter specs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolSchema {
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// JSON-schema `parameters` object for the wire declaration.
    fn parameters_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let type_name = match param.param_type {
                ParamType::String => "string",
                ParamType::Number => "number",
                ParamType::Boolean => "boolean",
            };
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": type_name,
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": Value::Array(required),
        })
    }
}

/// Wire-facing tool declaration sent in the session setup frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Value(Value),
    Error(String),
}

/// Result of executing a tool, correlated to the originating call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The `response` payload sent back to the remote endpoint.
    pub fn response_payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Value(value) => value.clone(),
            ToolOutcome::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: ToolHandler,
}

/// Tool registry (declarations + handlers).
///
/// Populated via explicit `register` calls at startup and passed into the
/// session; there is no ambient module-level registration.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous registration of the name.
    pub fn register(&mut self, name: &str, schema: ToolSchema, handler: ToolHandler) {
        if self.tools.insert(name.to_string(), RegisteredTool { schema, handler }).is_none() {
            self.order.push(name.to_string());
        }
    }

    #[must_use]
    pub fn with_tool(mut self, name: &str, schema: ToolSchema, handler: ToolHandler) -> Self {
        self.register(name, schema, handler);
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Declarations for the session setup frame, in registration order.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|tool| (name, tool)))
            .map(|(name, tool)| ToolDeclaration {
                name: name.clone(),
                description: tool.schema.description.clone(),
                parameters: tool.schema.parameters_json(),
            })
            .collect()
    }

    /// Executes a tool call end to end: lookup, argument validation, handler
    /// execution under `timeout`.
    ///
    /// Never fails the session: every failure mode is folded into the
    /// returned `ToolResult`.
    pub async fn invoke(
        &self,
        name: &str,
        call_id: &str,
        args: Value,
        timeout: Duration,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = name, "tool call for unregistered name");
            return ToolResult {
                call_id: call_id.to_string(),
                name: name.to_string(),
                outcome: ToolOutcome::Error(format!("unknown tool: {name}")),
            };
        };

        let coerced = match coerce_args(&tool.schema, args) {
            Ok(coerced) => coerced,
            Err(message) => {
                return ToolResult {
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                    outcome: ToolOutcome::Error(message),
                };
            }
        };

        let outcome = match tokio::time::timeout(timeout, (tool.handler)(coerced)).await {
            Ok(Ok(value)) => ToolOutcome::Value(value),
            Ok(Err(message)) => ToolOutcome::Error(format!("error executing {name}: {message}")),
            Err(_) => ToolOutcome::Error(format!(
                "tool {name} timed out after {}s",
                timeout.as_secs()
            )),
        };

        ToolResult {
            call_id: call_id.to_string(),
            name: name.to_string(),
            outcome,
        }
    }
}

/// Validates arguments against the schema, coercing the representations
/// models commonly get wrong (numbers and booleans sent as strings).
fn coerce_args(schema: &ToolSchema, args: Value) -> Result<Value, String> {
    let mut map = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(format!("arguments must be an object, got {other}")),
    };

    let mut coerced = Map::new();
    for param in &schema.params {
        match map.remove(&param.name) {
            Some(value) => {
                let value = coerce_value(param, value)?;
                coerced.insert(param.name.clone(), value);
            }
            None if param.required => {
                return Err(format!("missing required argument: {}", param.name));
            }
            None => {}
        }
    }

    // Unknown arguments are dropped rather than failing the call.
    for unknown in map.keys() {
        tracing::debug!(argument = %unknown, "dropping undeclared tool argument");
    }

    Ok(Value::Object(coerced))
}

fn coerce_value(param: &ParamSpec, value: Value) -> Result<Value, String> {
    match (param.param_type, value) {
        (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParamType::String, other) => Ok(Value::String(other.to_string())),
        (ParamType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("argument {} expects a number, got '{s}'", param.name)),
        (ParamType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParamType::Boolean, Value::String(raw)) => {
            match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "n" | "off" | "" => Ok(Value::Bool(false)),
                _ => Err(format!(
                    "argument {} expects a boolean, got '{raw}'",
                    param.name
                )),
            }
        }
        (expected, other) => Err(format!(
            "argument {} expects {expected:?}, got {other}",
            param.name
        )),
    }
}

/// Bounded worker pool executing tool calls off the receive path.
///
/// Completed results flow into `results`, where the session send loop
/// forwards them to the remote endpoint.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    permits: Arc<Semaphore>,
    results: mpsc::Sender<ToolResult>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, results: mpsc::Sender<ToolResult>) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(TOOL_WORKERS)),
            results,
            timeout: TOOL_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dispatches one call onto the pool. Returns immediately; the result
    /// is delivered through the results channel.
    pub fn dispatch(&self, call_id: String, name: String, args: Value) {
        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        let results = self.results.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return; // pool shut down
            };
            let result = registry.invoke(&name, &call_id, args, timeout).await;
            if result.is_error() {
                tracing::warn!(tool = %name, call_id = %call_id, "tool call failed");
            }
            let _ = results.send(result).await;
        });
    }
}
