//! Tool handler trait, registry and validating invoker
//!
//! Each tool is registered once with a statically declared schema. Every
//! call is validated against that schema before the handler runs, and the
//! handler itself runs on a spawned task so a slow or panicking
//! collaborator cannot stall the turn that called it.

use crate::error::{EngineError, ToolError};
use crate::models::{ParamType, ToolCallRequest, ToolCallSignature, ToolResult, ToolSchema};
use crate::Result;
use serde_json::{Map, Number, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod catalog;
pub mod knowledge;

/// Arguments after schema validation: required present, unknown dropped,
/// every value coerced to its declared type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArguments(Map<String, Value>);

impl ToolArguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// External capability behind a tool name (market data, portfolio queries,
/// vector search, web search). Opaque to the engine.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: ToolArguments) -> Result<Value>;
}

/// Adapter turning an async closure into a handler.
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolArguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, args: ToolArguments) -> Result<Value> {
        (self.0)(args).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: Arc<dyn ToolHandler>,
}

/// Tool registry for looking up, validating and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Registration order, so prompts list tools deterministically.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. The schema is checked once here and reused for every call.
    pub fn register(&mut self, schema: ToolSchema, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let name = schema.name.trim();
        if name.is_empty() {
            return Err(EngineError::Config("tool name must not be empty".into()));
        }
        if self.tools.contains_key(name) {
            return Err(EngineError::Config(format!(
                "tool '{}' is already registered",
                name
            )));
        }

        let mut seen = HashSet::new();
        for p in &schema.parameters {
            if p.name.trim().is_empty() || !seen.insert(p.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "tool '{}' declares an empty or duplicate parameter '{}'",
                    name, p.name
                )));
            }
        }

        let name = name.to_string();
        debug!(tool = %name, params = schema.parameters.len(), "registered tool");
        self.order.push(name.clone());
        self.tools.insert(name, RegisteredTool { schema, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.get(name).map(|t| &t.schema)
    }

    /// All schemas in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.schema.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a request against its tool's schema without running anything.
    pub fn validate(&self, request: &ToolCallRequest) -> std::result::Result<ToolArguments, ToolError> {
        let tool = self
            .tools
            .get(request.tool.trim())
            .ok_or_else(|| ToolError::UnknownTool(request.tool.clone()))?;
        validate_arguments(&tool.schema, &request.arguments)
    }

    /// Canonical signature of a request. Arguments that validate are
    /// signed in coerced form, so `"5"` and `5` are the same call.
    pub fn signature_for(&self, request: &ToolCallRequest) -> ToolCallSignature {
        let name = request.tool.trim();
        match self.validate(request) {
            Ok(args) => ToolCallSignature::new(name, args.as_map()),
            Err(_) => ToolCallSignature::new(name, &request.arguments),
        }
    }

    /// Validate, then execute the handler with an individual timeout.
    pub async fn invoke(&self, request: &ToolCallRequest, timeout: Duration) -> ToolResult {
        let signature = self.signature_for(request);

        let args = match self.validate(request) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %request.tool, error = %e, "tool call rejected");
                return ToolResult::failure(signature, e);
            }
        };

        // validate() succeeded, so the tool exists
        let Some(tool) = self.tools.get(request.tool.trim()) else {
            return ToolResult::failure(signature, ToolError::UnknownTool(request.tool.clone()));
        };

        info!(tool = %tool.schema.name, sig = %signature.fingerprint(), "invoking tool");
        let started = tokio::time::Instant::now();

        let handler = tool.handler.clone();
        // Aborted if this future is dropped (turn cancelled) or times out.
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.call(args).await }));

        let outcome = match tokio::time::timeout(timeout, &mut task.0).await {
            Err(_) => Err(ToolError::Timeout(timeout.as_millis() as u64)),
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "the tool failed unexpectedly"
                } else {
                    "the tool was cancelled"
                };
                Err(ToolError::Execution(reason.to_string()))
            }
            Ok(Ok(Err(e))) => Err(ToolError::Execution(describe_failure(e))),
            Ok(Ok(Ok(value))) => Ok(value),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                debug!(tool = %tool.schema.name, elapsed_ms, "tool succeeded");
                ToolResult::success(signature, value)
            }
            Err(e) => {
                warn!(tool = %tool.schema.name, elapsed_ms, error = %e, "tool failed");
                ToolResult::failure(signature, e)
            }
        }
    }
}

struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Model-consumable explanation of a handler failure.
fn describe_failure(error: EngineError) -> String {
    match error {
        EngineError::ToolExecution { message, .. } => message,
        EngineError::HttpError(e) if e.is_timeout() => "the data provider timed out".to_string(),
        EngineError::HttpError(_) => "the data provider could not be reached".to_string(),
        other => other.to_string(),
    }
}

fn validate_arguments(
    schema: &ToolSchema,
    raw: &Map<String, Value>,
) -> std::result::Result<ToolArguments, ToolError> {
    // (1) required parameters present
    for param in schema.required_parameters() {
        match raw.get(&param.name) {
            None | Some(Value::Null) => {
                return Err(ToolError::ArgumentValidation {
                    field: param.name.clone(),
                    reason: "required parameter is missing".to_string(),
                })
            }
            Some(_) => {}
        }
    }

    // (2) unknown arguments dropped, (3) declared ones coerced
    let mut validated = Map::new();
    for param in &schema.parameters {
        let Some(value) = raw.get(&param.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let coerced = coerce(value, param.param_type).map_err(|reason| {
            ToolError::ArgumentValidation {
                field: param.name.clone(),
                reason,
            }
        })?;
        validated.insert(param.name.clone(), coerced);
    }

    Ok(ToolArguments(validated))
}

fn coerce(value: &Value, expected: ParamType) -> std::result::Result<Value, String> {
    let mismatch = || format!("expected {}, got {}", type_label(expected), value);

    match expected {
        ParamType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },
        ParamType::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().and_then(integral))
                }
                _ => None,
            };
            parsed.map(Value::from).ok_or_else(mismatch)
        }
        ParamType::Number => {
            let parsed = match value {
                Value::Number(_) => return Ok(value.clone()),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch)
        }
        ParamType::Boolean => {
            let parsed = match value {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(1) => Some(true),
                    Some(0) => Some(false),
                    _ => None,
                },
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" => Some(true),
                    "false" | "no" | "0" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            parsed.map(Value::Bool).ok_or_else(mismatch)
        }
        ParamType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
        ParamType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(f as i64)
    } else {
        None
    }
}

fn type_label(t: ParamType) -> &'static str {
    match t {
        ParamType::String => "a string",
        ParamType::Integer => "an integer",
        ParamType::Number => "a number",
        ParamType::Boolean => "a boolean",
        ParamType::Array => "an array",
        ParamType::Object => "an object",
    }
}
