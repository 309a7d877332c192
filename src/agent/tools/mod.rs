use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::{ArgumentProblem, RegistryError, ToolError};
use crate::storage::MemoryStore;

pub mod calculator;
pub mod clock;
pub mod memory_search;
pub mod web;

pub struct ToolContext<'a> {
    pub session_id: &'a str,
    pub memory: &'a dyn MemoryStore,
    pub embedder: &'a dyn Embedder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn accepts(&self, v: &Value) -> bool {
        match self {
            ParamKind::String => v.is_string(),
            ParamKind::Integer => v.is_i64() || v.is_u64(),
            ParamKind::Number => v.is_number(),
            ParamKind::Boolean => v.is_boolean(),
            ParamKind::Object => v.is_object(),
            ParamKind::Array => v.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self { name: name.into(), kind, description: description.into(), required: true, default: None }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str, default: Option<Value>) -> Self {
        Self { name: name.into(), kind, description: description.into(), required: false, default }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

impl ToolSpec {
    /// JSON-schema view shown to the model.
    pub fn to_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({ "type": p.kind.as_str(), "description": p.description });
            if let Some(d) = &p.default {
                prop["default"] = d.clone();
            }
            properties.insert(p.name.clone(), prop);
        }
        let required: Vec<&str> = self.parameters.iter().filter(|p| p.required).map(|p| p.name.as_str()).collect();
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": { "type": "object", "properties": properties, "required": required },
        })
    }
}

/// What a capability hands back on success.
#[derive(Debug)]
pub struct ToolOutput {
    pub summary: String,
    pub data: Option<Value>,
}

impl ToolOutput {
    pub fn text(summary: impl Into<String>) -> Self {
        Self { summary: summary.into(), data: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    ExecutionError,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::ExecutionError => "execution_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    pub fn ok(out: ToolOutput) -> Self {
        Self { success: true, summary: out.summary, data: out.data, error: None }
    }

    pub fn failed(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { success: false, summary: message.clone(), data: None, error: Some(ToolFailure { kind, message }) }
    }

    pub fn from_tool_error(err: &ToolError) -> Self {
        let kind = match err {
            ToolError::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolError::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
        };
        Self::failed(kind, err.to_string())
    }

    /// Text the model sees for this result.
    pub fn observation(&self) -> String {
        match (&self.error, &self.data) {
            (Some(f), _) => format!("error ({}): {}", f.kind.as_str(), f.message),
            (None, Some(data)) => format!("{}\n{}", self.summary, data),
            (None, None) => self.summary.clone(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput>;
}

struct RegisteredTool {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

#[derive(Debug, Clone, Default)]
pub struct DefaultToolOptions {
    pub fetch_allowlist: Vec<String>,
}

/// Read-only after startup; lookups take no locks.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn with_default_tools(opts: DefaultToolOptions) -> anyhow::Result<Self> {
        let mut r = Self::new();
        r.register(Arc::new(calculator::CalculatorTool))?;
        r.register(Arc::new(clock::CurrentTimeTool))?;
        r.register(Arc::new(memory_search::MemorySearchTool))?;
        r.register(Arc::new(web::WebSearchTool::new()))?;
        r.register(Arc::new(web::FetchUrlTool::new(opts.fetch_allowlist)?))?;
        Ok(r)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        if self.tools.iter().any(|t| t.spec.name == spec.name) {
            return Err(RegistryError::DuplicateTool(spec.name));
        }
        info!(tool = %spec.name, "registered tool");
        self.tools.push(RegisteredTool { spec, tool });
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<&RegisteredTool, ToolError> {
        self.tools.iter().find(|t| t.spec.name == name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        self.entry(name).map(|t| &t.spec)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validates then runs. Capability failures come back as an unsuccessful
    /// `ToolResult`; only lookup and schema failures are `Err`.
    pub async fn invoke(&self, name: &str, args: Value, ctx: ToolContext<'_>) -> Result<ToolResult, ToolError> {
        let entry = self.entry(name)?;
        let args = validate_arguments(&entry.spec, args)?;
        debug!(tool = name, "invoking tool");
        match entry.tool.run(ctx, args).await {
            Ok(out) => Ok(ToolResult::ok(out)),
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                Ok(ToolResult::failed(ToolErrorKind::ExecutionError, format!("{e:#}")))
            }
        }
    }
}

/// Checks `args` against the declared parameters and fills defaults.
/// Every offending parameter is reported, not just the first.
pub fn validate_arguments(spec: &ToolSpec, args: Value) -> Result<Value, ToolError> {
    let mut obj = match args {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            return Err(ToolError::InvalidArguments {
                tool: spec.name.clone(),
                problems: vec![ArgumentProblem { param: "*".into(), reason: format!("expected an object, got {}", kind_of(&other)) }],
            });
        }
    };
    let mut problems = Vec::new();
    for p in &spec.parameters {
        match obj.get(&p.name) {
            None | Some(Value::Null) => {
                if p.required {
                    problems.push(ArgumentProblem { param: p.name.clone(), reason: "missing required parameter".into() });
                } else if let Some(d) = &p.default {
                    obj.insert(p.name.clone(), d.clone());
                } else {
                    obj.remove(&p.name);
                }
            }
            Some(v) if !p.kind.accepts(v) => {
                problems.push(ArgumentProblem { param: p.name.clone(), reason: format!("expected {}, got {}", p.kind.as_str(), kind_of(v)) });
            }
            Some(_) => {}
        }
    }
    let mut unknown: Vec<&String> = obj.keys().filter(|k| !spec.parameters.iter().any(|p| &p.name == *k)).collect();
    unknown.sort();
    for k in unknown {
        problems.push(ArgumentProblem { param: k.clone(), reason: "unknown parameter".into() });
    }
    if problems.is_empty() {
        Ok(Value::Object(obj))
    } else {
        Err(ToolError::InvalidArguments { tool: spec.name.clone(), problems })
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
