use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::agent::tools::ToolSpec;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

pub struct CompletionRequest<'a> {
    pub system_prompt: &'a str,
    pub history: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub thought: Option<String>,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelOutput {
    FinalAnswer(String),
    ToolCall(ToolCallRequest),
}

/// Narrow seam to a language-model backend. Implementations may block on I/O
/// and should honour `req.timeout`.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<ModelOutput, GatewayError>;
}

pub fn render_tool_instructions(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return String::from(
            "No tools are available for this reply.\n\
             Reply with exactly one JSON object and nothing else:\n\
             {\"thought\": \"<reasoning>\", \"final_answer\": \"<answer>\"}",
        );
    }
    let mut s = String::from("You can call these tools:\n");
    for t in tools {
        s.push_str(&format!("- {}\n", t.to_schema()));
    }
    s.push_str(
        "\nReply with exactly one JSON object and nothing else. To call a tool:\n\
         {\"thought\": \"<reasoning>\", \"action\": \"<tool name>\", \"arguments\": {...}}\n\
         To answer the user:\n\
         {\"thought\": \"<reasoning>\", \"final_answer\": \"<answer>\"}\n\
         Never include both \"action\" and \"final_answer\".",
    );
    s
}

fn fence_re() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok()).as_ref()
}

fn strip_fences(raw: &str) -> &str {
    fence_re()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
}

/// Interprets raw model text under the JSON reply protocol. Anything ambiguous
/// is `MalformedOutput`; nothing is guessed.
pub fn parse_model_output(raw: &str, tools: &[ToolSpec]) -> Result<ModelOutput, GatewayError> {
    let body = strip_fences(raw.trim());
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(GatewayError::malformed("no JSON object in model output"));
    };
    if end < start {
        return Err(GatewayError::malformed("no JSON object in model output"));
    }
    let v: Value = serde_json::from_str(&body[start..=end]).map_err(|e| GatewayError::malformed(format!("invalid JSON: {}", e)))?;
    let Value::Object(obj) = v else {
        return Err(GatewayError::malformed("model output is not a JSON object"));
    };
    let thought = obj.get("thought").and_then(|t| t.as_str()).map(str::to_string);
    let final_answer = obj.get("final_answer").filter(|v| !v.is_null());
    let action = obj.get("action").filter(|v| !v.is_null());
    match (final_answer, action) {
        (Some(_), Some(_)) => Err(GatewayError::malformed("output mixes final_answer and action")),
        (None, None) => Err(GatewayError::malformed("output has neither final_answer nor action")),
        (Some(answer), None) => match answer {
            Value::String(s) => Ok(ModelOutput::FinalAnswer(s.clone())),
            Value::Number(n) => Ok(ModelOutput::FinalAnswer(n.to_string())),
            Value::Bool(b) => Ok(ModelOutput::FinalAnswer(b.to_string())),
            _ => Err(GatewayError::malformed("final_answer must be a scalar")),
        },
        (None, Some(action)) => {
            let name = action.as_str().ok_or_else(|| GatewayError::malformed("action must be a string"))?;
            if !tools.iter().any(|t| t.name == name) {
                return Err(GatewayError::malformed(format!("requested unavailable tool: {}", name)));
            }
            let arguments = match obj.get("arguments") {
                None | Some(Value::Null) => json!({}),
                Some(a @ Value::Object(_)) => a.clone(),
                Some(_) => return Err(GatewayError::malformed("arguments must be an object")),
            };
            Ok(ModelOutput::ToolCall(ToolCallRequest { thought, name: name.to_string(), arguments }))
        }
    }
}

fn full_system_prompt(req: &CompletionRequest<'_>) -> String {
    format!("{}\n\n{}", req.system_prompt, render_tool_instructions(req.tools))
}

#[derive(Clone)]
pub struct OllamaGateway {
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
    client: reqwest::Client,
}

impl OllamaGateway {
    pub fn new(host: impl Into<String>, model: impl Into<String>, temperature: Option<f32>) -> Self {
        Self { host: host.into(), model: model.into(), temperature, client: reqwest::Client::new() }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    stream: bool,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")] options: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<ModelOutput, GatewayError> {
        let url = format!("{}/api/chat", self.host.trim_end_matches('/'));
        let mut messages = vec![json!({"role": "system", "content": full_system_prompt(&req)})];
        messages.extend(req.history.iter().map(|m| json!({"role": m.role, "content": m.content})));
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format: "json",
            options: self.temperature.map(|t| json!({"temperature": t})),
        };
        let resp = self.client.post(url).json(&body).timeout(req.timeout).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::transport(format!("model call failed: {}", resp.status())));
        }
        let v: OllamaChatResponse = resp.json().await?;
        debug!(model = %self.model, chars = v.message.content.len(), "ollama completion");
        parse_model_output(&v.message.content, req.tools)
    }
}

#[derive(Clone)]
pub struct OpenAiCompatibleGateway {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatibleGateway {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>, temperature: Option<f32>) -> Self {
        Self { base_url: base_url.into(), api_key, model: model.into(), temperature, client: reqwest::Client::new() }
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

#[async_trait]
impl ModelGateway for OpenAiCompatibleGateway {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<ModelOutput, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut messages = vec![json!({"role": "system", "content": full_system_prompt(&req)})];
        // tool-role messages need native tool_call ids here, so observations go in as user text
        messages.extend(req.history.iter().map(|m| match m.role {
            ChatRole::Tool => json!({"role": "user", "content": format!("Observation: {}", m.content)}),
            role => json!({"role": role, "content": m.content}),
        }));
        let body = OaiChatRequest { model: &self.model, messages, temperature: self.temperature };
        let mut rb = self.client.post(url).json(&body).timeout(req.timeout);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::transport(format!("model call failed: {}", resp.status())));
        }
        let v: OaiChatResponse = resp.json().await?;
        let content = v
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GatewayError::malformed("response has no message content"))?;
        parse_model_output(&content, req.tools)
    }
}
